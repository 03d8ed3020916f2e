//! Lowering of region operators to accelerator steps.
//!
//! Each graph node becomes one [`Step`]: the feature maps it reads and
//! writes (still as tensor ids, placed later by the memory planner), the
//! register setup commands and the operation command. Weights, scale
//! records and lookup tables are appended to the constant blob while
//! lowering.

use std::collections::HashMap;

use ethosu_backend_core::command::{Command, ElementwiseOp, Kernel, PaddingBox, PoolMode, Scale};
use ethosu_backend_core::numeric::{ScaleRecord, WeightLayout};
use ethosu_backend_core::{AcceleratorVariant, BackendError};
use ethosu_ir::shape::window;
use ethosu_ir::{
    Conv2dAttrs, FusedActivation, Graph, Node, Op, Padding, Pool2dAttrs, Tensor, TensorId,
    TensorType,
};
use ethosu_opt::quantize_multiplier;

use crate::constants::{ConstantBlob, build_lut, pack_records, pack_weights};

/// Left shift applied to both operands of an add or subtract.
pub(crate) const ELEMENTWISE_SHIFT: u8 = 20;

/// The operation a step launches once its feature maps are placed.
#[derive(Debug)]
pub(crate) enum StepOp {
    Launch(Command),
    /// Byte copy from the IFM to the OFM.
    Dma { length: u32 },
}

/// One accelerator operation with symbolic feature maps.
#[derive(Debug)]
pub(crate) struct Step {
    pub(crate) node: String,
    pub(crate) ifm: TensorId,
    pub(crate) ifm2: Option<TensorId>,
    pub(crate) ofm: TensorId,
    /// Zero point the output stage adds instead of the OFM tensor's own.
    pub(crate) ofm_zero_point: Option<i32>,
    pub(crate) setup: Vec<Command>,
    pub(crate) op: StepOp,
}

impl Step {
    fn new(node: &Node, ifm: TensorId, ofm: TensorId, setup: Vec<Command>, op: StepOp) -> Self {
        Self {
            node: node.name.clone(),
            ifm,
            ifm2: None,
            ofm,
            ofm_zero_point: None,
            setup,
            op,
        }
    }
}

fn unsupported(node: &Node, reason: impl Into<String>) -> BackendError {
    BackendError::Unsupported {
        node: node.name.clone(),
        reason: reason.into(),
    }
}

fn fixed_scale(node: &Node, real: f64) -> Result<Scale, BackendError> {
    quantize_multiplier(real).map_err(|e| unsupported(node, e.to_string()))
}

fn quant(node: &Node, ty: &TensorType) -> Result<(f64, i32), BackendError> {
    match &ty.quant {
        Some(q) => Ok((q.scale() as f64, q.zero_point())),
        None => Err(unsupported(node, format!("tensor of type {ty} is not quantized"))),
    }
}

/// Output clamp for `act` expressed in the quantized domain of `ty`.
fn activation(node: &Node, act: FusedActivation, ty: &TensorType) -> Result<Command, BackendError> {
    let (lo, hi) = ty
        .dtype
        .int_range()
        .ok_or_else(|| unsupported(node, format!("output type {} is not an integer", ty.dtype)))?;
    let (scale, zp) = quant(node, ty)?;
    let (real_lo, real_hi) = act.real_range();
    let bound = |real: f64, default: i64| {
        if real.is_finite() {
            (zp as i64 + (real / scale).round() as i64).clamp(lo, hi)
        } else {
            default
        }
    };
    Ok(Command::SetActivation {
        min: bound(real_lo, lo) as i32,
        max: bound(real_hi, hi) as i32,
        lut: None,
    })
}

fn padding_box(
    node: &Node,
    input: [usize; 2],
    kernel: [usize; 2],
    stride: [usize; 2],
    dilation: [usize; 2],
    padding: Padding,
) -> Result<PaddingBox, BackendError> {
    let y = window(input[0], kernel[0], stride[0], dilation[0], padding)?;
    let x = window(input[1], kernel[1], stride[1], dilation[1], padding)?;
    let narrow = |v: usize| u8::try_from(v).map_err(|_| unsupported(node, format!("padding {v} too large")));
    Ok(PaddingBox {
        top: narrow(y.pad_before)?,
        left: narrow(x.pad_before)?,
        bottom: narrow(y.pad_after)?,
        right: narrow(x.pad_after)?,
    })
}

fn kernel(kernel: [usize; 2], stride: [usize; 2], dilation: [usize; 2]) -> Kernel {
    Kernel {
        height: kernel[0] as u16,
        width: kernel[1] as u16,
        stride: [stride[0] as u8, stride[1] as u8],
        dilation: [dilation[0] as u8, dilation[1] as u8],
    }
}

/// Lowers the nodes of one region graph.
pub(crate) struct Lowering<'a> {
    graph: &'a Graph,
    variant: AcceleratorVariant,
    blob: ConstantBlob,
    /// Constant feature maps stored in the blob, by blob offset.
    constant_maps: HashMap<TensorId, u32>,
}

impl<'a> Lowering<'a> {
    pub(crate) fn new(graph: &'a Graph, variant: AcceleratorVariant) -> Self {
        Self {
            graph,
            variant,
            blob: ConstantBlob::default(),
            constant_maps: HashMap::new(),
        }
    }

    /// The constant blob and the blob offsets of constant feature maps.
    pub(crate) fn finish(self) -> (Vec<u8>, HashMap<TensorId, u32>) {
        (self.blob.into_bytes(), self.constant_maps)
    }

    fn ty(&self, id: TensorId) -> Result<&'a TensorType, BackendError> {
        Ok(&self.graph.tensor(id)?.ty)
    }

    fn constant(&self, node: &Node, id: TensorId, what: &str) -> Result<&'a Tensor, BackendError> {
        self.graph
            .tensor(id)?
            .constant
            .as_ref()
            .ok_or_else(|| unsupported(node, format!("{what} must be constant")))
    }

    fn io(&self, node: &Node) -> Result<(TensorId, TensorId), BackendError> {
        match (node.inputs.first(), node.outputs.as_slice()) {
            (Some(&ifm), [ofm]) => Ok((ifm, *ofm)),
            _ => Err(unsupported(node, "expected one input and one output")),
        }
    }

    /// Lowers one node.
    pub(crate) fn lower(&mut self, node: &Node) -> Result<Step, BackendError> {
        match &node.op {
            Op::Conv2d(attrs) => self.conv(node, attrs, ConvKind::Regular),
            Op::DepthwiseConv2d(attrs) => self.conv(node, attrs, ConvKind::Depthwise),
            Op::FullyConnected { activation } => {
                let attrs = Conv2dAttrs {
                    activation: *activation,
                    ..Conv2dAttrs::default()
                };
                self.conv(node, &attrs, ConvKind::FullyConnected)
            }
            Op::MaxPool2d(attrs) => self.pool(node, attrs, PoolMode::Max),
            Op::AvgPool2d(attrs) => self.pool(node, attrs, PoolMode::Average),
            Op::Relu | Op::Relu6 | Op::ReluN1To1 => {
                let act = node.op.as_activation().unwrap_or_default();
                self.clamp(node, act)
            }
            Op::Sigmoid => self.lut(node, |x| 1.0 / (1.0 + (-x).exp())),
            Op::Tanh => self.lut(node, f64::tanh),
            Op::Add { activation } => self.elementwise(node, ElementwiseOp::Add, *activation),
            Op::Sub { activation } => self.elementwise(node, ElementwiseOp::Sub, *activation),
            Op::Mul { activation } => self.elementwise(node, ElementwiseOp::Mul, *activation),
            Op::Reshape => {
                let (ifm, ofm) = self.io(node)?;
                let length = self.ty(ofm)?.size_bytes() as u32;
                Ok(Step::new(node, ifm, ofm, Vec::new(), StepOp::Dma { length }))
            }
            Op::Softmax { .. } | Op::RegionBegin { .. } | Op::RegionEnd { .. } => {
                Err(unsupported(node, format!("{} has no accelerator lowering", node.op.name())))
            }
        }
    }

    fn conv(&mut self, node: &Node, attrs: &Conv2dAttrs, kind: ConvKind) -> Result<Step, BackendError> {
        let (ifm, ofm) = self.io(node)?;
        let w_id = *node
            .inputs
            .get(1)
            .ok_or_else(|| unsupported(node, "missing weights"))?;
        let weights = self.constant(node, w_id, "weights")?;
        let (in_ty, out_ty) = (self.ty(ifm)?, self.ty(ofm)?);

        let dims = weights.shape().dims;
        let (ofm_depth, kh, kw, ifm_depth) = match (kind, dims.as_slice()) {
            (ConvKind::FullyConnected, &[o, i]) => (o, 1, 1, i),
            (ConvKind::Depthwise, &[1, kh, kw, c]) => (c, kh, kw, 1),
            (ConvKind::Regular, &[o, kh, kw, i]) => (o, kh, kw, i),
            _ => return Err(unsupported(node, format!("unexpected weight shape {}", weights.shape()))),
        };

        let block_bytes = self.variant.ofm_block_depth() * kh * kw * ifm_depth;
        let budget = self.variant.shram_bytes() / 2;
        if block_bytes > budget {
            return Err(unsupported(
                node,
                format!(
                    "weight block of {block_bytes} bytes exceeds the {budget}-byte half of the shared buffer on {}",
                    self.variant
                ),
            ));
        }

        let layout = WeightLayout {
            ofm_depth,
            kernel_height: kh,
            kernel_width: kw,
            ifm_depth,
            block_depth: self.variant.ofm_block_depth(),
        };
        let depthwise = kind == ConvKind::Depthwise;
        let packed = pack_weights(&weights.int_values(), &layout, depthwise);
        let (w_off, w_len) = self.blob.push(&packed);

        let (s_in, _) = quant(node, in_ty)?;
        let (s_out, _) = quant(node, out_ty)?;
        let w_quant = weights
            .quant
            .as_ref()
            .ok_or_else(|| unsupported(node, "weights are not quantized"))?;
        let bias = match node.inputs.get(2) {
            Some(&b) => self.constant(node, b, "bias")?.int_values(),
            None => Vec::new(),
        };
        let records = (0..ofm_depth)
            .map(|c| {
                let scale = fixed_scale(node, s_in * w_quant.scale_for(c) as f64 / s_out)?;
                Ok(ScaleRecord {
                    bias: bias.get(c).copied().unwrap_or(0),
                    multiplier: scale.multiplier,
                    shift: scale.shift,
                })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;
        let (s_off, s_len) = self.blob.push(&pack_records(&records));

        let (geometry, pad) = if kind == ConvKind::FullyConnected {
            (Kernel::IDENTITY, PaddingBox::default())
        } else {
            let nhwc = in_ty.shape.to_nhwc().unwrap_or([1; 4]);
            let pad = padding_box(
                node,
                [nhwc[1], nhwc[2]],
                [kh, kw],
                attrs.stride,
                attrs.dilation,
                attrs.padding,
            )?;
            (kernel([kh, kw], attrs.stride, attrs.dilation), pad)
        };

        let setup = vec![
            Command::SetKernel(geometry),
            Command::SetPadding(pad),
            Command::SetWeights {
                offset: w_off,
                length: w_len,
            },
            Command::SetScale {
                offset: s_off,
                length: s_len,
            },
            activation(node, attrs.activation, out_ty)?,
        ];
        let op = if depthwise { Command::OpDepthwise } else { Command::OpConv };
        Ok(Step::new(node, ifm, ofm, setup, StepOp::Launch(op)))
    }

    fn pool(&mut self, node: &Node, attrs: &Pool2dAttrs, mode: PoolMode) -> Result<Step, BackendError> {
        let (ifm, ofm) = self.io(node)?;
        let (in_ty, out_ty) = (self.ty(ifm)?, self.ty(ofm)?);
        let (s_in, _) = quant(node, in_ty)?;
        let (s_out, _) = quant(node, out_ty)?;
        let real = match mode {
            PoolMode::Average => s_in / (s_out * (attrs.kernel[0] * attrs.kernel[1]) as f64),
            _ => s_in / s_out,
        };
        let nhwc = in_ty.shape.to_nhwc().unwrap_or([1; 4]);
        let pad = padding_box(node, [nhwc[1], nhwc[2]], attrs.kernel, attrs.stride, [1, 1], attrs.padding)?;
        let setup = vec![
            Command::SetKernel(kernel(attrs.kernel, attrs.stride, [1, 1])),
            Command::SetPadding(pad),
            Command::SetOfmScale(fixed_scale(node, real)?),
            activation(node, attrs.activation, out_ty)?,
        ];
        Ok(Step::new(node, ifm, ofm, setup, StepOp::Launch(Command::OpPool(mode))))
    }

    /// Standalone Relu family: an identity pass with a clamped output stage.
    fn clamp(&mut self, node: &Node, act: FusedActivation) -> Result<Step, BackendError> {
        let (ifm, ofm) = self.io(node)?;
        let (s_in, _) = quant(node, self.ty(ifm)?)?;
        let out_ty = self.ty(ofm)?;
        let (s_out, _) = quant(node, out_ty)?;
        let setup = vec![
            Command::SetKernel(Kernel::IDENTITY),
            Command::SetPadding(PaddingBox::default()),
            Command::SetOfmScale(fixed_scale(node, s_in / s_out)?),
            activation(node, act, out_ty)?,
        ];
        Ok(Step::new(node, ifm, ofm, setup, StepOp::Launch(Command::OpPool(PoolMode::Identity))))
    }

    /// Table-driven activation: the output stage reproduces the input code
    /// and the LUT maps it to the result.
    fn lut(&mut self, node: &Node, f: fn(f64) -> f64) -> Result<Step, BackendError> {
        let (ifm, ofm) = self.io(node)?;
        let (in_ty, out_ty) = (self.ty(ifm)?, self.ty(ofm)?);
        let (_, zp_in) = quant(node, in_ty)?;
        let (lo, hi) = out_ty
            .dtype
            .int_range()
            .ok_or_else(|| unsupported(node, "LUT output must be an integer type"))?;
        let table = build_lut(f, in_ty, out_ty)?;
        let (offset, _) = self.blob.push(&table);
        let setup = vec![
            Command::SetKernel(Kernel::IDENTITY),
            Command::SetPadding(PaddingBox::default()),
            Command::SetOfmScale(Scale::IDENTITY),
            Command::SetActivation {
                min: lo as i32,
                max: hi as i32,
                lut: Some(offset),
            },
        ];
        let mut step = Step::new(node, ifm, ofm, setup, StepOp::Launch(Command::OpPool(PoolMode::Identity)));
        step.ofm_zero_point = Some(zp_in);
        Ok(step)
    }

    fn elementwise(
        &mut self,
        node: &Node,
        op: ElementwiseOp,
        act: FusedActivation,
    ) -> Result<Step, BackendError> {
        let (ifm, ofm) = self.io(node)?;
        let ifm2 = *node
            .inputs
            .get(1)
            .ok_or_else(|| unsupported(node, "missing second input"))?;
        let (sa, _) = quant(node, self.ty(ifm)?)?;
        let (sb, _) = quant(node, self.ty(ifm2)?)?;
        let out_ty = self.ty(ofm)?;
        let (so, _) = quant(node, out_ty)?;

        let (ifm_scale, ifm2_scale, ofm_scale, left_shift) = match op {
            ElementwiseOp::Add | ElementwiseOp::Sub => {
                let twice_max = 2.0 * sa.max(sb);
                let out = twice_max / ((1u64 << ELEMENTWISE_SHIFT) as f64 * so);
                (
                    fixed_scale(node, sa / twice_max)?,
                    fixed_scale(node, sb / twice_max)?,
                    fixed_scale(node, out)?,
                    ELEMENTWISE_SHIFT,
                )
            }
            ElementwiseOp::Mul => (
                Scale::IDENTITY,
                Scale::IDENTITY,
                fixed_scale(node, sa * sb / so)?,
                0,
            ),
        };

        for id in [ifm, ifm2] {
            if let Some(value) = self.graph.tensor(id)?.constant.as_ref()
                && !self.constant_maps.contains_key(&id)
            {
                let (offset, _) = self.blob.push(&value.to_le_bytes());
                self.constant_maps.insert(id, offset);
            }
        }

        let setup = vec![
            Command::SetIfmScale(ifm_scale),
            Command::SetIfm2Scale(ifm2_scale),
            Command::SetOfmScale(ofm_scale),
            activation(node, act, out_ty)?,
        ];
        let mut step = Step::new(
            node,
            ifm,
            ofm,
            setup,
            StepOp::Launch(Command::OpElementwise { op, left_shift }),
        );
        step.ifm2 = Some(ifm2);
        Ok(step)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConvKind {
    Regular,
    Depthwise,
    FullyConnected,
}
