//! Arm Ethos-U operator capability table.
//!
//! The predicate is a pure function of operator kind, attributes and the
//! types of the tensors involved. Variant-specific limits (shared buffer
//! size) are checked later by the backend.

use std::fmt::Debug;

use ethosu_ir::{DType, Graph, Node, Op, Padding, TensorInfo, TensorType};

/// Outcome of a capability query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupportDecision {
    Supported,
    Unsupported(String),
}

impl SupportDecision {
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Supported)
    }

    /// The rejection reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Supported => None,
            Self::Unsupported(r) => Some(r),
        }
    }
}

/// Answers whether an accelerator can execute a node.
pub trait OperatorSupport: Debug {
    /// Human-readable hardware name.
    fn hardware_name(&self) -> &str;

    /// Compiler tag recorded on region markers.
    fn compiler(&self) -> &str;

    /// Decides support for `op` given its operand and result tensors.
    fn check_op(&self, op: &Op, inputs: &[&TensorInfo], outputs: &[&TensorInfo]) -> SupportDecision;

    /// Decides support for a node of `graph`.
    fn check(&self, graph: &Graph, node: &Node) -> SupportDecision {
        let lookup = |ids: &[ethosu_ir::TensorId]| -> Option<Vec<&TensorInfo>> {
            ids.iter().map(|&t| graph.tensor(t).ok()).collect()
        };
        match (lookup(&node.inputs), lookup(&node.outputs)) {
            (Some(inputs), Some(outputs)) => self.check_op(&node.op, &inputs, &outputs),
            _ => SupportDecision::Unsupported("references an unknown tensor".into()),
        }
    }
}

/// Capability table shared by every Ethos-U55 and Ethos-U65 variant.
#[derive(Clone, Copy, Debug, Default)]
pub struct EthosUSupport;

const MAX_DIM: usize = 65536;
const MAX_STRIDE: usize = 3;
const MAX_DILATION: usize = 2;
const MAX_CONV_KERNEL: usize = 64;
const MAX_POOL_KERNEL: usize = 256;

type Check = Result<(), String>;

fn fail<T>(reason: impl Into<String>) -> Result<T, String> {
    Err(reason.into())
}

fn activation(ty: &TensorType, what: &str) -> Check {
    if !matches!(ty.dtype, DType::Int8 | DType::UInt8) {
        return fail(format!("{what} has type {}, expected int8 or uint8", ty.dtype));
    }
    match &ty.quant {
        None => return fail(format!("{what} is not quantized")),
        Some(q) if q.is_per_channel() => {
            return fail(format!("{what} uses per-channel quantization"));
        }
        Some(_) => {}
    }
    if ty.shape.rank() > 4 {
        return fail(format!("{what} has rank {} (max 4)", ty.shape.rank()));
    }
    if ty.shape.rank() == 4 && ty.shape.dims[0] != 1 {
        return fail(format!("{what} has batch {} (must be 1)", ty.shape.dims[0]));
    }
    if let Some(&d) = ty.shape.dims.iter().find(|&&d| d > MAX_DIM || d == 0) {
        return fail(format!("{what} has dimension {d} outside 1..={MAX_DIM}"));
    }
    Ok(())
}

fn int8_only(ty: &TensorType, what: &str) -> Check {
    if ty.dtype != DType::Int8 {
        return fail(format!("{what} must be int8, got {}", ty.dtype));
    }
    Ok(())
}

fn weights(info: &TensorInfo, rank: usize) -> Check {
    if info.constant.is_none() {
        return fail("weights must be constant");
    }
    if info.ty.dtype != DType::Int8 {
        return fail(format!("weights have type {}, expected int8", info.ty.dtype));
    }
    if info.ty.shape.rank() != rank {
        return fail(format!("weights have shape {}, expected rank {rank}", info.ty.shape));
    }
    match &info.ty.quant {
        Some(q) if q.zero_points.iter().all(|&z| z == 0) => Ok(()),
        Some(_) => fail("weights must be symmetrically quantized"),
        None => fail("weights are not quantized"),
    }
}

fn bias(info: Option<&&TensorInfo>) -> Check {
    let Some(info) = info else {
        return Ok(());
    };
    if info.constant.is_none() {
        return fail("bias must be constant");
    }
    if info.ty.dtype != DType::Int32 {
        return fail(format!("bias has type {}, expected int32", info.ty.dtype));
    }
    Ok(())
}

fn limit(value: usize, max: usize, what: &str) -> Check {
    if value == 0 || value > max {
        return fail(format!("{what} {value} outside 1..={max}"));
    }
    Ok(())
}

fn same_quant(a: &TensorType, b: &TensorType, what: &str) -> Check {
    if a.quant != b.quant || a.dtype != b.dtype {
        return fail(format!("{what} must keep the input quantization"));
    }
    Ok(())
}

fn operand<'a>(list: &[&'a TensorInfo], i: usize, what: &str) -> Result<&'a TensorInfo, String> {
    list.get(i).copied().ok_or_else(|| format!("missing {what}"))
}

fn check(op: &Op, inputs: &[&TensorInfo], outputs: &[&TensorInfo]) -> Check {
    if op.is_marker() {
        return fail("boundary markers are never offloaded");
    }
    if outputs.len() != 1 {
        return fail(format!("expected one result, got {}", outputs.len()));
    }
    let ifm = operand(inputs, 0, "input")?;
    let ofm = outputs[0];
    if ifm.constant.is_some() {
        return fail("input feature map is constant");
    }
    activation(&ifm.ty, "input")?;
    activation(&ofm.ty, "output")?;

    match op {
        Op::Sigmoid | Op::Tanh => {
            int8_only(&ifm.ty, "input")?;
            int8_only(&ofm.ty, "output")
        }
        Op::Relu | Op::Relu6 | Op::ReluN1To1 => {
            if ifm.ty.dtype != ofm.ty.dtype {
                return fail("input and output types differ");
            }
            Ok(())
        }
        Op::Add { .. } | Op::Sub { .. } | Op::Mul { .. } => {
            let ifm2 = operand(inputs, 1, "second input")?;
            activation(&ifm2.ty, "second input")?;
            if ifm.ty.shape != ifm2.ty.shape || ifm.ty.shape != ofm.ty.shape {
                return fail(format!(
                    "operand shapes {} and {} differ (broadcasting is not supported)",
                    ifm.ty.shape, ifm2.ty.shape
                ));
            }
            if ifm.ty.dtype != ifm2.ty.dtype || ifm.ty.dtype != ofm.ty.dtype {
                return fail("operand types differ");
            }
            Ok(())
        }
        Op::Conv2d(attrs) | Op::DepthwiseConv2d(attrs) => {
            if ifm.ty.shape.rank() != 4 {
                return fail("input must be NHWC");
            }
            let w = operand(inputs, 1, "weights")?;
            weights(w, 4)?;
            bias(inputs.get(2))?;
            let dims = &w.ty.shape.dims;
            limit(dims[1], MAX_CONV_KERNEL, "kernel height")?;
            limit(dims[2], MAX_CONV_KERNEL, "kernel width")?;
            limit(attrs.stride[0], MAX_STRIDE, "stride")?;
            limit(attrs.stride[1], MAX_STRIDE, "stride")?;
            limit(attrs.dilation[0], MAX_DILATION, "dilation")?;
            limit(attrs.dilation[1], MAX_DILATION, "dilation")?;
            if matches!(op, Op::DepthwiseConv2d(_)) && dims[3] != ifm.ty.shape.dims[3] {
                return fail("depth multiplier must be 1");
            }
            Ok(())
        }
        Op::FullyConnected { .. } => {
            if ifm.ty.shape.rank() != 2 || ifm.ty.shape.dims[0] != 1 {
                return fail(format!("input shape {} must be [1, N]", ifm.ty.shape));
            }
            weights(operand(inputs, 1, "weights")?, 2)?;
            bias(inputs.get(2))
        }
        Op::MaxPool2d(attrs) | Op::AvgPool2d(attrs) => {
            if ifm.ty.shape.rank() != 4 {
                return fail("input must be NHWC");
            }
            limit(attrs.kernel[0], MAX_POOL_KERNEL, "kernel height")?;
            limit(attrs.kernel[1], MAX_POOL_KERNEL, "kernel width")?;
            limit(attrs.stride[0], MAX_STRIDE, "stride")?;
            limit(attrs.stride[1], MAX_STRIDE, "stride")?;
            if matches!(op, Op::MaxPool2d(_)) {
                same_quant(&ifm.ty, &ofm.ty, "max pooling")
            } else if attrs.padding != Padding::Valid {
                fail("average pooling supports VALID padding only")
            } else {
                Ok(())
            }
        }
        Op::Reshape => {
            if ifm.ty.shape.num_elements() != ofm.ty.shape.num_elements() {
                return fail("reshape changes the element count");
            }
            same_quant(&ifm.ty, &ofm.ty, "reshape")
        }
        Op::Softmax { .. } => fail("SOFTMAX has no accelerator lowering"),
        Op::RegionBegin { .. } | Op::RegionEnd { .. } => fail("boundary marker"),
    }
}

impl OperatorSupport for EthosUSupport {
    fn hardware_name(&self) -> &str {
        "Arm Ethos-U"
    }

    fn compiler(&self) -> &str {
        "ethos-u"
    }

    fn check_op(&self, op: &Op, inputs: &[&TensorInfo], outputs: &[&TensorInfo]) -> SupportDecision {
        match check(op, inputs, outputs) {
            Ok(()) => SupportDecision::Supported,
            Err(reason) => SupportDecision::Unsupported(reason),
        }
    }
}
