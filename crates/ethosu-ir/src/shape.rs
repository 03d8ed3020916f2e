//! Static shape inference for graph operators.
//!
//! Spatial operators work on NHWC activations. Convolution weights are
//! OHWI, depthwise weights are `[1, KH, KW, C * multiplier]` and fully
//! connected weights are `[O, I]`.

use crate::error::IrError;
use crate::graph::{Op, Padding};
use crate::types::{Shape, TensorType};

/// Output extent and implicit padding along one spatial axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub out: usize,
    pub pad_before: usize,
    pub pad_after: usize,
}

/// Computes the output extent of a sliding window along one axis.
pub fn window(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    padding: Padding,
) -> Result<Window, IrError> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return Err(IrError::ShapeMismatch {
            context: "window".into(),
            expected: "non-zero kernel, stride and dilation".into(),
            found: format!("kernel={kernel} stride={stride} dilation={dilation}"),
        });
    }
    let effective = (kernel - 1) * dilation + 1;
    match padding {
        Padding::Same => {
            let out = input.div_ceil(stride);
            let total = ((out.saturating_sub(1)) * stride + effective).saturating_sub(input);
            let pad_before = total / 2;
            Ok(Window {
                out,
                pad_before,
                pad_after: total - pad_before,
            })
        }
        Padding::Valid => {
            if input < effective {
                return Err(IrError::ShapeMismatch {
                    context: "window (VALID)".into(),
                    expected: format!("input extent >= {effective}"),
                    found: input.to_string(),
                });
            }
            Ok(Window {
                out: (input - effective) / stride + 1,
                pad_before: 0,
                pad_after: 0,
            })
        }
    }
}

fn nhwc(ty: &TensorType, node: &str) -> Result<[usize; 4], IrError> {
    if ty.shape.rank() != 4 {
        return Err(IrError::InvalidOperand {
            node: node.into(),
            reason: format!("expected NHWC activation, got {}", ty.shape),
        });
    }
    Ok([ty.shape.dims[0], ty.shape.dims[1], ty.shape.dims[2], ty.shape.dims[3]])
}

fn operand<'a>(inputs: &[&'a TensorType], i: usize, node: &str) -> Result<&'a TensorType, IrError> {
    inputs.get(i).copied().ok_or_else(|| IrError::InvalidOperand {
        node: node.into(),
        reason: format!("missing operand {i}"),
    })
}

/// Infers the output shape of `op` applied to `inputs`.
///
/// `Reshape` and the boundary markers carry their output shape explicitly
/// and are rejected here.
pub fn infer_output_shape(op: &Op, inputs: &[&TensorType]) -> Result<Shape, IrError> {
    let node = op.name();
    match op {
        Op::Sigmoid | Op::Tanh | Op::Relu | Op::Relu6 | Op::ReluN1To1 | Op::Softmax { .. } => {
            Ok(operand(inputs, 0, node)?.shape.clone())
        }
        Op::Add { .. } | Op::Sub { .. } | Op::Mul { .. } => {
            let a = operand(inputs, 0, node)?;
            let b = operand(inputs, 1, node)?;
            if a.shape != b.shape {
                return Err(IrError::ShapeMismatch {
                    context: node.into(),
                    expected: a.shape.to_string(),
                    found: b.shape.to_string(),
                });
            }
            Ok(a.shape.clone())
        }
        Op::Conv2d(attrs) | Op::DepthwiseConv2d(attrs) => {
            let [n, h, w, c] = nhwc(operand(inputs, 0, node)?, node)?;
            let weights = operand(inputs, 1, node)?;
            if weights.shape.rank() != 4 {
                return Err(IrError::InvalidOperand {
                    node: node.into(),
                    reason: format!("expected 4-D weights, got {}", weights.shape),
                });
            }
            let [wo, kh, kw, wi] = [
                weights.shape.dims[0],
                weights.shape.dims[1],
                weights.shape.dims[2],
                weights.shape.dims[3],
            ];
            let out_c = if matches!(op, Op::Conv2d(_)) {
                if wi != c {
                    return Err(IrError::ShapeMismatch {
                        context: format!("{node} input channels"),
                        expected: c.to_string(),
                        found: wi.to_string(),
                    });
                }
                wo
            } else {
                if wo != 1 || c == 0 || wi % c != 0 {
                    return Err(IrError::InvalidOperand {
                        node: node.into(),
                        reason: format!("depthwise weights {} do not match {c} channels", weights.shape),
                    });
                }
                wi
            };
            let y = window(h, kh, attrs.stride[0], attrs.dilation[0], attrs.padding)?;
            let x = window(w, kw, attrs.stride[1], attrs.dilation[1], attrs.padding)?;
            if let Some(bias) = inputs.get(2)
                && bias.shape.num_elements() != out_c
            {
                return Err(IrError::ShapeMismatch {
                    context: format!("{node} bias"),
                    expected: out_c.to_string(),
                    found: bias.shape.to_string(),
                });
            }
            Ok(Shape::new([n, y.out, x.out, out_c]))
        }
        Op::FullyConnected { .. } => {
            let input = operand(inputs, 0, node)?;
            let weights = operand(inputs, 1, node)?;
            if input.shape.rank() != 2 || weights.shape.rank() != 2 {
                return Err(IrError::InvalidOperand {
                    node: node.into(),
                    reason: format!("expected 2-D input and weights, got {} and {}", input.shape, weights.shape),
                });
            }
            if input.shape.dims[1] != weights.shape.dims[1] {
                return Err(IrError::ShapeMismatch {
                    context: format!("{node} inner dimension"),
                    expected: input.shape.dims[1].to_string(),
                    found: weights.shape.dims[1].to_string(),
                });
            }
            Ok(Shape::new([input.shape.dims[0], weights.shape.dims[0]]))
        }
        Op::MaxPool2d(attrs) | Op::AvgPool2d(attrs) => {
            let [n, h, w, c] = nhwc(operand(inputs, 0, node)?, node)?;
            let y = window(h, attrs.kernel[0], attrs.stride[0], 1, attrs.padding)?;
            let x = window(w, attrs.kernel[1], attrs.stride[1], 1, attrs.padding)?;
            Ok(Shape::new([n, y.out, x.out, c]))
        }
        Op::Reshape | Op::RegionBegin { .. } | Op::RegionEnd { .. } => Err(IrError::InvalidOperand {
            node: node.into(),
            reason: "output shape is not inferable".into(),
        }),
    }
}
