//! Reference executor.
//!
//! Runs a graph on general-purpose float math: every operand is
//! dequantized to `f64`, the operator is evaluated exactly, and the result
//! is requantized to the output tensor's type (round half away from zero,
//! saturating). Boundary markers are identity. The outputs are the golden
//! values the device simulator is compared against.

mod kernels;

use std::collections::HashMap;

use ndarray::{ArrayD, Ix2, Ix4, IxDyn};

use ethosu_ir::{Graph, IrError, Node, Op, Tensor, TensorId, TensorType};

/// Errors raised by the reference executor.
#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("expected {expected} input tensor(s), got {found}")]
    InputCount { expected: usize, found: usize },

    #[error("input {index}: expected {expected}, found {found}")]
    InputMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("no value computed for tensor '{0}'")]
    MissingValue(String),

    #[error("operator '{node}' expects {expected} operand(s), got {found}")]
    Arity {
        node: String,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Float reference runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceExecutor;

impl ReferenceExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Runs `graph` and returns the graph outputs in order.
    pub fn execute(&self, graph: &Graph, inputs: &[Tensor]) -> Result<Vec<Tensor>, ReferenceError> {
        let values = self.run(graph, inputs)?;
        graph
            .outputs
            .iter()
            .map(|t| output_value(graph, &values, *t))
            .collect()
    }

    /// Runs `graph` and returns the value of every non-constant tensor.
    pub fn run(
        &self,
        graph: &Graph,
        inputs: &[Tensor],
    ) -> Result<HashMap<TensorId, Tensor>, ReferenceError> {
        let mut values = bind_inputs(graph, inputs)?;
        for node in graph.topological_order()? {
            let operands = gather(graph, &values, node)?;
            let results = execute_node(graph, node, &operands)?;
            for (&t, value) in node.outputs.iter().zip(results) {
                values.insert(t, value);
            }
        }
        log::debug!(
            "reference: evaluated {} node(s), {} value(s)",
            graph.node_count(),
            values.len()
        );
        Ok(values)
    }
}

fn output_value(
    graph: &Graph,
    values: &HashMap<TensorId, Tensor>,
    id: TensorId,
) -> Result<Tensor, ReferenceError> {
    match values.get(&id) {
        Some(v) => Ok(v.clone()),
        None => Err(ReferenceError::MissingValue(graph.tensor(id)?.name.clone())),
    }
}

/// Checks `inputs` against the graph interface and seeds the value map.
/// Runtime tensors take the quantization declared by the graph.
pub fn bind_inputs(
    graph: &Graph,
    inputs: &[Tensor],
) -> Result<HashMap<TensorId, Tensor>, ReferenceError> {
    if inputs.len() != graph.inputs.len() {
        return Err(ReferenceError::InputCount {
            expected: graph.inputs.len(),
            found: inputs.len(),
        });
    }
    let mut values = HashMap::new();
    for (index, (&id, tensor)) in graph.inputs.iter().zip(inputs).enumerate() {
        let ty = &graph.tensor(id)?.ty;
        if !tensor.conforms_to(ty) {
            return Err(ReferenceError::InputMismatch {
                index,
                expected: ty.to_string(),
                found: tensor.tensor_type().to_string(),
            });
        }
        values.insert(
            id,
            Tensor {
                quant: ty.quant.clone(),
                ..tensor.clone()
            },
        );
    }
    Ok(values)
}

/// Collects the operand values of `node` from `values` and the graph's
/// constants.
pub fn gather<'a>(
    graph: &'a Graph,
    values: &'a HashMap<TensorId, Tensor>,
    node: &Node,
) -> Result<Vec<&'a Tensor>, ReferenceError> {
    node.inputs
        .iter()
        .map(|&t| {
            if let Some(v) = values.get(&t) {
                return Ok(v);
            }
            let info = graph.tensor(t)?;
            info.constant
                .as_ref()
                .ok_or_else(|| ReferenceError::MissingValue(info.name.clone()))
        })
        .collect()
}

fn arity(node: &Node, operands: &[&Tensor], expected: usize) -> Result<(), ReferenceError> {
    if operands.len() < expected {
        return Err(ReferenceError::Arity {
            node: node.name.clone(),
            expected,
            found: operands.len(),
        });
    }
    Ok(())
}

fn real(tensor: &Tensor) -> Result<ArrayD<f64>, ReferenceError> {
    let shape = tensor.shape();
    ArrayD::from_shape_vec(IxDyn(&shape.dims), tensor.dequantize()).map_err(|_| {
        ReferenceError::Ir(IrError::ShapeMismatch {
            context: "dequantize".into(),
            expected: shape.to_string(),
            found: format!("{} elements", tensor.len()),
        })
    })
}

fn dims_error(node: &Node, what: &str) -> ReferenceError {
    ReferenceError::Ir(IrError::InvalidOperand {
        node: node.name.clone(),
        reason: format!("{what} has an unexpected rank"),
    })
}

/// Evaluates one node on concrete operand values.
pub fn execute_node(
    graph: &Graph,
    node: &Node,
    operands: &[&Tensor],
) -> Result<Vec<Tensor>, ReferenceError> {
    let out_types: Vec<&TensorType> = node
        .outputs
        .iter()
        .map(|&t| graph.tensor(t).map(|info| &info.ty))
        .collect::<Result<_, _>>()?;

    let out_ty = out_types.first().copied().ok_or_else(|| ReferenceError::Arity {
        node: node.name.clone(),
        expected: 1,
        found: 0,
    })?;

    let values: Vec<f64> = match &node.op {
        Op::Sigmoid => unary(node, operands, kernels::sigmoid)?,
        Op::Tanh => unary(node, operands, f64::tanh)?,
        Op::Relu => unary(node, operands, |x| x.max(0.0))?,
        Op::Relu6 => unary(node, operands, |x| x.clamp(0.0, 6.0))?,
        Op::ReluN1To1 => unary(node, operands, |x| x.clamp(-1.0, 1.0))?,
        Op::Add { activation } | Op::Sub { activation } | Op::Mul { activation } => {
            arity(node, operands, 2)?;
            let a = operands[0].dequantize();
            let b = operands[1].dequantize();
            if a.len() != b.len() {
                return Err(ReferenceError::Ir(IrError::ShapeMismatch {
                    context: node.name.clone(),
                    expected: operands[0].shape().to_string(),
                    found: operands[1].shape().to_string(),
                }));
            }
            let f: fn(f64, f64) -> f64 = match &node.op {
                Op::Add { .. } => |x: f64, y: f64| x + y,
                Op::Sub { .. } => |x: f64, y: f64| x - y,
                _ => |x: f64, y: f64| x * y,
            };
            a.iter()
                .zip(&b)
                .map(|(&x, &y)| kernels::clamp(f(x, y), *activation))
                .collect()
        }
        Op::Conv2d(attrs) | Op::DepthwiseConv2d(attrs) => {
            arity(node, operands, 2)?;
            let input = real(operands[0])?
                .into_dimensionality::<Ix4>()
                .map_err(|_| dims_error(node, "input"))?;
            let weights = real(operands[1])?
                .into_dimensionality::<Ix4>()
                .map_err(|_| dims_error(node, "weights"))?;
            let bias = operands.get(2).map(|b| b.dequantize());
            let depthwise = matches!(node.op, Op::DepthwiseConv2d(_));
            kernels::conv2d(input.view(), weights.view(), bias.as_deref(), attrs, depthwise)?
                .into_raw_vec_and_offset()
                .0
        }
        Op::FullyConnected { activation } => {
            arity(node, operands, 2)?;
            let input = real(operands[0])?
                .into_dimensionality::<Ix2>()
                .map_err(|_| dims_error(node, "input"))?;
            let weights = real(operands[1])?
                .into_dimensionality::<Ix2>()
                .map_err(|_| dims_error(node, "weights"))?;
            let bias = operands.get(2).map(|b| b.dequantize());
            kernels::fully_connected(input.view(), weights.view(), bias.as_deref(), *activation)
                .into_raw_vec_and_offset()
                .0
        }
        Op::MaxPool2d(attrs) | Op::AvgPool2d(attrs) => {
            arity(node, operands, 1)?;
            let input = real(operands[0])?
                .into_dimensionality::<Ix4>()
                .map_err(|_| dims_error(node, "input"))?;
            let max = matches!(node.op, Op::MaxPool2d(_));
            kernels::pool2d(input.view(), attrs, max)?
                .into_raw_vec_and_offset()
                .0
        }
        Op::Reshape => {
            arity(node, operands, 1)?;
            operands[0].dequantize()
        }
        Op::Softmax { beta } => {
            arity(node, operands, 1)?;
            let mut v = operands[0].dequantize();
            let inner = operands[0].shape().dims.last().copied().unwrap_or(1);
            kernels::softmax(&mut v, inner, *beta as f64);
            v
        }
        Op::RegionBegin { .. } | Op::RegionEnd { .. } => {
            arity(node, operands, node.outputs.len())?;
            return operands
                .iter()
                .zip(&out_types)
                .map(|(t, ty)| Ok(Tensor::quantize(&t.dequantize(), ty)?))
                .collect();
        }
    };

    Ok(vec![Tensor::quantize(&values, out_ty)?])
}

fn unary(node: &Node, operands: &[&Tensor], f: impl Fn(f64) -> f64) -> Result<Vec<f64>, ReferenceError> {
    arity(node, operands, 1)?;
    Ok(operands[0].dequantize().into_iter().map(f).collect())
}
