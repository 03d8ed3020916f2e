//! Post-training calibration of float graphs.
//!
//! [`TensorRanges`] accumulates the real-valued min/max of every tensor
//! over a set of sample runs. [`quantize_graph`] turns a float graph into
//! an int8 graph using those ranges: asymmetric per-tensor activations,
//! symmetric per-channel weights and int32 biases. Operators with a
//! bounded output use fixed parameters; max pooling and reshape pass the
//! input quantization through unchanged.

use std::collections::HashMap;

use ethosu_ir::{DType, Graph, IrError, Node, Op, QuantParams, Tensor, TensorId, TensorType};

use crate::quantize::{QuantizeError, asymmetric_int8, bias_int32, symmetric_weights};

/// Observed real-valued range per tensor.
#[derive(Clone, Debug, Default)]
pub struct TensorRanges {
    ranges: HashMap<TensorId, (f64, f64)>,
}

impl TensorRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Widens the recorded range of `id` to include `[min, max]`.
    pub fn record(&mut self, id: TensorId, min: f64, max: f64) {
        self.ranges
            .entry(id)
            .and_modify(|r| {
                r.0 = r.0.min(min);
                r.1 = r.1.max(max);
            })
            .or_insert((min, max));
    }

    /// Records the values of one sample run.
    pub fn observe(&mut self, values: &HashMap<TensorId, Tensor>) {
        for (&id, tensor) in values {
            let real = tensor.dequantize();
            let min = real.iter().copied().fold(f64::INFINITY, f64::min);
            let max = real.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if min <= max {
                self.record(id, min, max);
            }
        }
    }

    pub fn get(&self, id: TensorId) -> Option<(f64, f64)> {
        self.ranges.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Fixed output parameters for operators with a bounded range.
fn fixed_output(op: &Op) -> Option<QuantParams> {
    match op {
        Op::Sigmoid | Op::Softmax { .. } => Some(QuantParams::per_tensor(1.0 / 256.0, -128)),
        Op::Tanh => Some(QuantParams::per_tensor(1.0 / 128.0, 0)),
        _ => None,
    }
}

/// Channel axis of the weight operand.
fn weight_axis(op: &Op) -> Option<usize> {
    match op {
        Op::Conv2d(_) | Op::FullyConnected { .. } => Some(0),
        Op::DepthwiseConv2d(_) => Some(3),
        _ => None,
    }
}

struct Quantizer<'a> {
    graph: Graph,
    ranges: &'a TensorRanges,
}

impl Quantizer<'_> {
    fn is_float(&self, id: TensorId) -> Result<bool, QuantizeError> {
        Ok(self.graph.tensor(id)?.ty.dtype == DType::Float32)
    }

    fn quant_of(&self, id: TensorId) -> Result<Option<QuantParams>, QuantizeError> {
        Ok(self.graph.tensor(id)?.ty.quant.clone())
    }

    fn observed(&self, id: TensorId) -> Result<QuantParams, QuantizeError> {
        let info = self.graph.tensor(id)?;
        let (min, max) = self
            .ranges
            .get(id)
            .ok_or_else(|| QuantizeError::MissingRange(info.name.clone()))?;
        if max - min < f32::EPSILON as f64 {
            log::warn!(
                "calibration: tensor '{}' has a degenerate range [{min}, {max}]",
                info.name
            );
        }
        Ok(asymmetric_int8(min, max))
    }

    /// Retypes a float activation to int8 with `quant`.
    fn retype(&mut self, id: TensorId, quant: QuantParams) -> Result<(), QuantizeError> {
        let info = self
            .graph
            .tensors
            .get_mut(id.0 as usize)
            .ok_or(IrError::UnknownTensor(id.0))?;
        info.ty = TensorType::quantized(DType::Int8, info.ty.shape.clone(), quant);
        Ok(())
    }

    fn replace_constant(&mut self, id: TensorId, value: Tensor) -> Result<(), QuantizeError> {
        let info = self
            .graph
            .tensors
            .get_mut(id.0 as usize)
            .ok_or(IrError::UnknownTensor(id.0))?;
        info.ty = value.tensor_type();
        info.constant = Some(value);
        Ok(())
    }

    fn constant_value(&self, id: TensorId) -> Result<Option<Tensor>, QuantizeError> {
        Ok(self.graph.tensor(id)?.constant.clone())
    }

    fn quantize_operands(&mut self, node: &Node) -> Result<(), QuantizeError> {
        let axis = weight_axis(&node.op);
        for (index, &t) in node.inputs.iter().enumerate() {
            if !self.is_float(t)? {
                continue;
            }
            let Some(value) = self.constant_value(t)? else {
                continue;
            };
            let quantized = match (axis, index) {
                (Some(axis), 1) => symmetric_weights(&value, axis)?,
                (Some(_), 2) => {
                    let input_scale = match node.inputs.first() {
                        Some(&x) => self.quant_of(x)?.map_or(1.0, |q| q.scale()),
                        None => 1.0,
                    };
                    let weights = node
                        .inputs
                        .get(1)
                        .map(|&w| self.quant_of(w))
                        .transpose()?
                        .flatten()
                        .unwrap_or_else(|| QuantParams::per_tensor(1.0, 0));
                    bias_int32(&value, input_scale, &weights)?
                }
                _ => {
                    let real = value.dequantize();
                    let min = real.iter().copied().fold(0.0, f64::min);
                    let max = real.iter().copied().fold(0.0, f64::max);
                    let quant = asymmetric_int8(min, max);
                    let ty = TensorType::quantized(DType::Int8, value.shape(), quant);
                    Tensor::quantize(&real, &ty)?
                }
            };
            self.replace_constant(t, quantized)?;
        }
        Ok(())
    }

    fn quantize_outputs(&mut self, node: &Node) -> Result<(), QuantizeError> {
        for (index, &t) in node.outputs.iter().enumerate() {
            if !self.is_float(t)? {
                continue;
            }
            let quant = match &node.op {
                Op::MaxPool2d(_) | Op::Reshape => match node.inputs.first() {
                    Some(&src) => self.quant_of(src)?,
                    None => None,
                },
                Op::RegionBegin { .. } | Op::RegionEnd { .. } => {
                    match node.inputs.get(index) {
                        Some(&src) => self.quant_of(src)?,
                        None => None,
                    }
                }
                op => fixed_output(op),
            };
            let quant = match quant {
                Some(q) => q,
                None => self.observed(t)?,
            };
            self.retype(t, quant)?;
        }
        Ok(())
    }
}

/// Quantizes every float tensor of `graph` to int8 (int32 for biases).
///
/// Tensors that already have an integer type are left untouched, so an
/// already quantized graph comes back unchanged.
pub fn quantize_graph(graph: &Graph, ranges: &TensorRanges) -> Result<Graph, QuantizeError> {
    let mut q = Quantizer {
        graph: graph.clone(),
        ranges,
    };

    for &t in &graph.inputs {
        if q.is_float(t)? {
            let quant = q.observed(t)?;
            q.retype(t, quant)?;
        }
    }

    let order: Vec<Node> = graph.topological_order()?.into_iter().cloned().collect();
    for node in &order {
        q.quantize_operands(node)?;
        q.quantize_outputs(node)?;
    }

    let quantized = q.graph;
    quantized.validate()?;
    log::debug!(
        "calibration: quantized {} node(s) from {} recorded range(s)",
        quantized.node_count(),
        ranges.len()
    );
    Ok(quantized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosu_ir::{Conv2dAttrs, GraphBuilder, Padding, Pool2dAttrs};

    fn ranges_for(graph: &Graph, lo: f64, hi: f64) -> TensorRanges {
        let mut r = TensorRanges::new();
        for (i, info) in graph.tensors.iter().enumerate() {
            if info.constant.is_none() {
                r.record(TensorId(i as u32), lo, hi);
            }
        }
        r
    }

    #[test]
    fn observe_widens_ranges() {
        let mut r = TensorRanges::new();
        let mut values = HashMap::new();
        values.insert(TensorId(0), Tensor::from_f32(&[3], vec![-0.5, 0.25, 0.75]).unwrap());
        r.observe(&values);
        values.insert(TensorId(0), Tensor::from_f32(&[1], vec![-2.0]).unwrap());
        r.observe(&values);
        assert_eq!(r.get(TensorId(0)), Some((-2.0, 0.75)));
        assert_eq!(r.get(TensorId(1)), None);
    }

    #[test]
    fn sigmoid_gets_fixed_output_quantization() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", [1, 4], DType::Float32);
        let y = b.sigmoid(x).unwrap();
        b.output(y);
        let graph = b.finish().unwrap();

        let q = quantize_graph(&graph, &ranges_for(&graph, -1.0, 1.0)).unwrap();
        let xin = &q.tensor(x).unwrap().ty;
        assert_eq!(xin.dtype, DType::Int8);
        let out = q.tensor(y).unwrap().ty.quant.clone().unwrap();
        assert_eq!(out, QuantParams::per_tensor(1.0 / 256.0, -128));
    }

    #[test]
    fn conv_weights_and_bias_are_quantized() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", [1, 3, 3, 2], DType::Float32);
        let w = Tensor::from_f32(&[2, 1, 1, 2], vec![0.5, -0.5, 0.25, 1.0]).unwrap();
        let bias = Tensor::from_f32(&[2], vec![0.1, -0.2]).unwrap();
        let y = b.conv2d(x, w, Some(bias), Conv2dAttrs::default()).unwrap();
        b.output(y);
        let graph = b.finish().unwrap();

        let q = quantize_graph(&graph, &ranges_for(&graph, -1.0, 1.0)).unwrap();
        let node = &q.nodes[0];
        let w = q.tensor(node.inputs[1]).unwrap();
        assert_eq!(w.ty.dtype, DType::Int8);
        assert_eq!(w.ty.quant.as_ref().unwrap().scales.len(), 2);
        let bias = q.tensor(node.inputs[2]).unwrap();
        assert_eq!(bias.ty.dtype, DType::Int32);
        let in_scale = q.tensor(x).unwrap().ty.quant.as_ref().unwrap().scale();
        let w_scale = w.ty.quant.as_ref().unwrap().scales[1];
        let b_scale = bias.ty.quant.as_ref().unwrap().scales[1];
        assert!((b_scale - in_scale * w_scale).abs() < 1e-9);
    }

    #[test]
    fn max_pool_passes_quantization_through() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", [1, 4, 4, 1], DType::Float32);
        let y = b.max_pool2d(x, Pool2dAttrs::new([2, 2], [2, 2], Padding::Valid)).unwrap();
        b.output(y);
        let graph = b.finish().unwrap();

        let mut r = TensorRanges::new();
        r.record(x, -0.3, 0.6);
        let q = quantize_graph(&graph, &r).unwrap();
        assert_eq!(q.tensor(x).unwrap().ty.quant, q.tensor(y).unwrap().ty.quant);
    }

    #[test]
    fn missing_range_is_reported() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", [1, 4], DType::Float32);
        let y = b.relu(x).unwrap();
        b.output(y);
        let graph = b.finish().unwrap();

        let mut r = TensorRanges::new();
        r.record(x, -1.0, 1.0);
        let err = quantize_graph(&graph, &r).unwrap_err();
        assert!(matches!(err, QuantizeError::MissingRange(name) if name == "relu_0_out"));
    }

    #[test]
    fn quantized_graph_is_unchanged() {
        let ty = TensorType::quantized(DType::Int8, [1, 4], QuantParams::per_tensor(0.1, 0));
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", ty.clone());
        let y = b.push(Op::Tanh, &[x], ty.clone()).unwrap();
        b.output(y);
        let graph = b.finish().unwrap();

        let q = quantize_graph(&graph, &TensorRanges::new()).unwrap();
        assert_eq!(q.tensor(y).unwrap().ty, ty);
    }
}
