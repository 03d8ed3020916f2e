//! Programmatic graph construction.
//!
//! [`GraphBuilder`] is the front end used by model definitions: it
//! registers inputs and constants, appends operators with inferred output
//! types and validates the finished graph.

use crate::error::IrError;
use crate::graph::{Conv2dAttrs, FusedActivation, Graph, Op, Pool2dAttrs, TensorId, TensorInfo};
use crate::shape::infer_output_shape;
use crate::tensor::Tensor;
use crate::types::{DType, Shape, TensorType};

/// Incrementally builds a [`Graph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
    counter: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The graph built so far.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Type of an already registered tensor.
    pub fn tensor_type(&self, id: TensorId) -> Result<&TensorType, IrError> {
        Ok(&self.graph.tensor(id)?.ty)
    }

    /// Declares a runtime input.
    pub fn input(&mut self, name: impl Into<String>, shape: impl Into<Shape>, dtype: DType) -> TensorId {
        self.input_typed(name, TensorType::new(dtype, shape))
    }

    /// Declares a runtime input with a full type (including quantization).
    pub fn input_typed(&mut self, name: impl Into<String>, ty: TensorType) -> TensorId {
        let id = self.graph.add_tensor(TensorInfo::new(name, ty));
        self.graph.inputs.push(id);
        id
    }

    /// Registers constant data.
    pub fn constant(&mut self, name: impl Into<String>, value: Tensor) -> TensorId {
        self.graph.add_tensor(TensorInfo::constant(name, value))
    }

    /// Marks a tensor as a graph output.
    pub fn output(&mut self, id: TensorId) {
        self.graph.outputs.push(id);
    }

    /// Appends `op` with an explicitly typed output.
    pub fn push(&mut self, op: Op, inputs: &[TensorId], out_ty: TensorType) -> Result<TensorId, IrError> {
        for &t in inputs {
            self.graph.tensor(t)?;
        }
        let label = op.name().to_ascii_lowercase();
        let index = self.counter;
        self.counter += 1;
        let out = self
            .graph
            .add_tensor(TensorInfo::new(format!("{label}_{index}_out"), out_ty));
        self.graph
            .add_node(op, inputs.to_vec(), vec![out], format!("{label}_{index}"));
        Ok(out)
    }

    /// Appends `op`, inferring the output shape. The output takes the
    /// element type of the first input.
    pub fn op(&mut self, op: Op, inputs: &[TensorId]) -> Result<TensorId, IrError> {
        let types = inputs
            .iter()
            .map(|&t| self.graph.tensor(t).map(|info| &info.ty))
            .collect::<Result<Vec<_>, _>>()?;
        let shape = infer_output_shape(&op, &types)?;
        let dtype = types.first().map_or(DType::Float32, |t| t.dtype);
        self.push(op, inputs, TensorType::new(dtype, shape))
    }

    pub fn sigmoid(&mut self, x: TensorId) -> Result<TensorId, IrError> {
        self.op(Op::Sigmoid, &[x])
    }

    pub fn tanh(&mut self, x: TensorId) -> Result<TensorId, IrError> {
        self.op(Op::Tanh, &[x])
    }

    pub fn relu(&mut self, x: TensorId) -> Result<TensorId, IrError> {
        self.op(Op::Relu, &[x])
    }

    pub fn relu6(&mut self, x: TensorId) -> Result<TensorId, IrError> {
        self.op(Op::Relu6, &[x])
    }

    pub fn relu_n1_to_1(&mut self, x: TensorId) -> Result<TensorId, IrError> {
        self.op(Op::ReluN1To1, &[x])
    }

    pub fn softmax(&mut self, x: TensorId, beta: f32) -> Result<TensorId, IrError> {
        self.op(Op::Softmax { beta }, &[x])
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, IrError> {
        self.op(Op::Add { activation: FusedActivation::None }, &[a, b])
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, IrError> {
        self.op(Op::Sub { activation: FusedActivation::None }, &[a, b])
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, IrError> {
        self.op(Op::Mul { activation: FusedActivation::None }, &[a, b])
    }

    fn weighted(
        &mut self,
        op: Op,
        x: TensorId,
        weights: Tensor,
        bias: Option<Tensor>,
    ) -> Result<TensorId, IrError> {
        let label = op.name().to_ascii_lowercase();
        let w = self.constant(format!("{label}_{}_weights", self.counter), weights);
        let mut inputs = vec![x, w];
        if let Some(bias) = bias {
            inputs.push(self.constant(format!("{label}_{}_bias", self.counter), bias));
        }
        self.op(op, &inputs)
    }

    /// 2D convolution with OHWI `weights`.
    pub fn conv2d(
        &mut self,
        x: TensorId,
        weights: Tensor,
        bias: Option<Tensor>,
        attrs: Conv2dAttrs,
    ) -> Result<TensorId, IrError> {
        self.weighted(Op::Conv2d(attrs), x, weights, bias)
    }

    /// Depthwise 2D convolution with `[1, KH, KW, C]` weights.
    pub fn depthwise_conv2d(
        &mut self,
        x: TensorId,
        weights: Tensor,
        bias: Option<Tensor>,
        attrs: Conv2dAttrs,
    ) -> Result<TensorId, IrError> {
        self.weighted(Op::DepthwiseConv2d(attrs), x, weights, bias)
    }

    /// Dense layer with `[O, I]` weights.
    pub fn fully_connected(
        &mut self,
        x: TensorId,
        weights: Tensor,
        bias: Option<Tensor>,
        activation: FusedActivation,
    ) -> Result<TensorId, IrError> {
        self.weighted(Op::FullyConnected { activation }, x, weights, bias)
    }

    pub fn max_pool2d(&mut self, x: TensorId, attrs: Pool2dAttrs) -> Result<TensorId, IrError> {
        self.op(Op::MaxPool2d(attrs), &[x])
    }

    pub fn avg_pool2d(&mut self, x: TensorId, attrs: Pool2dAttrs) -> Result<TensorId, IrError> {
        self.op(Op::AvgPool2d(attrs), &[x])
    }

    /// Reinterprets `x` with `shape`; element counts must agree.
    pub fn reshape(&mut self, x: TensorId, shape: impl Into<Shape>) -> Result<TensorId, IrError> {
        let shape = shape.into();
        let ty = self.tensor_type(x)?.clone();
        if ty.shape.num_elements() != shape.num_elements() {
            return Err(IrError::ShapeMismatch {
                context: "reshape".into(),
                expected: format!("{} elements", ty.shape.num_elements()),
                found: shape.to_string(),
            });
        }
        self.push(Op::Reshape, &[x], TensorType { shape, ..ty })
    }

    /// Validates and returns the graph.
    pub fn finish(self) -> Result<Graph, IrError> {
        self.graph.validate()?;
        Ok(self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Padding;

    #[test]
    fn sigmoid_graph() {
        let mut b = GraphBuilder::new();
        let x = b.input("ifm", [1, 135, 41, 6], DType::Float32);
        let y = b.sigmoid(x).unwrap();
        b.output(y);
        let graph = b.finish().unwrap();

        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.inputs, vec![x]);
        assert_eq!(graph.outputs, vec![y]);
        assert_eq!(graph.tensor(y).unwrap().ty.shape, Shape::new([1, 135, 41, 6]));
        assert_eq!(graph.nodes[0].name, "sigmoid_0");
    }

    #[test]
    fn conv_registers_constants() {
        let mut b = GraphBuilder::new();
        let x = b.input("ifm", [1, 5, 5, 2], DType::Float32);
        let w = Tensor::from_f32(&[4, 3, 3, 2], vec![0.1; 72]).unwrap();
        let bias = Tensor::from_f32(&[4], vec![0.0; 4]).unwrap();
        let attrs = Conv2dAttrs {
            padding: Padding::Same,
            ..Default::default()
        };
        let y = b.conv2d(x, w, Some(bias), attrs).unwrap();
        b.output(y);
        let graph = b.finish().unwrap();

        let node = &graph.nodes[0];
        assert_eq!(node.inputs.len(), 3);
        assert!(graph.is_constant(node.inputs[1]));
        assert!(graph.is_constant(node.inputs[2]));
        assert_eq!(graph.tensor(y).unwrap().ty.shape, Shape::new([1, 5, 5, 4]));
    }

    #[test]
    fn reshape_checks_element_count() {
        let mut b = GraphBuilder::new();
        let x = b.input("ifm", [1, 2, 3, 4], DType::Float32);
        assert!(b.reshape(x, [1, 24]).is_ok());
        assert!(b.reshape(x, [1, 25]).is_err());
    }

    #[test]
    fn mismatched_add_fails() {
        let mut b = GraphBuilder::new();
        let x = b.input("a", [1, 4], DType::Float32);
        let y = b.input("b", [1, 3], DType::Float32);
        assert!(b.add(x, y).is_err());
    }
}
