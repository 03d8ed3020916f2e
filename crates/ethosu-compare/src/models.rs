//! Catalog of single-operator models.
//!
//! Each [`Model`] builds a small float graph around one operator. Weights
//! are drawn from a fixed seed so a model name always denotes the same
//! graph.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ethosu_ir::{
    Conv2dAttrs, FusedActivation, GraphBuilder, IrError, Padding, Pool2dAttrs, Tensor, TensorId,
};

const WEIGHT_SEED: u64 = 0x5EED_0E7A;

/// A named single-operator graph.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Model {
    Sigmoid,
    Tanh,
    Relu,
    Relu6,
    ReluN1To1,
    Add,
    Sub,
    Mul,
    Conv2d,
    DepthwiseConv2d,
    FullyConnected,
    MaxPool2d,
    AvgPool2d,
    Reshape,
    Softmax,
}

impl Model {
    pub const ALL: [Model; 15] = [
        Self::Sigmoid,
        Self::Tanh,
        Self::Relu,
        Self::Relu6,
        Self::ReluN1To1,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Conv2d,
        Self::DepthwiseConv2d,
        Self::FullyConnected,
        Self::MaxPool2d,
        Self::AvgPool2d,
        Self::Reshape,
        Self::Softmax,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Relu => "relu",
            Self::Relu6 => "relu6",
            Self::ReluN1To1 => "relu_n1_to_1",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Conv2d => "conv2d",
            Self::DepthwiseConv2d => "depthwise_conv2d",
            Self::FullyConnected => "fully_connected",
            Self::MaxPool2d => "max_pool2d",
            Self::AvgPool2d => "avg_pool2d",
            Self::Reshape => "reshape",
            Self::Softmax => "softmax",
        }
    }

    /// Number of runtime inputs; binary operators take two of the same
    /// shape.
    pub fn arity(self) -> usize {
        match self {
            Self::Add | Self::Sub | Self::Mul => 2,
            _ => 1,
        }
    }

    /// Input shapes for a model given the shape of its first input.
    pub fn input_shapes(self, shape: &[usize]) -> Vec<Vec<usize>> {
        vec![shape.to_vec(); self.arity()]
    }

    /// Builds the model on `inputs` and returns its outputs.
    pub fn build(self, b: &mut GraphBuilder, inputs: &[TensorId]) -> Result<Vec<TensorId>, IrError> {
        let x = *inputs.first().ok_or_else(|| IrError::InvalidOperand {
            node: self.name().into(),
            reason: "no input".into(),
        })?;
        let second = || {
            inputs.get(1).copied().ok_or_else(|| IrError::InvalidOperand {
                node: self.name().into(),
                reason: "missing second input".into(),
            })
        };
        let shape = b.tensor_type(x)?.shape.clone();
        let depth = shape.dims.last().copied().unwrap_or(1);
        let mut rng = StdRng::seed_from_u64(WEIGHT_SEED);

        let y = match self {
            Self::Sigmoid => b.sigmoid(x)?,
            Self::Tanh => b.tanh(x)?,
            Self::Relu => b.relu(x)?,
            Self::Relu6 => b.relu6(x)?,
            Self::ReluN1To1 => b.relu_n1_to_1(x)?,
            Self::Add => b.add(x, second()?)?,
            Self::Sub => b.sub(x, second()?)?,
            Self::Mul => b.mul(x, second()?)?,
            Self::Conv2d => {
                let ofm_depth = 8;
                let w = random(&mut rng, &[ofm_depth, 3, 3, depth], 0.5)?;
                let bias = random(&mut rng, &[ofm_depth], 0.1)?;
                let attrs = Conv2dAttrs {
                    padding: Padding::Same,
                    ..Default::default()
                };
                b.conv2d(x, w, Some(bias), attrs)?
            }
            Self::DepthwiseConv2d => {
                let w = random(&mut rng, &[1, 3, 3, depth], 0.5)?;
                let bias = random(&mut rng, &[depth], 0.1)?;
                let attrs = Conv2dAttrs {
                    padding: Padding::Same,
                    ..Default::default()
                };
                b.depthwise_conv2d(x, w, Some(bias), attrs)?
            }
            Self::FullyConnected => {
                let features = shape.num_elements();
                let flat = if shape.rank() == 2 { x } else { b.reshape(x, [1, features])? };
                let w = random(&mut rng, &[16, features], 0.5)?;
                let bias = random(&mut rng, &[16], 0.1)?;
                b.fully_connected(flat, w, Some(bias), FusedActivation::None)?
            }
            Self::MaxPool2d => b.max_pool2d(x, Pool2dAttrs::new([3, 3], [2, 2], Padding::Same))?,
            Self::AvgPool2d => b.avg_pool2d(x, Pool2dAttrs::new([2, 2], [2, 2], Padding::Valid))?,
            Self::Reshape => b.reshape(x, [1, shape.num_elements()])?,
            Self::Softmax => b.softmax(x, 1.0)?,
        };
        Ok(vec![y])
    }
}

fn random(rng: &mut StdRng, shape: &[usize], bound: f32) -> Result<Tensor, IrError> {
    let n: usize = shape.iter().product();
    let values = (0..n).map(|_| rng.gen_range(-bound..bound)).collect();
    Tensor::from_f32(shape, values)
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when parsing an unknown model name.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown model '{0}'")]
pub struct UnknownModel(pub String);

impl FromStr for Model {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|m| m.name() == lower)
            .ok_or_else(|| UnknownModel(s.to_string()))
    }
}
