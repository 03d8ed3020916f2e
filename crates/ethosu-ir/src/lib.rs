//! Graph intermediate representation for the Ethos-U pipeline.
//!
//! A [`Graph`] is a DAG of tensor operators over a tensor table. Accelerator
//! regions are expressed in-graph by boundary marker nodes. Runtime values
//! are [`Tensor`]s backed by `ndarray`.

mod builder;
mod display;
mod error;
pub mod graph;
pub mod shape;
mod tensor;
mod types;

pub use builder::GraphBuilder;
pub use display::dump_graph;
pub use error::IrError;
pub use graph::{
    Conv2dAttrs, FusedActivation, Graph, Node, NodeId, Op, Padding, Pool2dAttrs, RegionId,
    TensorId, TensorInfo,
};
pub use tensor::{Tensor, TensorData};
pub use types::{DType, QuantParams, Shape, TensorType};
