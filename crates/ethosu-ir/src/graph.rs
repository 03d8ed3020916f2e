//! Data-flow graph of tensor operations.
//!
//! A [`Graph`] is a DAG where nodes are operators and edges are tensors.
//! Each tensor has at most one producer. Graphs are built once (by the
//! [`GraphBuilder`](crate::GraphBuilder) or by a transformation that
//! returns a fresh graph) and treated as read-only afterwards.
//!
//! Accelerator regions are delimited by a [`Op::RegionBegin`] /
//! [`Op::RegionEnd`] node pair. The begin node consumes the region's entry
//! tensors and produces one alias per entry; member nodes consume those
//! aliases. The end node consumes the exit tensors produced by members and
//! produces one alias per exit for downstream consumers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::error::IrError;
use crate::tensor::Tensor;
use crate::types::TensorType;

/// A unique identifier for a node in the graph.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(pub u32);

/// A unique identifier for a tensor (edge) in the graph.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TensorId(pub u32);

/// Identifier of an accelerator region.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct RegionId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Spatial padding mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Padding {
    /// Output spatial size is `ceil(in / stride)`.
    Same,
    /// No implicit padding.
    #[default]
    Valid,
}

/// Activation folded into the output stage of an operator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FusedActivation {
    #[default]
    None,
    Relu,
    Relu6,
    ReluN1To1,
}

impl FusedActivation {
    /// Real-valued clamp range applied after the operator.
    pub fn real_range(self) -> (f64, f64) {
        match self {
            Self::None => (f64::NEG_INFINITY, f64::INFINITY),
            Self::Relu => (0.0, f64::INFINITY),
            Self::Relu6 => (0.0, 6.0),
            Self::ReluN1To1 => (-1.0, 1.0),
        }
    }
}

impl fmt::Display for FusedActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Relu => "relu",
            Self::Relu6 => "relu6",
            Self::ReluN1To1 => "relu_n1_to_1",
        })
    }
}

/// Convolution attributes (NHWC activations).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conv2dAttrs {
    /// `[stride_h, stride_w]`.
    pub stride: [usize; 2],
    /// `[dilation_h, dilation_w]`.
    pub dilation: [usize; 2],
    pub padding: Padding,
    pub activation: FusedActivation,
}

impl Default for Conv2dAttrs {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            dilation: [1, 1],
            padding: Padding::Valid,
            activation: FusedActivation::None,
        }
    }
}

/// Pooling attributes (NHWC activations).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pool2dAttrs {
    /// `[kernel_h, kernel_w]`.
    pub kernel: [usize; 2],
    /// `[stride_h, stride_w]`.
    pub stride: [usize; 2],
    pub padding: Padding,
    pub activation: FusedActivation,
}

impl Pool2dAttrs {
    pub fn new(kernel: [usize; 2], stride: [usize; 2], padding: Padding) -> Self {
        Self {
            kernel,
            stride,
            padding,
            activation: FusedActivation::None,
        }
    }
}

/// The operation performed by a graph node.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Logistic function `1 / (1 + e^-x)`.
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
    /// `max(x, 0)`.
    Relu,
    /// `min(max(x, 0), 6)`.
    Relu6,
    /// `min(max(x, -1), 1)`.
    ReluN1To1,
    /// Element-wise addition of two same-shaped tensors.
    Add { activation: FusedActivation },
    /// Element-wise subtraction of two same-shaped tensors.
    Sub { activation: FusedActivation },
    /// Element-wise multiplication of two same-shaped tensors.
    Mul { activation: FusedActivation },
    /// 2D convolution. Inputs: `[ifm, weights (OHWI), bias?]`.
    Conv2d(Conv2dAttrs),
    /// Depthwise 2D convolution. Inputs: `[ifm, weights (1HWC), bias?]`.
    DepthwiseConv2d(Conv2dAttrs),
    /// Dense layer. Inputs: `[ifm (N, I), weights (O, I), bias?]`.
    FullyConnected { activation: FusedActivation },
    /// Max pooling.
    MaxPool2d(Pool2dAttrs),
    /// Average pooling.
    AvgPool2d(Pool2dAttrs),
    /// Reinterprets the input with the output tensor's shape.
    Reshape,
    /// Softmax over the innermost dimension.
    Softmax { beta: f32 },
    /// Opens an accelerator region.
    RegionBegin { region: RegionId, compiler: String },
    /// Closes an accelerator region.
    RegionEnd { region: RegionId },
}

impl Op {
    /// Operator name in the conventional upper-case spelling.
    pub fn name(&self) -> &str {
        match self {
            Self::Sigmoid => "SIGMOID",
            Self::Tanh => "TANH",
            Self::Relu => "RELU",
            Self::Relu6 => "RELU6",
            Self::ReluN1To1 => "RELU_N1_TO_1",
            Self::Add { .. } => "ADD",
            Self::Sub { .. } => "SUB",
            Self::Mul { .. } => "MUL",
            Self::Conv2d(_) => "CONV_2D",
            Self::DepthwiseConv2d(_) => "DEPTHWISE_CONV_2D",
            Self::FullyConnected { .. } => "FULLY_CONNECTED",
            Self::MaxPool2d(_) => "MAX_POOL_2D",
            Self::AvgPool2d(_) => "AVERAGE_POOL_2D",
            Self::Reshape => "RESHAPE",
            Self::Softmax { .. } => "SOFTMAX",
            Self::RegionBegin { .. } => "region_begin",
            Self::RegionEnd { .. } => "region_end",
        }
    }

    /// Returns `true` for boundary markers.
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::RegionBegin { .. } | Self::RegionEnd { .. })
    }

    /// The activation folded into this operator, if it has an output stage.
    pub fn fused_activation(&self) -> Option<FusedActivation> {
        match self {
            Self::Add { activation }
            | Self::Sub { activation }
            | Self::Mul { activation }
            | Self::FullyConnected { activation } => Some(*activation),
            Self::Conv2d(a) | Self::DepthwiseConv2d(a) => Some(a.activation),
            Self::MaxPool2d(a) | Self::AvgPool2d(a) => Some(a.activation),
            _ => None,
        }
    }

    /// Returns a copy with `activation` folded in, or `None` if this
    /// operator has no output stage to fold into.
    pub fn with_fused_activation(&self, activation: FusedActivation) -> Option<Op> {
        let mut op = self.clone();
        match &mut op {
            Self::Add { activation: a }
            | Self::Sub { activation: a }
            | Self::Mul { activation: a }
            | Self::FullyConnected { activation: a } => *a = activation,
            Self::Conv2d(attrs) | Self::DepthwiseConv2d(attrs) => attrs.activation = activation,
            Self::MaxPool2d(attrs) | Self::AvgPool2d(attrs) => attrs.activation = activation,
            _ => return None,
        }
        Some(op)
    }

    /// The activation a standalone Relu-family node represents.
    pub fn as_activation(&self) -> Option<FusedActivation> {
        match self {
            Self::Relu => Some(FusedActivation::Relu),
            Self::Relu6 => Some(FusedActivation::Relu6),
            Self::ReluN1To1 => Some(FusedActivation::ReluN1To1),
            _ => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegionBegin { region, compiler } => write!(f, "region_begin({region}, {compiler})"),
            Self::RegionEnd { region } => write!(f, "region_end({region})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Metadata about a tensor edge.
#[derive(Clone, Debug)]
pub struct TensorInfo {
    /// Human-readable name.
    pub name: String,
    /// Static type.
    pub ty: TensorType,
    /// Constant data (weights, bias), if this tensor is a constant.
    pub constant: Option<Tensor>,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, ty: TensorType) -> Self {
        Self {
            name: name.into(),
            ty,
            constant: None,
        }
    }

    pub fn constant(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            ty: value.tensor_type(),
            constant: Some(value),
        }
    }
}

/// A node in the graph.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    /// Input tensors (ordered).
    pub inputs: Vec<TensorId>,
    /// Output tensors (ordered).
    pub outputs: Vec<TensorId>,
    pub name: String,
}

/// A data-flow graph of tensor operations.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    /// Nodes in insertion order.
    pub nodes: Vec<Node>,
    /// Tensor table, indexed by [`TensorId`].
    pub tensors: Vec<TensorInfo>,
    /// Graph inputs (runtime-supplied tensors).
    pub inputs: Vec<TensorId>,
    /// Graph outputs.
    pub outputs: Vec<TensorId>,
    next_node_id: u32,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tensor and returns its id.
    pub fn add_tensor(&mut self, info: TensorInfo) -> TensorId {
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(info);
        id
    }

    /// Adds a node and returns its id.
    ///
    /// # Panics
    ///
    /// Panics if any input or output tensor has not been registered via
    /// [`add_tensor`](Self::add_tensor), or if an output tensor already has
    /// a producer.
    pub fn add_node(
        &mut self,
        op: Op,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
        name: impl Into<String>,
    ) -> NodeId {
        let name = name.into();

        for &t in inputs.iter().chain(outputs.iter()) {
            assert!(
                (t.0 as usize) < self.tensors.len(),
                "add_node({name}): {t} not registered in graph",
            );
        }

        for &out in &outputs {
            let existing = self.nodes.iter().find(|n| n.outputs.contains(&out));
            assert!(
                existing.is_none(),
                "add_node({name}): {out} already produced by node {:?}",
                existing.map(|n| n.name.as_str()),
            );
        }

        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        self.nodes.push(Node {
            id,
            op,
            inputs,
            outputs,
            name,
        });
        id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Looks up a tensor.
    pub fn tensor(&self, id: TensorId) -> Result<&TensorInfo, IrError> {
        self.tensors
            .get(id.0 as usize)
            .ok_or(IrError::UnknownTensor(id.0))
    }

    /// Looks up a node by id.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Returns `true` if the tensor carries constant data.
    pub fn is_constant(&self, id: TensorId) -> bool {
        self.tensor(id).is_ok_and(|t| t.constant.is_some())
    }

    /// The node producing `tensor`, if any.
    pub fn producer(&self, tensor: TensorId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.outputs.contains(&tensor))
    }

    /// All nodes consuming `tensor`.
    pub fn consumers(&self, tensor: TensorId) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.contains(&tensor))
            .collect()
    }

    /// Returns nodes in topological order.
    ///
    /// Deterministic: among ready nodes the smallest [`NodeId`] goes first.
    pub fn topological_order(&self) -> Result<Vec<&Node>, IrError> {
        let mut producer: HashMap<TensorId, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for &out in &node.outputs {
                producer.insert(out, i);
            }
        }

        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (ci, node) in self.nodes.iter().enumerate() {
            for inp in &node.inputs {
                if let Some(&pi) = producer.get(inp) {
                    in_degree[ci] += 1;
                    consumers[pi].push(ci);
                }
            }
        }

        let mut ready: BTreeSet<(NodeId, usize)> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| (self.nodes[i].id, i))
            .collect();

        let mut result: Vec<&Node> = Vec::with_capacity(n);
        while let Some((_, idx)) = ready.pop_first() {
            result.push(&self.nodes[idx]);
            for &ci in &consumers[idx] {
                in_degree[ci] -= 1;
                if in_degree[ci] == 0 {
                    ready.insert((self.nodes[ci].id, ci));
                }
            }
        }

        if result.len() != n {
            return Err(IrError::Cycle {
                visited: result.len(),
                total: n,
            });
        }
        Ok(result)
    }

    /// Checks structural invariants: tensor references, single producers,
    /// producer-free graph inputs, acyclicity and balanced region markers.
    pub fn validate(&self) -> Result<(), IrError> {
        let mut produced: HashSet<TensorId> = HashSet::new();
        for node in &self.nodes {
            for &t in node.inputs.iter().chain(node.outputs.iter()) {
                self.tensor(t)?;
            }
            for &out in &node.outputs {
                if !produced.insert(out) {
                    return Err(IrError::DuplicateProducer {
                        tensor: self.tensor(out)?.name.clone(),
                    });
                }
            }
        }
        for &t in &self.inputs {
            let info = self.tensor(t)?;
            if produced.contains(&t) {
                return Err(IrError::InvalidOperand {
                    node: info.name.clone(),
                    reason: "graph input has a producer".into(),
                });
            }
        }
        for &t in &self.outputs {
            self.tensor(t)?;
        }
        self.topological_order()?;

        for region in self.regions() {
            let begins = self
                .nodes
                .iter()
                .filter(|n| matches!(&n.op, Op::RegionBegin { region: r, .. } if *r == region))
                .count();
            let ends = self
                .nodes
                .iter()
                .filter(|n| matches!(&n.op, Op::RegionEnd { region: r } if *r == region))
                .count();
            if begins != 1 || ends != 1 {
                return Err(IrError::MalformedRegion {
                    region: region.0,
                    reason: format!("{begins} begin marker(s), {ends} end marker(s)"),
                });
            }
        }
        Ok(())
    }

    /// All region ids mentioned by any marker, sorted.
    pub fn regions(&self) -> Vec<RegionId> {
        let set: BTreeSet<RegionId> = self
            .nodes
            .iter()
            .filter_map(|n| match &n.op {
                Op::RegionBegin { region, .. } | Op::RegionEnd { region } => Some(*region),
                _ => None,
            })
            .collect();
        set.into_iter().collect()
    }

    /// The begin marker of `region`.
    pub fn region_begin(&self, region: RegionId) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(&n.op, Op::RegionBegin { region: r, .. } if *r == region))
    }

    /// The end marker of `region`.
    pub fn region_end(&self, region: RegionId) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(&n.op, Op::RegionEnd { region: r } if *r == region))
    }

    /// Nodes enclosed by `region`, in topological order.
    ///
    /// A node is enclosed when it is not a marker and consumes a tensor
    /// produced by the region's begin marker or by another enclosed node.
    pub fn region_members(&self, region: RegionId) -> Result<Vec<&Node>, IrError> {
        let begin = self
            .region_begin(region)
            .ok_or(IrError::UnknownRegion(region.0))?;
        let mut live: HashSet<TensorId> = begin.outputs.iter().copied().collect();
        let mut members = Vec::new();
        for node in self.topological_order()? {
            if node.op.is_marker() {
                continue;
            }
            if node.inputs.iter().any(|t| live.contains(t)) {
                live.extend(node.outputs.iter().copied());
                members.push(node);
            }
        }
        Ok(members)
    }

    /// Maps every enclosed node to the region enclosing it.
    pub fn region_membership(&self) -> Result<HashMap<NodeId, RegionId>, IrError> {
        let mut map = HashMap::new();
        for region in self.regions() {
            for node in self.region_members(region)? {
                if let Some(other) = map.insert(node.id, region)
                    && other != region
                {
                    return Err(IrError::MalformedRegion {
                        region: region.0,
                        reason: format!("node '{}' is also enclosed by {other}", node.name),
                    });
                }
            }
        }
        Ok(map)
    }

    /// Extracts `region` as a standalone graph.
    ///
    /// The region's entry aliases become graph inputs (named after the
    /// original entry tensors), the tensors consumed by the end marker
    /// become graph outputs, and referenced constants are copied.
    pub fn extract_region(&self, region: RegionId) -> Result<Graph, IrError> {
        let begin = self
            .region_begin(region)
            .ok_or(IrError::UnknownRegion(region.0))?;
        let end = self.region_end(region).ok_or(IrError::MalformedRegion {
            region: region.0,
            reason: "missing end marker".into(),
        })?;
        let members = self.region_members(region)?;

        let mut sub = Graph::new();
        let mut remap: HashMap<TensorId, TensorId> = HashMap::new();

        for (&entry, &alias) in begin.inputs.iter().zip(begin.outputs.iter()) {
            let mut info = self.tensor(alias)?.clone();
            info.name = self.tensor(entry)?.name.clone();
            let id = sub.add_tensor(info);
            remap.insert(alias, id);
            sub.inputs.push(id);
        }

        for node in members {
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for &t in &node.inputs {
                let mapped = match remap.get(&t) {
                    Some(&m) => m,
                    None if self.is_constant(t) => {
                        let m = sub.add_tensor(self.tensor(t)?.clone());
                        remap.insert(t, m);
                        m
                    }
                    None => {
                        return Err(IrError::MalformedRegion {
                            region: region.0,
                            reason: format!(
                                "node '{}' consumes '{}' from outside the region",
                                node.name,
                                self.tensor(t)?.name
                            ),
                        });
                    }
                };
                inputs.push(mapped);
            }
            let mut outputs = Vec::with_capacity(node.outputs.len());
            for &t in &node.outputs {
                let m = sub.add_tensor(self.tensor(t)?.clone());
                remap.insert(t, m);
                outputs.push(m);
            }
            sub.add_node(node.op.clone(), inputs, outputs, node.name.clone());
        }

        for &t in &end.inputs {
            let mapped = remap.get(&t).ok_or_else(|| IrError::MalformedRegion {
                region: region.0,
                reason: format!("exit tensor {t} is not produced inside the region"),
            })?;
            sub.outputs.push(*mapped);
        }
        Ok(sub)
    }
}
