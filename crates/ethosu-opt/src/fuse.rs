//! Activation fusion pass.
//!
//! Folds a standalone Relu, Relu6 or ReluN1To1 into the output stage of
//! the operator producing its input:
//!
//! ```text
//! t1 = CONV_2D(t0, w)      =>   t2 = CONV_2D[relu](t0, w)
//! t2 = RELU(t1)
//! ```
//!
//! The fold only happens when the intermediate tensor has no other use,
//! the producer has an output stage with no activation yet, and both
//! tensors carry identical types. Quantization is monotone, so clamping
//! before or after requantization gives the same integers.

use ethosu_ir::{FusedActivation, Graph, NodeId, Op, TensorId};

use crate::Pass;

/// Fuses Relu-family nodes into their producers.
#[derive(Debug)]
pub struct FuseActivation;

struct Candidate {
    producer: NodeId,
    activation_node: NodeId,
    fused: Op,
    intermediate: TensorId,
    output: TensorId,
}

fn find_candidate(graph: &Graph) -> Option<Candidate> {
    for node in &graph.nodes {
        let Some(activation) = node.op.as_activation() else {
            continue;
        };
        let ([input], [output]) = (node.inputs.as_slice(), node.outputs.as_slice()) else {
            continue;
        };
        if graph.outputs.contains(input) || graph.consumers(*input).len() != 1 {
            continue;
        }
        let Some(producer) = graph.producer(*input) else {
            continue;
        };
        if producer.outputs.len() != 1
            || producer.op.fused_activation() != Some(FusedActivation::None)
        {
            continue;
        }
        let (Ok(a), Ok(b)) = (graph.tensor(*input), graph.tensor(*output)) else {
            continue;
        };
        if a.ty != b.ty {
            continue;
        }
        let Some(fused) = producer.op.with_fused_activation(activation) else {
            continue;
        };
        return Some(Candidate {
            producer: producer.id,
            activation_node: node.id,
            fused,
            intermediate: *input,
            output: *output,
        });
    }
    None
}

impl Pass for FuseActivation {
    fn name(&self) -> &str {
        "fuse-activation"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        let mut changed = false;
        while let Some(c) = find_candidate(graph) {
            graph.nodes.retain(|n| n.id != c.activation_node);
            if let Some(producer) = graph.nodes.iter_mut().find(|n| n.id == c.producer) {
                log::debug!("fuse: folding {} into '{}'", c.fused.fused_activation().unwrap_or_default(), producer.name);
                producer.op = c.fused;
                for t in producer.outputs.iter_mut().filter(|t| **t == c.intermediate) {
                    *t = c.output;
                }
            }
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosu_ir::{Conv2dAttrs, DType, GraphBuilder, QuantParams, Tensor, TensorType};

    fn q(shape: [usize; 4]) -> TensorType {
        TensorType::quantized(DType::Int8, shape, QuantParams::per_tensor(0.02, -5))
    }

    fn conv_relu(relu_ty: TensorType) -> (ethosu_ir::Graph, TensorId) {
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", q([1, 4, 4, 2]));
        let w = Tensor::from_i8(
            &[3, 1, 1, 2],
            vec![1, 2, 3, 4, 5, 6],
            Some(QuantParams::per_tensor(0.01, 0)),
        )
        .unwrap();
        let w = b.constant("w", w);
        let c = b
            .push(Op::Conv2d(Conv2dAttrs::default()), &[x, w], q([1, 4, 4, 3]))
            .unwrap();
        let y = b.push(Op::Relu6, &[c], relu_ty).unwrap();
        b.output(y);
        (b.finish().unwrap(), y)
    }

    #[test]
    fn folds_relu6_into_conv() {
        let (mut graph, y) = conv_relu(q([1, 4, 4, 3]));
        assert!(FuseActivation.run(&mut graph));
        assert_eq!(graph.node_count(), 1);
        let node = &graph.nodes[0];
        assert_eq!(node.outputs, vec![y]);
        match &node.op {
            Op::Conv2d(attrs) => assert_eq!(attrs.activation, FusedActivation::Relu6),
            other => panic!("unexpected op {other}"),
        }
        graph.validate().unwrap();
    }

    #[test]
    fn quantization_change_blocks_fusion() {
        let other = TensorType::quantized(DType::Int8, [1, 4, 4, 3], QuantParams::per_tensor(0.03, -128));
        let (mut graph, _) = conv_relu(other);
        assert!(!FuseActivation.run(&mut graph));
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn shared_intermediate_blocks_fusion() {
        let ty = q([1, 1, 1, 4]);
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", ty.clone());
        let s = b.push(Op::Add { activation: FusedActivation::None }, &[x, x], ty.clone()).unwrap();
        let r = b.push(Op::Relu, &[s], ty.clone()).unwrap();
        b.output(r);
        b.output(s);
        let mut graph = b.finish().unwrap();
        assert!(!FuseActivation.run(&mut graph));
    }

    #[test]
    fn lut_activation_is_not_a_producer() {
        let ty = q([1, 1, 1, 4]);
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", ty.clone());
        let s = b.push(Op::Sigmoid, &[x], ty.clone()).unwrap();
        let r = b.push(Op::Relu, &[s], ty).unwrap();
        b.output(r);
        let mut graph = b.finish().unwrap();
        assert!(!FuseActivation.run(&mut graph));
    }
}
