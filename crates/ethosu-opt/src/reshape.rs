//! Reshape folding pass.
//!
//! A reshape of a reshape reads the original tensor directly; the inner
//! reshape is then left for dead node elimination. A reshape whose output
//! type equals its input type is removed and its consumers read the input.

use ethosu_ir::{Graph, NodeId, Op, TensorId};

use crate::Pass;

/// Collapses reshape chains and identity reshapes.
#[derive(Debug)]
pub struct FoldReshape;

enum Rewrite {
    /// Point the reshape at a new source tensor.
    Retarget { node: NodeId, source: TensorId },
    /// Remove an identity reshape, replacing `from` with `to` everywhere.
    Bypass { node: NodeId, from: TensorId, to: TensorId },
}

fn find_rewrite(graph: &Graph) -> Option<Rewrite> {
    for node in &graph.nodes {
        if node.op != Op::Reshape {
            continue;
        }
        let ([input], [output]) = (node.inputs.as_slice(), node.outputs.as_slice()) else {
            continue;
        };
        if let Some(inner) = graph.producer(*input)
            && inner.op == Op::Reshape
            && let [source] = inner.inputs.as_slice()
        {
            return Some(Rewrite::Retarget {
                node: node.id,
                source: *source,
            });
        }
        let (Ok(a), Ok(b)) = (graph.tensor(*input), graph.tensor(*output)) else {
            continue;
        };
        if a.ty == b.ty && !graph.outputs.contains(output) {
            return Some(Rewrite::Bypass {
                node: node.id,
                from: *output,
                to: *input,
            });
        }
    }
    None
}

impl Pass for FoldReshape {
    fn name(&self) -> &str {
        "fold-reshape"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        let mut changed = false;
        while let Some(rewrite) = find_rewrite(graph) {
            match rewrite {
                Rewrite::Retarget { node, source } => {
                    if let Some(n) = graph.nodes.iter_mut().find(|n| n.id == node) {
                        log::debug!("fold-reshape: '{}' now reads {source}", n.name);
                        n.inputs = vec![source];
                    }
                }
                Rewrite::Bypass { node, from, to } => {
                    graph.nodes.retain(|n| n.id != node);
                    for n in &mut graph.nodes {
                        for t in n.inputs.iter_mut().filter(|t| **t == from) {
                            *t = to;
                        }
                    }
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
    use crate::DeadNodeElimination;
    use ethosu_ir::{DType, GraphBuilder, QuantParams, TensorType};

    fn q(shape: &[usize]) -> TensorType {
        TensorType::quantized(DType::Int8, shape, QuantParams::per_tensor(0.1, 1))
    }

    #[test]
    fn chain_collapses_to_one_reshape() {
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", q(&[1, 2, 3, 4]));
        let a = b.push(Op::Reshape, &[x], q(&[1, 6, 4])).unwrap();
        let c = b.push(Op::Reshape, &[a], q(&[24])).unwrap();
        b.output(c);
        let mut graph = b.finish().unwrap();

        assert!(FoldReshape.run(&mut graph));
        assert!(DeadNodeElimination.run(&mut graph));
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.nodes[0].inputs, vec![x]);
        assert_eq!(graph.nodes[0].outputs, vec![c]);
    }

    #[test]
    fn identity_reshape_is_bypassed() {
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", q(&[1, 8]));
        let r = b.push(Op::Reshape, &[x], q(&[1, 8])).unwrap();
        let y = b.push(Op::Relu, &[r], q(&[1, 8])).unwrap();
        b.output(y);
        let mut graph = b.finish().unwrap();

        assert!(FoldReshape.run(&mut graph));
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.nodes[0].inputs, vec![x]);
        graph.validate().unwrap();
    }

    #[test]
    fn identity_reshape_feeding_output_is_kept() {
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", q(&[1, 8]));
        let r = b.push(Op::Reshape, &[x], q(&[1, 8])).unwrap();
        b.output(r);
        let mut graph = b.finish().unwrap();
        assert!(!FoldReshape.run(&mut graph));
    }
}
