//! Dead node elimination pass.
//!
//! Removes operator nodes whose outputs are neither graph outputs nor
//! consumed by any other node. Boundary markers are never removed.

use std::collections::HashSet;

use ethosu_ir::{Graph, TensorId};

use crate::Pass;

/// Removes nodes with no observable outputs.
#[derive(Debug)]
pub struct DeadNodeElimination;

impl Pass for DeadNodeElimination {
    fn name(&self) -> &str {
        "dce"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        let mut changed = false;
        loop {
            let used: HashSet<TensorId> = graph
                .nodes
                .iter()
                .flat_map(|n| n.inputs.iter().copied())
                .chain(graph.outputs.iter().copied())
                .collect();
            let before = graph.nodes.len();
            graph.nodes.retain(|n| {
                let live = n.op.is_marker() || n.outputs.iter().any(|t| used.contains(t));
                if !live {
                    log::debug!("dce: removing '{}'", n.name);
                }
                live
            });
            if graph.nodes.len() == before {
                break;
            }
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosu_ir::{DType, GraphBuilder, Op, QuantParams, TensorType};

    fn ty() -> TensorType {
        TensorType::quantized(DType::Int8, [1, 4], QuantParams::per_tensor(0.05, 3))
    }

    #[test]
    fn removes_dead_chain() {
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", ty());
        let a = b.push(Op::Relu, &[x], ty()).unwrap();
        let _dead = b.push(Op::Tanh, &[a], ty()).unwrap();
        let y = b.push(Op::Sigmoid, &[x], ty()).unwrap();
        b.output(y);
        let mut graph = b.finish().unwrap();

        assert!(DeadNodeElimination.run(&mut graph));
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.nodes[0].op, Op::Sigmoid);
        assert!(!DeadNodeElimination.run(&mut graph));
    }

    #[test]
    fn keeps_graph_outputs() {
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", ty());
        let a = b.push(Op::Relu, &[x], ty()).unwrap();
        let y = b.push(Op::Tanh, &[a], ty()).unwrap();
        b.output(a);
        b.output(y);
        let mut graph = b.finish().unwrap();

        assert!(!DeadNodeElimination.run(&mut graph));
        assert_eq!(graph.node_count(), 2);
    }
}
