//! Boundary-marker invariant checks for partitioned graphs.

use std::collections::HashSet;

use ethosu_ir::{Graph, IrError, Op, TensorId};

use crate::support::OperatorSupport;

/// A violated partition invariant.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("region r{region}: node '{node}' is not supported: {reason}")]
    UnsupportedInRegion {
        region: u32,
        node: String,
        reason: String,
    },

    #[error("region r{region}: tensor '{tensor}' leaves the region without passing its end marker")]
    Leak { region: u32, tensor: String },

    #[error("region r{region}: {reason}")]
    Boundary { region: u32, reason: String },
}

/// Verifies that every region is delimited by exactly one begin/end pair,
/// encloses only supported operators, and is entered and left only through
/// its markers.
pub fn check_boundaries(graph: &Graph, support: &dyn OperatorSupport) -> Result<(), PartitionError> {
    graph.validate()?;
    graph.region_membership()?;

    for region in graph.regions() {
        let begin = graph.region_begin(region).ok_or(IrError::UnknownRegion(region.0))?;
        let end = graph.region_end(region).ok_or(IrError::MalformedRegion {
            region: region.0,
            reason: "missing end marker".into(),
        })?;
        if let Op::RegionBegin { compiler, .. } = &begin.op
            && compiler != support.compiler()
        {
            return Err(PartitionError::Boundary {
                region: region.0,
                reason: format!("compiled by '{compiler}', expected '{}'", support.compiler()),
            });
        }
        if begin.inputs.len() != begin.outputs.len() || end.inputs.len() != end.outputs.len() {
            return Err(PartitionError::Boundary {
                region: region.0,
                reason: "marker inputs and aliases differ in number".into(),
            });
        }

        let members = graph.region_members(region)?;
        if members.is_empty() {
            return Err(PartitionError::Boundary {
                region: region.0,
                reason: "encloses no operators".into(),
            });
        }
        let produced: HashSet<TensorId> = members
            .iter()
            .flat_map(|n| n.outputs.iter().copied())
            .collect();
        let aliases: HashSet<TensorId> = begin.outputs.iter().copied().collect();

        for node in &members {
            if let Some(reason) = support.check(graph, node).reason() {
                return Err(PartitionError::UnsupportedInRegion {
                    region: region.0,
                    node: node.name.clone(),
                    reason: reason.to_string(),
                });
            }
            for &t in &node.inputs {
                if !produced.contains(&t) && !aliases.contains(&t) && !graph.is_constant(t) {
                    return Err(PartitionError::Boundary {
                        region: region.0,
                        reason: format!(
                            "'{}' reads '{}' without passing the begin marker",
                            node.name,
                            graph.tensor(t)?.name
                        ),
                    });
                }
            }
        }

        for &t in &end.inputs {
            if !produced.contains(&t) {
                return Err(PartitionError::Boundary {
                    region: region.0,
                    reason: format!("exit '{}' is not produced inside the region", graph.tensor(t)?.name),
                });
            }
        }

        let member_ids: HashSet<_> = members.iter().map(|n| n.id).collect();
        for &t in &produced {
            let escapes = graph.outputs.contains(&t)
                || graph
                    .consumers(t)
                    .iter()
                    .any(|c| !member_ids.contains(&c.id) && c.id != end.id);
            if escapes {
                return Err(PartitionError::Leak {
                    region: region.0,
                    tensor: graph.tensor(t)?.name.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partition;
    use crate::support::EthosUSupport;
    use ethosu_ir::{DType, GraphBuilder, QuantParams, RegionId, TensorInfo, TensorType};

    fn q() -> TensorType {
        TensorType::quantized(DType::Int8, [1, 4], QuantParams::per_tensor(0.05, 0))
    }

    #[test]
    fn partitioned_graph_passes() {
        let mut b = GraphBuilder::new();
        let x = b.input_typed("ifm", q());
        let r = b.push(Op::Relu, &[x], q()).unwrap();
        let s = b.push(Op::Softmax { beta: 1.0 }, &[r], q()).unwrap();
        b.output(s);
        let out = partition(&b.finish().unwrap(), &EthosUSupport).unwrap();
        check_boundaries(&out, &EthosUSupport).unwrap();
    }

    #[test]
    fn unsupported_member_detected() {
        let mut graph = Graph::new();
        let x = graph.add_tensor(TensorInfo::new("x", q()));
        let xa = graph.add_tensor(TensorInfo::new("x_in", q()));
        let y = graph.add_tensor(TensorInfo::new("y", q()));
        let ya = graph.add_tensor(TensorInfo::new("y_out", q()));
        graph.inputs = vec![x];
        graph.outputs = vec![ya];
        let region = RegionId(0);
        graph.add_node(
            Op::RegionBegin {
                region,
                compiler: "ethos-u".into(),
            },
            vec![x],
            vec![xa],
            "begin",
        );
        graph.add_node(Op::Softmax { beta: 1.0 }, vec![xa], vec![y], "softmax");
        graph.add_node(Op::RegionEnd { region }, vec![y], vec![ya], "end");

        let err = check_boundaries(&graph, &EthosUSupport).unwrap_err();
        assert!(matches!(err, PartitionError::UnsupportedInRegion { region: 0, .. }));
    }

    #[test]
    fn leaking_tensor_detected() {
        let mut graph = Graph::new();
        let x = graph.add_tensor(TensorInfo::new("x", q()));
        let xa = graph.add_tensor(TensorInfo::new("x_in", q()));
        let y = graph.add_tensor(TensorInfo::new("y", q()));
        let ya = graph.add_tensor(TensorInfo::new("y_out", q()));
        graph.inputs = vec![x];
        // Uses the inner tensor instead of the end alias.
        graph.outputs = vec![y, ya];
        let region = RegionId(0);
        graph.add_node(
            Op::RegionBegin {
                region,
                compiler: "ethos-u".into(),
            },
            vec![x],
            vec![xa],
            "begin",
        );
        graph.add_node(Op::Relu, vec![xa], vec![y], "relu");
        graph.add_node(Op::RegionEnd { region }, vec![y], vec![ya], "end");

        let err = check_boundaries(&graph, &EthosUSupport).unwrap_err();
        assert!(matches!(err, PartitionError::Leak { region: 0, .. }));
    }

    #[test]
    fn missing_end_detected() {
        let mut b = GraphBuilder::new();
        let x = b.input_typed("ifm", q());
        let y = b.push(Op::Relu, &[x], q()).unwrap();
        b.output(y);
        let mut graph = partition(&b.finish().unwrap(), &EthosUSupport).unwrap();
        graph.nodes.retain(|n| !matches!(n.op, Op::RegionEnd { .. }));
        graph.outputs.clear();
        assert!(check_boundaries(&graph, &EthosUSupport).is_err());
    }
}
