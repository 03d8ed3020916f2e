//! Execution of partitioned graphs.
//!
//! Accelerator regions run as compiled programs on a [`Device`]; every
//! other node runs on the reference kernels. Compilation of all regions
//! happens up front so that a backend failure is reported before any
//! device execution.

use std::collections::{BTreeMap, HashMap, HashSet};

use ethosu_backend_core::{Backend, Device, HardwareConfig, LoweredProgram};
use ethosu_ir::{Graph, IrError, NodeId, Op, RegionId, Tensor, TensorId};
use ethosu_reference::{ReferenceError, bind_inputs, execute_node, gather};

use crate::CompareError;

/// A partitioned graph with one compiled program per region.
#[derive(Debug)]
pub struct CompiledGraph<'g> {
    pub graph: &'g Graph,
    pub programs: BTreeMap<RegionId, LoweredProgram>,
    members: HashSet<NodeId>,
}

impl CompiledGraph<'_> {
    /// Number of nodes that execute on the accelerator.
    pub fn offloaded_nodes(&self) -> usize {
        self.members.len()
    }

    /// Number of non-marker nodes that execute on the host.
    pub fn host_nodes(&self) -> usize {
        self.graph
            .nodes
            .iter()
            .filter(|n| !n.op.is_marker() && !self.members.contains(&n.id))
            .count()
    }
}

/// Runs partitioned graphs across a backend, a device and the host.
#[derive(Debug)]
pub struct HybridRuntime<'a> {
    backend: &'a dyn Backend,
    device: &'a dyn Device,
}

impl<'a> HybridRuntime<'a> {
    pub fn new(backend: &'a dyn Backend, device: &'a dyn Device) -> Self {
        Self { backend, device }
    }

    /// Extracts and compiles every region of `graph`.
    pub fn compile<'g>(
        &self,
        graph: &'g Graph,
        config: &HardwareConfig,
    ) -> Result<CompiledGraph<'g>, CompareError> {
        let members = graph.region_membership()?.into_keys().collect();
        let mut programs = BTreeMap::new();
        for region in graph.regions() {
            let sub = graph.extract_region(region)?;
            let program = self
                .backend
                .compile(&sub, config)
                .map_err(|source| CompareError::Compile { region, source })?;
            log::debug!("{region}: {program}");
            programs.insert(region, program);
        }
        Ok(CompiledGraph {
            graph,
            programs,
            members,
        })
    }

    /// Executes `compiled` on `inputs` and returns the graph outputs.
    pub fn execute(&self, compiled: &CompiledGraph<'_>, inputs: &[Tensor]) -> Result<Vec<Tensor>, CompareError> {
        let graph = compiled.graph;
        let mut values: HashMap<TensorId, Tensor> = bind_inputs(graph, inputs)?;

        for node in graph.topological_order()? {
            if compiled.members.contains(&node.id) {
                continue;
            }
            match &node.op {
                Op::RegionBegin { region, .. } => {
                    let program = compiled
                        .programs
                        .get(region)
                        .ok_or_else(|| CompareError::MissingProgram(*region))?;
                    let end = graph
                        .region_end(*region)
                        .ok_or(IrError::UnknownRegion(region.0))?;
                    let operands: Vec<Tensor> = gather(graph, &values, node)?.into_iter().cloned().collect();
                    let results = self.device.execute(program, &operands)?;
                    if results.len() != end.outputs.len() {
                        return Err(CompareError::OutputCount {
                            expected: end.outputs.len(),
                            found: results.len(),
                        });
                    }
                    for (&t, value) in end.outputs.iter().zip(results) {
                        values.insert(t, value);
                    }
                }
                // Produced when the matching begin marker ran.
                Op::RegionEnd { .. } => {}
                _ => {
                    let operands = gather(graph, &values, node)?;
                    let results = execute_node(graph, node, &operands)?;
                    for (&t, value) in node.outputs.iter().zip(results) {
                        values.insert(t, value);
                    }
                }
            }
        }

        graph
            .outputs
            .iter()
            .map(|t| {
                values.get(t).cloned().ok_or_else(|| {
                    let name = graph.tensor(*t).map(|i| i.name.clone()).unwrap_or_default();
                    CompareError::Reference(ReferenceError::MissingValue(name))
                })
            })
            .collect()
    }
}
