//! Two-pass graph partitioning.
//!
//! Pass one orders the nodes with a support-preferring topological
//! traversal and groups maximal runs of supported nodes into regions. Pass
//! two builds a new graph in which every region is wrapped by a
//! `RegionBegin` / `RegionEnd` marker pair.

use std::collections::{BTreeSet, HashMap, HashSet};

use ethosu_ir::{Graph, IrError, NodeId, Op, RegionId, TensorId, TensorInfo};

use crate::support::OperatorSupport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    /// Can be wrapped into a region.
    Offload,
    /// Stays on the host.
    Host,
    /// Markers and nodes of pre-existing regions; never re-wrapped.
    Opaque,
}

/// A region found by pass one.
#[derive(Clone, Debug)]
struct Run {
    /// Node indices in emission order.
    nodes: Vec<usize>,
}

/// Orders nodes topologically, preferring among ready nodes one whose
/// status matches the previously emitted node (ties: smallest id).
fn preferring_order(graph: &Graph, status: &[Status]) -> Result<Vec<usize>, IrError> {
    let n = graph.nodes.len();
    let mut producer: HashMap<TensorId, usize> = HashMap::new();
    for (i, node) in graph.nodes.iter().enumerate() {
        for &t in &node.outputs {
            producer.insert(t, i);
        }
    }
    let mut in_degree = vec![0usize; n];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (ci, node) in graph.nodes.iter().enumerate() {
        for t in &node.inputs {
            if let Some(&pi) = producer.get(t) {
                in_degree[ci] += 1;
                consumers[pi].push(ci);
            }
        }
    }

    let mut ready: BTreeSet<(NodeId, usize)> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(|i| (graph.nodes[i].id, i))
        .collect();
    let mut order = Vec::with_capacity(n);
    let mut last: Option<Status> = None;
    while !ready.is_empty() {
        let pick = last
            .and_then(|s| ready.iter().find(|&&(_, i)| status[i] == s).copied())
            .or_else(|| ready.first().copied());
        let Some(entry) = pick else { break };
        ready.remove(&entry);
        let idx = entry.1;
        order.push(idx);
        last = Some(status[idx]);
        for &ci in &consumers[idx] {
            in_degree[ci] -= 1;
            if in_degree[ci] == 0 {
                ready.insert((graph.nodes[ci].id, ci));
            }
        }
    }
    if order.len() != n {
        return Err(IrError::Cycle {
            visited: order.len(),
            total: n,
        });
    }
    Ok(order)
}

fn classify(graph: &Graph, support: &dyn OperatorSupport) -> Result<Vec<Status>, IrError> {
    let enclosed = graph.region_membership()?;
    Ok(graph
        .nodes
        .iter()
        .map(|node| {
            if node.op.is_marker() || enclosed.contains_key(&node.id) {
                return Status::Opaque;
            }
            // A node fed only by constants has no entry tensor to bind.
            if node.inputs.iter().all(|&t| graph.is_constant(t)) {
                return Status::Host;
            }
            let decision = support.check(graph, node);
            match decision.reason() {
                None => Status::Offload,
                Some(reason) => {
                    log::debug!("partition: '{}' stays on host: {reason}", node.name);
                    Status::Host
                }
            }
        })
        .collect())
}

/// Tensors produced inside `run` that are consumed outside it or are
/// graph outputs, in production order.
fn exits(graph: &Graph, run: &[usize]) -> Vec<TensorId> {
    let members: HashSet<usize> = run.iter().copied().collect();
    let mut out = Vec::new();
    for &i in run {
        for &t in &graph.nodes[i].outputs {
            let escapes = graph.outputs.contains(&t)
                || graph
                    .nodes
                    .iter()
                    .enumerate()
                    .any(|(j, n)| !members.contains(&j) && n.inputs.contains(&t));
            if escapes && !out.contains(&t) {
                out.push(t);
            }
        }
    }
    out
}

/// Non-constant tensors consumed by `run` but not produced inside it, in
/// order of first use.
fn entries(graph: &Graph, run: &[usize]) -> Vec<TensorId> {
    let produced: HashSet<TensorId> = run
        .iter()
        .flat_map(|&i| graph.nodes[i].outputs.iter().copied())
        .collect();
    let mut out = Vec::new();
    for &i in run {
        for &t in &graph.nodes[i].inputs {
            if !produced.contains(&t) && !graph.is_constant(t) && !out.contains(&t) {
                out.push(t);
            }
        }
    }
    out
}

/// Wraps every maximal run of supported operators in boundary markers.
///
/// Unsupported operators, nodes of existing regions and markers are left
/// untouched. The input graph is not modified. When nothing can be
/// offloaded the result equals the input.
pub fn partition(graph: &Graph, support: &dyn OperatorSupport) -> Result<Graph, IrError> {
    graph.validate()?;
    let status = classify(graph, support)?;
    let order = preferring_order(graph, &status)?;

    // Pass one: maximal runs of offloadable nodes in traversal order.
    let mut runs: Vec<Run> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    for &i in &order {
        if status[i] == Status::Offload {
            current.push(i);
        } else if !current.is_empty() {
            runs.push(Run {
                nodes: std::mem::take(&mut current),
            });
        }
    }
    if !current.is_empty() {
        runs.push(Run { nodes: current });
    }
    runs.retain(|run| {
        let keep = !exits(graph, &run.nodes).is_empty();
        if !keep {
            log::debug!("partition: dropping a run of {} node(s) with no exit", run.nodes.len());
        }
        keep
    });

    if runs.is_empty() {
        log::info!("partition: no offloadable operators, graph unchanged");
        return Ok(graph.clone());
    }

    // Pass two: rebuild with markers.
    let next_region = graph.regions().last().map_or(0, |r| r.0 + 1);
    let mut out = Graph::new();
    for info in &graph.tensors {
        out.add_tensor(info.clone());
    }
    out.inputs = graph.inputs.clone();

    let mut region_of: HashMap<usize, usize> = HashMap::new();
    for (r, run) in runs.iter().enumerate() {
        for &i in &run.nodes {
            region_of.insert(i, r);
        }
    }

    // Exit tensor -> alias seen by downstream consumers.
    let mut exit_alias: HashMap<TensorId, TensorId> = HashMap::new();
    let mut offloaded = 0usize;
    let mut emitted_regions: HashSet<usize> = HashSet::new();

    for &i in &order {
        let node = &graph.nodes[i];
        let Some(&r) = region_of.get(&i) else {
            let inputs = node
                .inputs
                .iter()
                .map(|t| exit_alias.get(t).copied().unwrap_or(*t))
                .collect();
            out.add_node(node.op.clone(), inputs, node.outputs.clone(), node.name.clone());
            continue;
        };
        if !emitted_regions.insert(r) {
            continue;
        }

        // Emit the whole region at the position of its first node.
        let run = &runs[r].nodes;
        let region = RegionId(next_region + r as u32);
        let mut entry_alias: HashMap<TensorId, TensorId> = HashMap::new();
        let entry_list = entries(graph, run);
        let mut begin_in = Vec::with_capacity(entry_list.len());
        let mut begin_out = Vec::with_capacity(entry_list.len());
        for t in entry_list {
            let source = graph.tensor(t)?;
            let alias = out.add_tensor(TensorInfo::new(
                format!("{}_{region}_in", source.name),
                source.ty.clone(),
            ));
            begin_in.push(exit_alias.get(&t).copied().unwrap_or(t));
            begin_out.push(alias);
            entry_alias.insert(t, alias);
        }
        out.add_node(
            Op::RegionBegin {
                region,
                compiler: support.compiler().to_string(),
            },
            begin_in,
            begin_out,
            format!("{region}_begin"),
        );
        for &m in run {
            let member = &graph.nodes[m];
            let inputs = member
                .inputs
                .iter()
                .map(|t| entry_alias.get(t).copied().unwrap_or(*t))
                .collect();
            out.add_node(member.op.clone(), inputs, member.outputs.clone(), member.name.clone());
        }
        let exit_list = exits(graph, run);
        let mut end_out = Vec::with_capacity(exit_list.len());
        for &t in &exit_list {
            let source = graph.tensor(t)?;
            let alias = out.add_tensor(TensorInfo::new(
                format!("{}_{region}_out", source.name),
                source.ty.clone(),
            ));
            end_out.push(alias);
            exit_alias.insert(t, alias);
        }
        out.add_node(
            Op::RegionEnd { region },
            exit_list,
            end_out,
            format!("{region}_end"),
        );
        offloaded += run.len();
    }

    out.outputs = graph
        .outputs
        .iter()
        .map(|t| exit_alias.get(t).copied().unwrap_or(*t))
        .collect();
    out.validate()?;

    log::info!(
        "partition: {} region(s), {} offloaded node(s), {} host node(s)",
        runs.len(),
        offloaded,
        status.iter().filter(|&&s| s == Status::Host).count()
    );
    Ok(out)
}
