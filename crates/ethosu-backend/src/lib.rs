//! Arm Ethos-U region compiler.
//!
//! Compiles one accelerator region (a standalone quantized graph) into a
//! [`LoweredProgram`]: the region is re-checked against the capability
//! table, optimized, lowered operator by operator, placed in memory and
//! encoded as a command stream with a constant blob.

mod constants;
mod lower;

use std::collections::{BTreeMap, HashMap};

use ethosu_backend_core::command::{Command, FeatureMap, encode};
use ethosu_backend_core::{
    Backend, BackendError, Diagnostic, HardwareConfig, IoBinding, LoweredProgram, PoolAllocation,
};
use ethosu_ir::{Graph, Node, TensorId};
use ethosu_opt::memory::{BufferRequest, LiveInterval, MemoryPlan, Placement, plan_memory};
use ethosu_opt::{OptLevel, PassManager};
use ethosu_partition::{EthosUSupport, OperatorSupport, SupportDecision};

use crate::lower::{Lowering, Step, StepOp};

/// Target identifiers handled by [`EthosUBackend`].
pub const TARGETS: [&str; 5] = [
    "ethos-u55-256",
    "ethos-u55-128",
    "ethos-u55-64",
    "ethos-u55-32",
    "ethos-u65-256",
];

/// Arm Ethos-U backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct EthosUBackend {
    pub opt_level: OptLevel,
}

impl EthosUBackend {
    pub fn new(opt_level: OptLevel) -> Self {
        Self { opt_level }
    }
}

impl Backend for EthosUBackend {
    fn name(&self) -> &str {
        "Arm Ethos-U"
    }

    fn targets(&self) -> &[&str] {
        &TARGETS
    }

    fn compile(
        &self,
        region: &Graph,
        config: &HardwareConfig,
    ) -> Result<LoweredProgram, BackendError> {
        compile_region(region, config, self.opt_level)
    }
}

/// Where every feature map of the region lives.
struct Layout {
    plan: MemoryPlan,
    slots: HashMap<TensorId, Placement>,
    /// Constant feature maps, as offsets into the constant blob.
    constant_maps: HashMap<TensorId, u32>,
}

impl Layout {
    fn locate(&self, id: TensorId) -> Option<(usize, usize)> {
        if let Some(&offset) = self.constant_maps.get(&id) {
            return Some((self.plan.constants_pool, offset as usize));
        }
        self.slots.get(&id).map(|p| (p.pool, p.offset))
    }
}

/// Compiles a region graph for `config`.
pub fn compile_region(
    region: &Graph,
    config: &HardwareConfig,
    level: OptLevel,
) -> Result<LoweredProgram, BackendError> {
    region.validate()?;
    for node in &region.nodes {
        if let SupportDecision::Unsupported(reason) = EthosUSupport.check(region, node) {
            return Err(BackendError::Unsupported {
                node: node.name.clone(),
                reason,
            });
        }
    }

    let mut graph = region.clone();
    if PassManager::for_level(level).run(&mut graph) {
        log::debug!(
            "optimized region from {} to {} node(s)",
            region.node_count(),
            graph.node_count()
        );
    }
    let order: Vec<Node> = graph.topological_order()?.into_iter().cloned().collect();

    let mut lowering = Lowering::new(&graph, config.variant);
    let steps = order
        .iter()
        .map(|node| lowering.lower(node))
        .collect::<Result<Vec<Step>, _>>()?;
    let (constants, constant_maps) = lowering.finish();

    let requests = buffer_requests(&graph, &steps, &constant_maps)?;
    let plan = plan_memory(
        &requests.iter().map(|(_, r)| r.clone()).collect::<Vec<_>>(),
        config,
        constants.len(),
    )?;
    let slots = requests
        .iter()
        .zip(&plan.placements)
        .map(|((id, _), p)| (*id, *p))
        .collect();
    let layout = Layout {
        plan,
        slots,
        constant_maps,
    };

    let mut commands = Vec::new();
    for step in &steps {
        emit(&graph, &layout, step, &mut commands)?;
    }
    commands.push(Command::Stop);
    let command_stream = encode(&commands);

    let pools: Vec<PoolAllocation> = config
        .pools
        .iter()
        .zip(&layout.plan.used)
        .map(|(p, &used)| PoolAllocation {
            area: p.area,
            capacity: p.capacity,
            used,
        })
        .collect();
    let inputs = bindings(&graph, &graph.inputs, &layout)?;
    let outputs = bindings(&graph, &graph.outputs, &layout)?;

    let mut diagnostics = vec![Diagnostic::info(format!(
        "{} operation(s), {} constant byte(s)",
        steps.len(),
        constants.len()
    ))];
    for p in &pools {
        diagnostics.push(Diagnostic::info(format!(
            "{}: {} of {} bytes used",
            p.area, p.used, p.capacity
        )));
    }
    let primary = config.pools.iter().position(|p| p.activations);
    for ((_, request), placement) in requests.iter().zip(&layout.plan.placements) {
        if Some(placement.pool) == primary {
            continue;
        }
        if let Some(pool) = config.pools.get(placement.pool) {
            diagnostics.push(Diagnostic::warning(format!(
                "feature map '{}' spilled to {}",
                request.name, pool.area
            )));
        }
    }

    let program = LoweredProgram {
        variant: config.variant,
        command_stream,
        constants,
        constants_pool: layout.plan.constants_pool,
        pools,
        inputs,
        outputs,
        diagnostics,
    };
    log::info!("compiled region: {program}");
    Ok(program)
}

/// Live intervals of every runtime feature map, in tensor id order.
///
/// Step `i` runs at time `i + 1`; region inputs are live from time 0 and
/// region outputs until after the last step.
fn buffer_requests(
    graph: &Graph,
    steps: &[Step],
    constant_maps: &HashMap<TensorId, u32>,
) -> Result<Vec<(TensorId, BufferRequest)>, BackendError> {
    let mut live: BTreeMap<TensorId, LiveInterval> = BTreeMap::new();
    let mut touch = |id: TensorId, time: usize| {
        live.entry(id)
            .and_modify(|l| {
                l.start = l.start.min(time);
                l.end = l.end.max(time);
            })
            .or_insert(LiveInterval {
                start: time,
                end: time,
            });
    };
    for &id in &graph.inputs {
        touch(id, 0);
    }
    for (i, step) in steps.iter().enumerate() {
        let time = i + 1;
        touch(step.ifm, time);
        if let Some(ifm2) = step.ifm2 {
            touch(ifm2, time);
        }
        touch(step.ofm, time);
    }
    for &id in &graph.outputs {
        touch(id, steps.len() + 1);
    }

    live.into_iter()
        .filter(|(id, _)| !constant_maps.contains_key(id))
        .map(|(id, interval)| {
            let info = graph.tensor(id)?;
            if info.constant.is_some() {
                return Err(BackendError::Other(format!(
                    "constant tensor '{}' used as a feature map",
                    info.name
                )));
            }
            Ok((
                id,
                BufferRequest {
                    name: info.name.clone(),
                    size_bytes: info.ty.size_bytes(),
                    live: interval,
                },
            ))
        })
        .collect()
}

fn feature_map(
    graph: &Graph,
    layout: &Layout,
    id: TensorId,
    zero_point: Option<i32>,
) -> Result<FeatureMap, BackendError> {
    let info = graph.tensor(id)?;
    let (pool, offset) = layout
        .locate(id)
        .ok_or_else(|| BackendError::Other(format!("tensor '{}' was not placed", info.name)))?;
    let [_, height, width, depth] = info
        .ty
        .shape
        .to_nhwc()
        .ok_or_else(|| BackendError::Other(format!("tensor '{}' has rank above 4", info.name)))?;
    let zero_point = zero_point
        .or_else(|| info.ty.quant.as_ref().map(|q| q.zero_point()))
        .unwrap_or(0);
    Ok(FeatureMap {
        pool: pool as u8,
        offset: offset as u32,
        height: height as u32,
        width: width as u32,
        depth: depth as u32,
        dtype: info.ty.dtype,
        zero_point,
    })
}

fn emit(
    graph: &Graph,
    layout: &Layout,
    step: &Step,
    out: &mut Vec<Command>,
) -> Result<(), BackendError> {
    match &step.op {
        StepOp::Dma { length } => {
            let src = feature_map(graph, layout, step.ifm, None)?;
            let dst = feature_map(graph, layout, step.ofm, None)?;
            out.push(Command::OpDma {
                src_pool: src.pool,
                src_offset: src.offset,
                dst_pool: dst.pool,
                dst_offset: dst.offset,
                length: *length,
            });
        }
        StepOp::Launch(op) => {
            out.push(Command::SetIfm(feature_map(graph, layout, step.ifm, None)?));
            if let Some(ifm2) = step.ifm2 {
                out.push(Command::SetIfm2(feature_map(graph, layout, ifm2, None)?));
            }
            out.push(Command::SetOfm(feature_map(
                graph,
                layout,
                step.ofm,
                step.ofm_zero_point,
            )?));
            out.extend(step.setup.iter().copied());
            out.push(*op);
        }
    }
    log::trace!("emitted '{}'", step.node);
    Ok(())
}

fn bindings(graph: &Graph, ids: &[TensorId], layout: &Layout) -> Result<Vec<IoBinding>, BackendError> {
    ids.iter()
        .map(|&id| {
            let info = graph.tensor(id)?;
            let (pool, offset) = layout.locate(id).ok_or_else(|| {
                BackendError::Other(format!("interface tensor '{}' was not placed", info.name))
            })?;
            Ok(IoBinding {
                name: info.name.clone(),
                pool,
                offset,
                ty: info.ty.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosu_backend_core::command::PoolMode;
    use ethosu_backend_core::{AcceleratorVariant, DiagnosticLevel, MemoryArea};
    use ethosu_ir::{
        Conv2dAttrs, DType, FusedActivation, GraphBuilder, Op, QuantParams, Tensor, TensorType,
    };

    fn q(shape: &[usize], scale: f32, zp: i32) -> TensorType {
        TensorType::quantized(DType::Int8, shape, QuantParams::per_tensor(scale, zp))
    }

    fn sigmoid_region(shape: &[usize]) -> Graph {
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", q(shape, 0.05, 0));
        let y = b.push(Op::Sigmoid, &[x], q(shape, 1.0 / 256.0, -128)).unwrap();
        b.output(y);
        b.finish().unwrap()
    }

    fn config(variant: AcceleratorVariant) -> HardwareConfig {
        HardwareConfig::for_variant(variant)
    }

    #[test]
    fn backend_metadata() {
        let backend = EthosUBackend::default();
        assert_eq!(backend.name(), "Arm Ethos-U");
        for v in AcceleratorVariant::ALL {
            assert!(backend.targets().contains(&v.name()));
        }
    }

    #[test]
    fn sigmoid_program_layout() {
        let graph = sigmoid_region(&[1, 135, 41, 6]);
        let program = EthosUBackend::default()
            .compile(&graph, &config(AcceleratorVariant::EthosU55_128))
            .unwrap();

        assert_eq!(program.operation_count(), 1);
        assert_eq!(program.constants.len(), 256);
        assert_eq!(program.constants_pool, 1);
        assert_eq!(program.inputs.len(), 1);
        assert_eq!(program.outputs.len(), 1);

        // Input and output are live at the same step and must not alias.
        let size = 135 * 41 * 6;
        let (i, o) = (&program.inputs[0], &program.outputs[0]);
        assert_eq!(i.pool, 0);
        assert_eq!(o.pool, 0);
        assert!(i.offset + size <= o.offset || o.offset + size <= i.offset);

        let commands = program.commands().unwrap();
        assert!(commands.contains(&Command::OpPool(PoolMode::Identity)));
        assert_eq!(commands.last(), Some(&Command::Stop));
    }

    #[test]
    fn compilation_is_deterministic() {
        let graph = sigmoid_region(&[1, 8, 8, 4]);
        let cfg = config(AcceleratorVariant::EthosU55_64);
        let a = EthosUBackend::default().compile(&graph, &cfg).unwrap();
        let b = EthosUBackend::default().compile(&graph, &cfg).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn oversized_region_reports_tensor() {
        let graph = sigmoid_region(&[1, 512, 512, 3]);
        let err = EthosUBackend::default()
            .compile(&graph, &config(AcceleratorVariant::EthosU55_256))
            .unwrap_err();
        match err {
            BackendError::ResourceExhausted {
                tensor, required, ..
            } => {
                assert_eq!(tensor, "x");
                assert_eq!(required, 786_432);
            }
            other => panic!("unexpected error {other}"),
        }

        // The same region fits once SRAM is enlarged.
        let cfg = config(AcceleratorVariant::EthosU55_256).with_pool_capacity(MemoryArea::Sram, 2 << 20);
        EthosUBackend::default().compile(&graph, &cfg).unwrap();
    }

    #[test]
    fn spilled_feature_map_is_reported() {
        let graph = sigmoid_region(&[1, 8, 8, 4]);
        let cfg = config(AcceleratorVariant::EthosU65_256).with_pool_capacity(MemoryArea::Sram, 256);
        let program = EthosUBackend::default().compile(&graph, &cfg).unwrap();
        let warnings: Vec<_> = program
            .diagnostics
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Warning)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("DRAM"));
    }

    #[test]
    fn unsupported_node_is_named() {
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", q(&[1, 4], 0.05, 0));
        let y = b.push(Op::Softmax { beta: 1.0 }, &[x], q(&[1, 4], 1.0 / 256.0, -128)).unwrap();
        b.output(y);
        let graph = b.finish().unwrap();

        let err = EthosUBackend::default()
            .compile(&graph, &config(AcceleratorVariant::EthosU55_128))
            .unwrap_err();
        assert!(matches!(err, BackendError::Unsupported { ref node, .. } if node == "softmax_0"));
    }

    #[test]
    fn fused_relu_emits_single_operation() {
        let ty = q(&[1, 4, 4, 2], 0.1, 0);
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", ty.clone());
        let w = Tensor::from_i8(&[2, 1, 1, 2], vec![1, 0, 0, 1], Some(QuantParams::per_tensor(1.0, 0))).unwrap();
        let w = b.constant("w", w);
        let c = b.push(Op::Conv2d(Conv2dAttrs::default()), &[x, w], ty.clone()).unwrap();
        let y = b.push(Op::Relu, &[c], ty).unwrap();
        b.output(y);
        let graph = b.finish().unwrap();
        let cfg = config(AcceleratorVariant::EthosU55_32);

        let fused = compile_region(&graph, &cfg, OptLevel::O1).unwrap();
        assert_eq!(fused.operation_count(), 1);
        let plain = compile_region(&graph, &cfg, OptLevel::O0).unwrap();
        assert_eq!(plain.operation_count(), 2);
    }

    #[test]
    fn constant_second_operand_lives_in_constants_pool() {
        let ty = q(&[1, 4], 0.5, 0);
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", ty.clone());
        let c = b.constant(
            "c",
            Tensor::from_i8(&[1, 4], vec![1, 2, 3, 4], ty.quant.clone()).unwrap(),
        );
        let y = b
            .push(Op::Add { activation: FusedActivation::None }, &[x, c], ty)
            .unwrap();
        b.output(y);
        let graph = b.finish().unwrap();

        let program = compile_region(&graph, &config(AcceleratorVariant::EthosU55_64), OptLevel::O1).unwrap();
        assert_eq!(&program.constants[..4], &[1, 2, 3, 4]);
        let ifm2 = program
            .commands()
            .unwrap()
            .into_iter()
            .find_map(|c| match c {
                Command::SetIfm2(fm) => Some(fm),
                _ => None,
            })
            .unwrap();
        assert_eq!(ifm2.pool as usize, program.constants_pool);
        assert_eq!(ifm2.offset, 0);
    }
}
