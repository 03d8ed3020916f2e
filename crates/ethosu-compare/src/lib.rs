//! Reference-versus-accelerator comparison for the Ethos-U pipeline.
//!
//! [`compare_with_reference`] is the harness entry point: it builds a
//! float graph, calibrates and quantizes it, then runs the quantized graph
//! both on the [`ReferenceExecutor`] and through partitioning, compilation
//! and the [`Simulator`], and checks that the outputs agree within one
//! quantized step. [`compare_graph`] does the same for a graph the caller
//! has already built.

mod check;
pub mod models;
mod runtime;

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ethosu_backend::EthosUBackend;
use ethosu_backend_core::{
    AcceleratorVariant, BackendError, DeviceError, HardwareConfig, UnknownVariant,
};
use ethosu_ir::{DType, Graph, GraphBuilder, IrError, RegionId, Tensor, TensorId};
use ethosu_opt::{OptLevel, QuantizeError, TensorRanges, quantize_graph};
use ethosu_partition::{EthosUSupport, PartitionError, check_boundaries, partition};
use ethosu_reference::{ReferenceError, ReferenceExecutor};
use ethosu_sim::Simulator;

use crate::check::{Verdict, compare_tensors};

pub use check::{FLOAT_TOLERANCE, Mismatch};
pub use models::{Model, UnknownModel};
pub use runtime::{CompiledGraph, HybridRuntime};

/// Errors raised by a comparison, tagged with the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    #[error(transparent)]
    Variant(#[from] UnknownVariant),

    #[error("graph construction: {0}")]
    Ir(#[from] IrError),

    #[error("quantization: {0}")]
    Quantize(#[from] QuantizeError),

    #[error("partitioning: {0}")]
    Partition(#[from] PartitionError),

    #[error("reference execution: {0}")]
    Reference(#[from] ReferenceError),

    #[error("compiling region {region}: {source}")]
    Compile {
        region: RegionId,
        #[source]
        source: BackendError,
    },

    #[error("no compiled program for region {0}")]
    MissingProgram(RegionId),

    #[error("device execution: {0}")]
    Device(#[from] DeviceError),

    #[error("expected {expected} output(s), got {found}")]
    OutputCount { expected: usize, found: usize },

    #[error("incomparable outputs: {0}")]
    Incomparable(String),

    #[error("numeric mismatch: {0}")]
    Mismatch(Box<Mismatch>),
}

/// Comparison settings.
#[derive(Clone, Debug)]
pub struct CompareOptions {
    /// Seed for calibration samples and test inputs.
    pub seed: u64,
    /// Number of sample runs used to calibrate float graphs.
    pub calibration_samples: usize,
    /// Allowed deviation of integer outputs, in quantized steps.
    pub tolerance: i64,
    pub opt_level: OptLevel,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            calibration_samples: 8,
            tolerance: 1,
            opt_level: OptLevel::default(),
        }
    }
}

/// Summary of a passing comparison.
#[derive(Clone, Debug, PartialEq)]
pub struct CompareReport {
    pub variant: AcceleratorVariant,
    pub regions: usize,
    /// Nodes executed by the device.
    pub offloaded_nodes: usize,
    /// Nodes executed on the host.
    pub host_nodes: usize,
    pub outputs: usize,
    /// Largest deviation observed across all outputs.
    pub max_deviation: f64,
}

impl fmt::Display for CompareReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} region(s), {} node(s) offloaded, {} on host, {} output(s), max deviation {}",
            self.variant,
            self.regions,
            self.offloaded_nodes,
            self.host_nodes,
            self.outputs,
            self.max_deviation
        )
    }
}

/// Uniform float samples in `[-1, 1)`, one tensor per shape.
pub fn random_inputs(rng: &mut StdRng, shapes: &[Vec<usize>]) -> Result<Vec<Tensor>, IrError> {
    shapes
        .iter()
        .map(|shape| {
            let n: usize = shape.iter().product();
            let values = (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            Tensor::from_f32(shape, values)
        })
        .collect()
}

/// Builds the float graph for `build` with one float32 input per shape.
pub fn build_graph<F>(build: F, shapes: &[Vec<usize>]) -> Result<Graph, IrError>
where
    F: Fn(&mut GraphBuilder, &[TensorId]) -> Result<Vec<TensorId>, IrError>,
{
    let mut b = GraphBuilder::new();
    let inputs: Vec<TensorId> = shapes
        .iter()
        .enumerate()
        .map(|(i, shape)| b.input(format!("input_{i}"), shape.as_slice(), DType::Float32))
        .collect();
    for output in build(&mut b, &inputs)? {
        b.output(output);
    }
    b.finish()
}

/// Calibrates `graph` on seeded samples and returns its int8 version.
pub fn calibrate(graph: &Graph, shapes: &[Vec<usize>], options: &CompareOptions) -> Result<Graph, CompareError> {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut ranges = TensorRanges::new();
    for _ in 0..options.calibration_samples.max(1) {
        let sample = random_inputs(&mut rng, shapes)?;
        ranges.observe(&ReferenceExecutor.run(graph, &sample)?);
    }
    Ok(quantize_graph(graph, &ranges)?)
}

/// Runs the full harness for one operator graph on one accelerator
/// variant.
///
/// `build` receives a builder and one float32 input per entry of
/// `shapes`. The graph is calibrated, quantized and compared with
/// [`compare_graph`] on inputs drawn from a seed independent of the
/// calibration samples.
pub fn compare_with_reference<F>(
    build: F,
    shapes: &[Vec<usize>],
    accel: &str,
    options: &CompareOptions,
) -> Result<CompareReport, CompareError>
where
    F: Fn(&mut GraphBuilder, &[TensorId]) -> Result<Vec<TensorId>, IrError>,
{
    let variant: AcceleratorVariant = accel.parse()?;
    let float = build_graph(build, shapes)?;
    let quantized = calibrate(&float, shapes, options)?;

    let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(1));
    let inputs = random_inputs(&mut rng, shapes)?
        .iter()
        .zip(&quantized.inputs)
        .map(|(value, &id)| Tensor::quantize(&value.dequantize(), &quantized.tensor(id)?.ty))
        .collect::<Result<Vec<_>, _>>()?;

    compare_graph(&quantized, &inputs, &HardwareConfig::for_variant(variant), options)
}

/// Compares the reference outputs of `graph` against the partitioned,
/// compiled and simulated pipeline on the given inputs.
pub fn compare_graph(
    graph: &Graph,
    inputs: &[Tensor],
    config: &HardwareConfig,
    options: &CompareOptions,
) -> Result<CompareReport, CompareError> {
    let expected = ReferenceExecutor.execute(graph, inputs)?;

    let partitioned = partition(graph, &EthosUSupport)?;
    check_boundaries(&partitioned, &EthosUSupport)?;

    let backend = EthosUBackend::new(options.opt_level);
    let device = Simulator;
    let runtime = HybridRuntime::new(&backend, &device);
    let compiled = runtime.compile(&partitioned, config)?;
    let actual = runtime.execute(&compiled, inputs)?;

    if actual.len() != expected.len() {
        return Err(CompareError::OutputCount {
            expected: expected.len(),
            found: actual.len(),
        });
    }
    let mut max_deviation = 0f64;
    for (i, ((e, a), &id)) in expected.iter().zip(&actual).zip(&graph.outputs).enumerate() {
        let name = &graph.tensor(id)?.name;
        match compare_tensors(i, name, e, a, options.tolerance) {
            Verdict::Pass(worst) => max_deviation = max_deviation.max(worst),
            Verdict::Fail(m) => return Err(CompareError::Mismatch(Box::new(m))),
            Verdict::Incomparable(reason) => return Err(CompareError::Incomparable(reason)),
        }
    }

    let report = CompareReport {
        variant: config.variant,
        regions: compiled.programs.len(),
        offloaded_nodes: compiled.offloaded_nodes(),
        host_nodes: compiled.host_nodes(),
        outputs: actual.len(),
        max_deviation,
    };
    log::info!("{report}");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosu_ir::{FusedActivation, Op, QuantParams, TensorType};

    fn sigmoid(b: &mut GraphBuilder, x: &[TensorId]) -> Result<Vec<TensorId>, IrError> {
        Ok(vec![b.sigmoid(x[0])?])
    }

    #[test]
    fn sigmoid_passes_on_every_variant() {
        for v in AcceleratorVariant::ALL {
            let report =
                compare_with_reference(sigmoid, &[vec![1, 6, 5, 3]], v.name(), &CompareOptions::default())
                    .unwrap();
            assert_eq!(report.regions, 1);
            assert_eq!(report.offloaded_nodes, 1);
            assert_eq!(report.host_nodes, 0);
            assert!(report.max_deviation <= 1.0);
        }
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let err = compare_with_reference(sigmoid, &[vec![1, 4]], "ethos-u99", &CompareOptions::default())
            .unwrap_err();
        assert!(matches!(err, CompareError::Variant(_)));
    }

    #[test]
    fn inputs_are_reproducible() {
        let shapes = vec![vec![2, 3]];
        let a = random_inputs(&mut StdRng::seed_from_u64(7), &shapes).unwrap();
        let b = random_inputs(&mut StdRng::seed_from_u64(7), &shapes).unwrap();
        assert_eq!(a[0].raw_values(), b[0].raw_values());
        assert!(a[0].raw_values().iter().all(|v| (-1.0..1.0).contains(v)));
    }

    #[test]
    fn quantized_graph_compares_directly() {
        let ty = TensorType::quantized(DType::Int8, [1, 4], QuantParams::per_tensor(0.1, 0));
        let mut b = GraphBuilder::new();
        let x = b.input_typed("x", ty.clone());
        let y = b.input_typed("y", ty.clone());
        let z = b.push(Op::Add { activation: FusedActivation::Relu }, &[x, y], ty.clone()).unwrap();
        b.output(z);
        let graph = b.finish().unwrap();

        let a = Tensor::from_i8(&[1, 4], vec![-10, 5, 20, 100], ty.quant.clone()).unwrap();
        let c = Tensor::from_i8(&[1, 4], vec![3, -5, 20, 100], ty.quant.clone()).unwrap();
        let config = HardwareConfig::for_variant(AcceleratorVariant::EthosU55_64);
        let report = compare_graph(&graph, &[a, c], &config, &CompareOptions::default()).unwrap();
        assert_eq!(report.offloaded_nodes, 1);
        assert_eq!(report.outputs, 1);
    }
}
