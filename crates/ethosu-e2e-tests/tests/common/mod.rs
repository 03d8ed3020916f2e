use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ethosu_backend::EthosUBackend;
use ethosu_backend_core::{AcceleratorVariant, Backend, BackendError, HardwareConfig, LoweredProgram};
use ethosu_compare::{CompareError, CompareOptions, CompareReport, Model, compare_with_reference};
use ethosu_ir::{DType, Graph, QuantParams, Tensor, TensorType};
use ethosu_opt::OptLevel;
use ethosu_partition::{EthosUSupport, check_boundaries, partition};

/// Runs the full harness for one catalog model.
#[allow(dead_code)]
pub fn try_compare(model: Model, shape: &[usize], accel: &str) -> Result<CompareReport, CompareError> {
    compare_with_reference(
        |b, x| model.build(b, x),
        &model.input_shapes(shape),
        accel,
        &CompareOptions::default(),
    )
}

/// Like `try_compare` but panics with the failure.
#[allow(dead_code)]
pub fn compare(model: Model, shape: &[usize], accel: &str) -> CompareReport {
    try_compare(model, shape, accel).unwrap_or_else(|e| panic!("{model} on {accel}: {e}"))
}

/// Int8 type with per-tensor quantization.
#[allow(dead_code)]
pub fn int8(shape: &[usize], scale: f32, zero_point: i32) -> TensorType {
    TensorType::quantized(DType::Int8, shape, QuantParams::per_tensor(scale, zero_point))
}

/// Seeded int8 tensor conforming to `ty`.
#[allow(dead_code)]
pub fn random_int8(ty: &TensorType, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let values: ArrayD<i8> = ArrayD::from_shape_fn(IxDyn(&ty.shape.dims), |_| rng.r#gen());
    Tensor::from_i8(&ty.shape.dims, values.iter().copied().collect(), ty.quant.clone())
        .expect("tensor shape")
}

/// Partitions `graph`, checks its boundaries and compiles every region.
#[allow(dead_code)]
pub fn compile_graph(
    graph: &Graph,
    config: &HardwareConfig,
    opt_level: OptLevel,
) -> Result<Vec<LoweredProgram>, BackendError> {
    let partitioned = partition(graph, &EthosUSupport).expect("partitioning failed");
    check_boundaries(&partitioned, &EthosUSupport).expect("boundary check failed");
    let backend = EthosUBackend::new(opt_level);
    partitioned
        .regions()
        .into_iter()
        .map(|r| backend.compile(&partitioned.extract_region(r)?, config))
        .collect()
}

/// Default hardware configuration for `variant`.
#[allow(dead_code)]
pub fn config(variant: AcceleratorVariant) -> HardwareConfig {
    HardwareConfig::for_variant(variant)
}
