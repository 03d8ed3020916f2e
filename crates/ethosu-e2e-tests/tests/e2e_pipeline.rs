mod common;

use ethosu_backend::EthosUBackend;
use ethosu_backend_core::{AcceleratorVariant, Backend, BackendError, Device, MemoryArea};
use ethosu_compare::{CompareError, CompareOptions, Model, compare_graph};
use ethosu_ir::{FusedActivation, GraphBuilder, Op};
use ethosu_opt::OptLevel;
use ethosu_partition::{EthosUSupport, check_boundaries, partition};
use ethosu_reference::ReferenceExecutor;
use ethosu_sim::Simulator;

#[test]
fn sigmoid_large_feature_map_on_every_variant() {
    for v in AcceleratorVariant::ALL {
        let report = common::compare(Model::Sigmoid, &[1, 135, 41, 6], v.name());
        assert_eq!(report.variant, v);
        assert_eq!(report.regions, 1);
        assert_eq!(report.offloaded_nodes, 1);
        assert_eq!(report.host_nodes, 0);
    }
}

#[test]
fn softmax_stays_on_host() {
    let report = common::compare(Model::Softmax, &[1, 10], "ethos-u55-128");
    assert_eq!(report.regions, 0);
    assert_eq!(report.offloaded_nodes, 0);
    assert_eq!(report.host_nodes, 1);
    assert_eq!(report.max_deviation, 0.0);
}

#[test]
fn host_operator_splits_regions() {
    let ty = common::int8(&[1, 16], 0.05, 0);
    let prob = common::int8(&[1, 16], 1.0 / 256.0, -128);
    let mut b = GraphBuilder::new();
    let x = b.input_typed("x", ty.clone());
    let s = b.push(Op::Sigmoid, &[x], prob.clone()).unwrap();
    let m = b.push(Op::Softmax { beta: 1.0 }, &[s], prob.clone()).unwrap();
    let y = b.push(Op::Relu, &[m], prob.clone()).unwrap();
    b.output(y);
    let graph = b.finish().unwrap();

    let partitioned = partition(&graph, &EthosUSupport).unwrap();
    check_boundaries(&partitioned, &EthosUSupport).unwrap();
    assert_eq!(partitioned.regions().len(), 2);
    let again = partition(&partitioned, &EthosUSupport).unwrap();
    assert_eq!(again.node_count(), partitioned.node_count());

    let input = common::random_int8(&ty, 3);
    let config = common::config(AcceleratorVariant::EthosU55_256);
    let report = compare_graph(&graph, &[input], &config, &CompareOptions::default()).unwrap();
    assert_eq!(report.regions, 2);
    assert_eq!(report.offloaded_nodes, 2);
    assert_eq!(report.host_nodes, 1);
}

#[test]
fn oversized_feature_map_exhausts_sram() {
    let err = common::try_compare(Model::Sigmoid, &[1, 512, 512, 3], "ethos-u55-256").unwrap_err();
    match err {
        CompareError::Compile {
            source: BackendError::ResourceExhausted { tensor, required, .. },
            ..
        } => {
            assert_eq!(tensor, "input_0");
            assert_eq!(required, 512 * 512 * 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn larger_sram_accepts_oversized_feature_map() {
    let ty = common::int8(&[1, 512, 512, 3], 0.05, 0);
    let mut b = GraphBuilder::new();
    let x = b.input_typed("x", ty.clone());
    let y = b.push(Op::Sigmoid, &[x], common::int8(&[1, 512, 512, 3], 1.0 / 256.0, -128)).unwrap();
    b.output(y);
    let graph = b.finish().unwrap();

    let small = common::config(AcceleratorVariant::EthosU55_256);
    assert!(common::compile_graph(&graph, &small, OptLevel::O1).is_err());
    let large = small.with_pool_capacity(MemoryArea::Sram, 4 << 20);
    let programs = common::compile_graph(&graph, &large, OptLevel::O1).unwrap();
    assert_eq!(programs.len(), 1);
}

#[test]
fn compilation_is_deterministic() {
    let ty = common::int8(&[1, 6, 6, 3], 0.1, 2);
    let mut b = GraphBuilder::new();
    let x = b.input_typed("x", ty.clone());
    let y = b.push(Op::Tanh, &[x], common::int8(&[1, 6, 6, 3], 1.0 / 128.0, 0)).unwrap();
    b.output(y);
    let graph = b.finish().unwrap();

    for v in AcceleratorVariant::ALL {
        let config = common::config(v);
        let a = common::compile_graph(&graph, &config, OptLevel::O1).unwrap();
        let b = common::compile_graph(&graph, &config, OptLevel::O1).unwrap();
        assert_eq!(a[0].to_bytes(), b[0].to_bytes(), "{v}");
    }
}

#[test]
fn simulator_matches_reference_on_handmade_program() {
    let ty = common::int8(&[1, 5, 5, 2], 0.1, -3);
    let mut b = GraphBuilder::new();
    let x = b.input_typed("x", ty.clone());
    let y = b.push(Op::Relu6, &[x], ty.clone()).unwrap();
    b.output(y);
    let graph = b.finish().unwrap();

    let program = EthosUBackend::default()
        .compile(&graph, &common::config(AcceleratorVariant::EthosU55_64))
        .unwrap();
    let input = common::random_int8(&ty, 11);
    let actual = Simulator.execute(&program, std::slice::from_ref(&input)).unwrap();
    let expected = ReferenceExecutor.execute(&graph, &[input]).unwrap();
    let diff = actual[0]
        .int_values()
        .iter()
        .zip(expected[0].int_values())
        .map(|(a, e)| (a - e).abs())
        .max()
        .unwrap();
    assert!(diff <= 1, "max deviation {diff}");
}

#[test]
fn fusion_preserves_results() {
    let ty = common::int8(&[1, 4, 4, 8], 0.08, 1);
    let mut b = GraphBuilder::new();
    let x = b.input_typed("x", ty.clone());
    let y = b.input_typed("y", ty.clone());
    let s = b
        .push(Op::Add { activation: FusedActivation::None }, &[x, y], ty.clone())
        .unwrap();
    let r = b.push(Op::Relu, &[s], ty.clone()).unwrap();
    b.output(r);
    let graph = b.finish().unwrap();

    let inputs = [common::random_int8(&ty, 5), common::random_int8(&ty, 6)];
    let config = common::config(AcceleratorVariant::EthosU55_32);
    for opt_level in [OptLevel::O0, OptLevel::O1] {
        let options = CompareOptions {
            opt_level,
            ..Default::default()
        };
        let report = compare_graph(&graph, &inputs, &config, &options).unwrap();
        assert_eq!(report.offloaded_nodes, 2);
    }

    let programs = common::compile_graph(&graph, &config, OptLevel::O1).unwrap();
    assert_eq!(programs[0].operation_count(), 1);
}
