//! Every catalog operator compared against the reference on every
//! accelerator variant.

mod common;

use ethosu_compare::Model;

macro_rules! operator_tests {
    ($name:ident, $model:expr, $shape:expr, offloaded = $offloaded:expr) => {
        mod $name {
            use super::*;

            fn check(accel: &str) {
                let report = common::compare($model, &$shape, accel);
                assert_eq!(report.offloaded_nodes, $offloaded, "{report}");
                assert!(report.max_deviation <= 1.0, "{report}");
            }

            #[test]
            fn ethos_u55_256() {
                check("ethos-u55-256");
            }

            #[test]
            fn ethos_u55_128() {
                check("ethos-u55-128");
            }

            #[test]
            fn ethos_u55_64() {
                check("ethos-u55-64");
            }

            #[test]
            fn ethos_u55_32() {
                check("ethos-u55-32");
            }

            #[test]
            fn ethos_u65_256() {
                check("ethos-u65-256");
            }
        }
    };
}

operator_tests!(sigmoid, Model::Sigmoid, [1, 8, 8, 4], offloaded = 1);
operator_tests!(tanh, Model::Tanh, [1, 8, 8, 4], offloaded = 1);
operator_tests!(relu, Model::Relu, [1, 8, 8, 4], offloaded = 1);
operator_tests!(relu6, Model::Relu6, [1, 8, 8, 4], offloaded = 1);
operator_tests!(relu_n1_to_1, Model::ReluN1To1, [1, 8, 8, 4], offloaded = 1);
operator_tests!(add, Model::Add, [1, 8, 8, 4], offloaded = 1);
operator_tests!(sub, Model::Sub, [1, 8, 8, 4], offloaded = 1);
operator_tests!(mul, Model::Mul, [1, 8, 8, 4], offloaded = 1);
operator_tests!(conv2d, Model::Conv2d, [1, 8, 8, 4], offloaded = 1);
operator_tests!(depthwise_conv2d, Model::DepthwiseConv2d, [1, 8, 8, 4], offloaded = 1);
operator_tests!(fully_connected, Model::FullyConnected, [1, 4, 4, 4], offloaded = 2);
operator_tests!(max_pool2d, Model::MaxPool2d, [1, 8, 8, 4], offloaded = 1);
operator_tests!(avg_pool2d, Model::AvgPool2d, [1, 8, 8, 4], offloaded = 1);
operator_tests!(reshape, Model::Reshape, [1, 8, 8, 4], offloaded = 1);
operator_tests!(softmax, Model::Softmax, [1, 8, 8, 4], offloaded = 0);
