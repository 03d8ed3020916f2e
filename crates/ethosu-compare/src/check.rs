//! Element-wise tolerance checks.

use std::fmt;

use ethosu_ir::{Shape, Tensor};

/// Absolute and relative tolerance for float outputs.
pub const FLOAT_TOLERANCE: f64 = 1e-5;

/// The first element that differs beyond tolerance.
#[derive(Clone, Debug, PartialEq)]
pub struct Mismatch {
    /// Index of the graph output.
    pub output: usize,
    pub tensor: String,
    /// Element coordinate.
    pub index: Vec<usize>,
    pub expected: f64,
    pub actual: f64,
    pub deviation: f64,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "output {} ('{}') at {:?}: expected {}, got {} (deviation {})",
            self.output, self.tensor, self.index, self.expected, self.actual, self.deviation
        )
    }
}

/// Outcome of comparing one output pair.
#[derive(Debug)]
pub(crate) enum Verdict {
    /// Largest deviation seen, within tolerance.
    Pass(f64),
    Fail(Mismatch),
    /// Type or shape disagree, so values are not comparable.
    Incomparable(String),
}

/// Compares `actual` against `expected`.
///
/// Integer tensors compare stored values with an absolute tolerance of
/// `int_tolerance` quantized steps. Float tensors use
/// `|a - e| <= atol + rtol * |e|` with [`FLOAT_TOLERANCE`] for both.
pub(crate) fn compare_tensors(
    output: usize,
    tensor: &str,
    expected: &Tensor,
    actual: &Tensor,
    int_tolerance: i64,
) -> Verdict {
    if expected.dtype() != actual.dtype() || expected.shape() != actual.shape() {
        return Verdict::Incomparable(format!(
            "output {output} ('{tensor}'): expected {}, got {}",
            expected.tensor_type(),
            actual.tensor_type()
        ));
    }
    let shape: Shape = expected.shape();
    let integer = expected.dtype().is_integer();
    let (want, got) = (expected.raw_values(), actual.raw_values());

    let mut worst = 0f64;
    for (i, (&e, &a)) in want.iter().zip(&got).enumerate() {
        let deviation = (a - e).abs();
        let limit = if integer {
            int_tolerance as f64
        } else {
            FLOAT_TOLERANCE + FLOAT_TOLERANCE * e.abs()
        };
        if deviation.is_nan() || deviation > limit {
            return Verdict::Fail(Mismatch {
                output,
                tensor: tensor.to_string(),
                index: shape.unravel(i),
                expected: e,
                actual: a,
                deviation,
            });
        }
        worst = worst.max(deviation);
    }
    Verdict::Pass(worst)
}
