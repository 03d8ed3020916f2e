//! Quantization parameter arithmetic.
//!
//! Real-valued scales are carried to the accelerator as fixed-point
//! `multiplier / 2^shift` pairs with the multiplier normalized to
//! `[2^30, 2^31)`. Activations use asymmetric int8, weights symmetric
//! per-channel int8 and biases int32 at the accumulator scale.

use ethosu_backend_core::command::Scale;
use ethosu_ir::{DType, IrError, QuantParams, Shape, Tensor, TensorType};

/// Errors raised while deriving quantization parameters.
#[derive(Debug, thiserror::Error)]
pub enum QuantizeError {
    /// The real scale cannot be represented as `multiplier / 2^shift`.
    #[error("scale {0} cannot be represented as a fixed-point multiplier")]
    Unrepresentable(f64),

    /// A float activation was never observed during calibration.
    #[error("no calibration range recorded for tensor '{0}'")]
    MissingRange(String),

    #[error("tensor '{tensor}': {reason}")]
    Unsupported { tensor: String, reason: String },

    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Largest shift the output stage accepts.
pub const MAX_SHIFT: i32 = 63;

/// Converts a non-negative real scale into `multiplier / 2^shift` with
/// `multiplier` in `[2^30, 2^31)`.
///
/// Scales too small for a 63-bit shift collapse to zero.
pub fn quantize_multiplier(real: f64) -> Result<Scale, QuantizeError> {
    if !real.is_finite() || real < 0.0 {
        return Err(QuantizeError::Unrepresentable(real));
    }
    if real == 0.0 {
        return Ok(Scale {
            multiplier: 0,
            shift: 0,
        });
    }

    // real = m * 2^exp with m in [0.5, 1).
    let mut exp = real.log2().floor() as i32 + 1;
    let mut m = real / 2f64.powi(exp);
    if m >= 1.0 {
        m /= 2.0;
        exp += 1;
    } else if m < 0.5 {
        m *= 2.0;
        exp -= 1;
    }

    let mut multiplier = (m * (1u64 << 31) as f64).round() as i64;
    if multiplier == 1i64 << 31 {
        multiplier /= 2;
        exp += 1;
    }
    let shift = 31 - exp;
    if shift < 0 {
        return Err(QuantizeError::Unrepresentable(real));
    }
    if shift > MAX_SHIFT {
        return Ok(Scale {
            multiplier: 0,
            shift: 0,
        });
    }
    Ok(Scale {
        multiplier: multiplier as i32,
        shift: shift as u8,
    })
}

/// Asymmetric int8 parameters covering `[min, max]`.
///
/// The range is widened to include zero so that zero is exactly
/// representable. A degenerate range maps to scale 1.
pub fn asymmetric_int8(min: f64, max: f64) -> QuantParams {
    let min = min.min(0.0);
    let max = max.max(0.0);
    let range = max - min;
    let scale = if range < f32::EPSILON as f64 {
        1.0
    } else {
        range / 255.0
    };
    let zero_point = (-128.0 - min / scale).round().clamp(-128.0, 127.0) as i32;
    QuantParams::per_tensor(scale as f32, zero_point)
}

/// Index of the channel holding flat element `i` along `axis`.
fn channel_of(shape: &Shape, axis: usize, i: usize) -> usize {
    let stride = shape.strides().get(axis).copied().unwrap_or(1);
    let extent = shape.dims.get(axis).copied().unwrap_or(1).max(1);
    (i / stride) % extent
}

/// Quantizes float weights to symmetric int8 with one scale per slice
/// along `axis` (zero points are all zero, values in `[-127, 127]`).
pub fn symmetric_weights(weights: &Tensor, axis: usize) -> Result<Tensor, QuantizeError> {
    let shape = weights.shape();
    let channels = shape.dims.get(axis).copied().ok_or_else(|| QuantizeError::Unsupported {
        tensor: "weights".into(),
        reason: format!("channel axis {axis} out of range for {shape}"),
    })?;
    let values = weights.dequantize();

    let mut max_abs = vec![0f64; channels];
    for (i, v) in values.iter().enumerate() {
        let c = channel_of(&shape, axis, i);
        max_abs[c] = max_abs[c].max(v.abs());
    }
    let scales: Vec<f32> = max_abs
        .iter()
        .map(|&m| if m > 0.0 { (m / 127.0) as f32 } else { 1.0 })
        .collect();

    let ints: Vec<i64> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let s = scales[channel_of(&shape, axis, i)] as f64;
            ((v / s).round() as i64).clamp(-127, 127)
        })
        .collect();
    let quant = QuantParams::per_channel(scales, vec![0; channels], axis);
    let ty = TensorType::quantized(DType::Int8, shape, quant);
    Ok(Tensor::from_ints(&ty, &ints)?)
}

/// Quantizes a float bias to int32 at scale `input_scale * weight_scale[c]`.
pub fn bias_int32(
    bias: &Tensor,
    input_scale: f32,
    weights: &QuantParams,
) -> Result<Tensor, QuantizeError> {
    let shape = bias.shape();
    let channels = shape.num_elements();
    let scales: Vec<f32> = (0..channels)
        .map(|c| input_scale * weights.scale_for(c))
        .collect();
    let quant = QuantParams::per_channel(scales, vec![0; channels], 0);
    let ty = TensorType::quantized(DType::Int32, shape, quant);
    Ok(Tensor::quantize(&bias.dequantize(), &ty)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(s: Scale) -> f64 {
        s.multiplier as f64 / 2f64.powi(s.shift as i32)
    }

    #[test]
    fn multiplier_is_normalized_and_accurate() {
        for real in [1.0, 0.5, 0.75, 0.003_921_568_6, 1.0 / 3.0, 123.456, 1e-9] {
            let s = quantize_multiplier(real).unwrap();
            assert!(s.multiplier >= 1 << 30, "{real}: {s:?}");
            assert!((s.multiplier as i64) < 1i64 << 31, "{real}: {s:?}");
            assert!(s.shift as i32 <= MAX_SHIFT);
            let rel = (approx(s) - real).abs() / real;
            assert!(rel < 1e-9, "{real}: relative error {rel}");
        }
    }

    #[test]
    fn multiplier_exact_powers_of_two() {
        assert_eq!(
            quantize_multiplier(1.0).unwrap(),
            Scale {
                multiplier: 1 << 30,
                shift: 30
            }
        );
        assert_eq!(
            quantize_multiplier(0.25).unwrap(),
            Scale {
                multiplier: 1 << 30,
                shift: 32
            }
        );
    }

    #[test]
    fn multiplier_edge_cases() {
        assert_eq!(quantize_multiplier(0.0).unwrap().multiplier, 0);
        assert_eq!(quantize_multiplier(1e-30).unwrap().multiplier, 0);
        assert!(quantize_multiplier(-1.0).is_err());
        assert!(quantize_multiplier(f64::NAN).is_err());
        assert!(quantize_multiplier(1e12).is_err());
    }

    #[test]
    fn asymmetric_covers_zero() {
        let q = asymmetric_int8(-1.0, 1.55);
        assert!((q.scale() - 0.01).abs() < 1e-7);
        assert_eq!(q.zero_point(), -28);

        let q = asymmetric_int8(0.2, 0.9);
        assert_eq!(q.zero_point(), -128);
        assert!((q.scale() - 0.9 / 255.0).abs() < 1e-7);

        let q = asymmetric_int8(0.0, 0.0);
        assert_eq!(q.scale(), 1.0);
    }

    #[test]
    fn weights_are_symmetric_per_channel() {
        let w = Tensor::from_f32(&[2, 1, 1, 2], vec![0.25, -1.0, 0.25, 0.1]).unwrap();
        let q = symmetric_weights(&w, 0).unwrap();
        assert_eq!(q.dtype(), DType::Int8);
        assert_eq!(q.int_values(), vec![32, -127, 127, 51]);
        let quant = q.quant.unwrap();
        assert_eq!(quant.zero_points, vec![0, 0]);
        assert!((quant.scales[1] - 0.25 / 127.0).abs() < 1e-9);
    }

    #[test]
    fn bias_uses_accumulator_scale() {
        let w = QuantParams::per_channel(vec![0.5, 0.25], vec![0, 0], 0);
        let b = Tensor::from_f32(&[2], vec![1.0, 1.0]).unwrap();
        let q = bias_int32(&b, 0.1, &w).unwrap();
        assert_eq!(q.dtype(), DType::Int32);
        assert_eq!(q.int_values(), vec![20, 40]);
    }
}
