//! Constant blob construction.
//!
//! Weights, bias/scale records and lookup tables are appended to a single
//! byte blob in lowering order. Every chunk starts on a 16-byte boundary
//! so the command stream can address it directly.

use ethosu_backend_core::numeric::{ScaleRecord, WeightLayout};
use ethosu_ir::{DType, IrError, Tensor, TensorType};
use ethosu_opt::memory::align;

/// Append-only constant storage.
#[derive(Debug, Default)]
pub(crate) struct ConstantBlob {
    bytes: Vec<u8>,
}

impl ConstantBlob {
    /// Appends `data` at the next aligned offset and returns
    /// `(offset, length)`.
    pub(crate) fn push(&mut self, data: &[u8]) -> (u32, u32) {
        let offset = align(self.bytes.len());
        self.bytes.resize(offset, 0);
        self.bytes.extend_from_slice(data);
        (offset as u32, data.len() as u32)
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Reorders int8 weights into the accelerator layout.
///
/// `values` is row-major OHWI for a regular convolution and
/// `[1, KH, KW, C]` for a depthwise one.
pub(crate) fn pack_weights(values: &[i64], layout: &WeightLayout, depthwise: bool) -> Vec<u8> {
    let mut out = vec![0u8; layout.len()];
    let (kh, kw, id) = (layout.kernel_height, layout.kernel_width, layout.ifm_depth);
    for oc in 0..layout.ofm_depth {
        for ky in 0..kh {
            for kx in 0..kw {
                for ic in 0..id {
                    let src = if depthwise {
                        (ky * kw + kx) * layout.ofm_depth + oc
                    } else {
                        ((oc * kh + ky) * kw + kx) * id + ic
                    };
                    let v = values.get(src).copied().unwrap_or(0);
                    out[layout.offset(oc, ky, kx, ic)] = v as i8 as u8;
                }
            }
        }
    }
    out
}

/// Concatenates packed per-channel records.
pub(crate) fn pack_records(records: &[ScaleRecord]) -> Vec<u8> {
    records.iter().flat_map(|r| r.to_bytes()).collect()
}

/// Builds the 256-entry table mapping every int8 input code to the
/// requantized value of `f`.
///
/// Entry `i` holds the output for input code `i - 128`, computed with the
/// same dequantize / evaluate / requantize steps as a float reference.
pub(crate) fn build_lut(
    f: impl Fn(f64) -> f64,
    input: &TensorType,
    output: &TensorType,
) -> Result<Vec<u8>, IrError> {
    let codes: Vec<i64> = (-128..128).collect();
    let in_ty = TensorType {
        dtype: DType::Int8,
        shape: [256].into(),
        quant: input.quant.clone(),
    };
    let out_ty = TensorType {
        dtype: DType::Int8,
        shape: [256].into(),
        quant: output.quant.clone(),
    };
    let real: Vec<f64> = Tensor::from_ints(&in_ty, &codes)?
        .dequantize()
        .into_iter()
        .map(f)
        .collect();
    let table = Tensor::quantize(&real, &out_ty)?;
    Ok(table.int_values().into_iter().map(|v| v as i8 as u8).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosu_ir::QuantParams;

    #[test]
    fn chunks_are_aligned() {
        let mut blob = ConstantBlob::default();
        assert_eq!(blob.push(&[1; 10]), (0, 10));
        assert_eq!(blob.push(&[2; 3]), (16, 3));
        assert_eq!(blob.push(&[3; 1]), (32, 1));
        assert_eq!(blob.len(), 33);
        let bytes = blob.into_bytes();
        assert_eq!(&bytes[10..16], &[0; 6]);
    }

    #[test]
    fn weights_are_block_interleaved() {
        // Three output channels, 1x1 kernel, two input channels.
        let values = vec![1, 2, 3, 4, 5, 6];
        let layout = WeightLayout {
            ofm_depth: 3,
            kernel_height: 1,
            kernel_width: 1,
            ifm_depth: 2,
            block_depth: 2,
        };
        let packed = pack_weights(&values, &layout, false);
        assert_eq!(packed, vec![1, 3, 2, 4, 5, 6]);
    }

    #[test]
    fn depthwise_weights_follow_channel_order() {
        // [1, 1, 2, 2]: two kernel columns, two channels.
        let values = vec![1, 2, -3, -4];
        let layout = WeightLayout {
            ofm_depth: 2,
            kernel_height: 1,
            kernel_width: 2,
            ifm_depth: 1,
            block_depth: 8,
        };
        let packed = pack_weights(&values, &layout, true);
        assert_eq!(packed, vec![1, 2, (-3i8) as u8, (-4i8) as u8]);
    }

    #[test]
    fn sigmoid_lut_endpoints() {
        let input = TensorType::quantized(DType::Int8, [1], QuantParams::per_tensor(0.1, 0));
        let output = TensorType::quantized(DType::Int8, [1], QuantParams::per_tensor(1.0 / 256.0, -128));
        let lut = build_lut(|x| 1.0 / (1.0 + (-x).exp()), &input, &output).unwrap();
        assert_eq!(lut.len(), 256);
        // Code 0 is real 0, sigmoid 0.5, quantized to 0.
        assert_eq!(lut[128] as i8, 0);
        assert_eq!(lut[0] as i8, -128);
        assert_eq!(lut[255] as i8, 127);
    }
}
