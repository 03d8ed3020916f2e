//! Fixed-point arithmetic shared by the compiler and the device.
//!
//! The output stage of every operation computes
//! `y = rescale(acc, multiplier, shift) + ofm_zero_point`, where
//! `rescale(v) = (v * multiplier + 2^(shift - 1)) >> shift` with an
//! arithmetic shift (round half towards positive infinity).

use ethosu_ir::DType;

/// Bytes per packed bias/scale record.
pub const SCALE_RECORD_BYTES: usize = 10;

/// Largest magnitude representable by the 40-bit bias field.
pub const BIAS_LIMIT: i64 = 1 << 39;

/// Applies `multiplier / 2^shift` to `value` with round-half-up.
pub fn rescale(value: i64, multiplier: i32, shift: u8) -> i64 {
    let product = value as i128 * multiplier as i128;
    let round = if shift > 0 { 1i128 << (shift - 1) } else { 0 };
    ((product + round) >> shift).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Clamps `value` to the range of an integer dtype.
pub fn saturate(value: i64, dtype: DType) -> i64 {
    match dtype.int_range() {
        Some((lo, hi)) => value.clamp(lo, hi),
        None => value,
    }
}

/// Per-output-channel bias and requantization scale.
///
/// Packed as 10 little-endian bytes: a 40-bit two's-complement bias, a
/// 32-bit multiplier and a 6-bit shift.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScaleRecord {
    pub bias: i64,
    pub multiplier: i32,
    pub shift: u8,
}

impl ScaleRecord {
    pub fn to_bytes(&self) -> [u8; SCALE_RECORD_BYTES] {
        let bias = self.bias.clamp(-BIAS_LIMIT, BIAS_LIMIT - 1).to_le_bytes();
        let mult = self.multiplier.to_le_bytes();
        [
            bias[0],
            bias[1],
            bias[2],
            bias[3],
            bias[4],
            mult[0],
            mult[1],
            mult[2],
            mult[3],
            self.shift & 0x3F,
        ]
    }

    /// Reads a record from the first 10 bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let b = bytes.get(..SCALE_RECORD_BYTES)?;
        // Sign-extend the 40-bit bias.
        let fill = if b[4] & 0x80 != 0 { 0xFF } else { 0x00 };
        let bias = i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], fill, fill, fill]);
        Some(Self {
            bias,
            multiplier: i32::from_le_bytes([b[5], b[6], b[7], b[8]]),
            shift: b[9] & 0x3F,
        })
    }
}

/// Layout of a packed weight stream.
///
/// Output channels are grouped into blocks of `block_depth`; blocks are
/// stored one after another. Inside a block the order is kernel row,
/// kernel column, input channel, then output channel, so one fetch
/// serves a whole block of accumulators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeightLayout {
    pub ofm_depth: usize,
    pub kernel_height: usize,
    pub kernel_width: usize,
    /// Input channels per output channel (1 for depthwise).
    pub ifm_depth: usize,
    pub block_depth: usize,
}

impl WeightLayout {
    /// Total number of weight bytes.
    pub fn len(&self) -> usize {
        self.ofm_depth * self.kernel_height * self.kernel_width * self.ifm_depth
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte offset of weight `(oc, ky, kx, ic)`.
    pub fn offset(&self, oc: usize, ky: usize, kx: usize, ic: usize) -> usize {
        let block_depth = self.block_depth.max(1);
        let first = oc / block_depth * block_depth;
        let width = block_depth.min(self.ofm_depth - first);
        let per_channel = self.kernel_height * self.kernel_width * self.ifm_depth;
        first * per_channel + ((ky * self.kernel_width + kx) * self.ifm_depth + ic) * width + (oc - first)
    }
}
