//! Tensor type system: element types, shapes and quantization.

use std::fmt;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum DType {
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// 32-bit IEEE float.
    Float32,
}

impl DType {
    /// Width of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 => 2,
            Self::Int32 | Self::Float32 => 4,
        }
    }

    /// Returns `true` for the integer types.
    pub fn is_integer(self) -> bool {
        !matches!(self, Self::Float32)
    }

    /// Inclusive value range of an integer type, `None` for floats.
    pub fn int_range(self) -> Option<(i64, i64)> {
        match self {
            Self::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::UInt8 => Some((0, u8::MAX as i64)),
            Self::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            Self::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            Self::Float32 => None,
        }
    }

    /// Stable numeric code used by binary encodings.
    pub fn code(self) -> u8 {
        match self {
            Self::Int8 => 0,
            Self::UInt8 => 1,
            Self::Int16 => 2,
            Self::Int32 => 3,
            Self::Float32 => 4,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Int8),
            1 => Some(Self::UInt8),
            2 => Some(Self::Int16),
            3 => Some(Self::Int32),
            4 => Some(Self::Float32),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
        })
    }
}

/// A static tensor shape.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (1 for a scalar).
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Views the shape as NHWC by left-padding with ones.
    ///
    /// Returns `None` for shapes of rank greater than 4.
    pub fn to_nhwc(&self) -> Option<[usize; 4]> {
        if self.dims.len() > 4 {
            return None;
        }
        let mut out = [1usize; 4];
        let pad = 4 - self.dims.len();
        for (i, &d) in self.dims.iter().enumerate() {
            out[pad + i] = d;
        }
        Some(out)
    }

    /// Row-major strides in elements.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Converts a flat row-major index into a coordinate.
    pub fn unravel(&self, mut index: usize) -> Vec<usize> {
        let mut coord = vec![0usize; self.dims.len()];
        for (i, &d) in self.dims.iter().enumerate().rev() {
            if d == 0 {
                break;
            }
            coord[i] = index % d;
            index /= d;
        }
        coord
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

/// Affine quantization: `real = (q - zero_point) * scale`.
///
/// Per-tensor parameters hold a single scale and zero point. Per-channel
/// parameters hold one entry per slice along `axis`.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantParams {
    pub scales: Vec<f32>,
    pub zero_points: Vec<i32>,
    pub axis: usize,
}

impl QuantParams {
    /// Per-tensor parameters.
    pub fn per_tensor(scale: f32, zero_point: i32) -> Self {
        Self {
            scales: vec![scale],
            zero_points: vec![zero_point],
            axis: 0,
        }
    }

    /// Per-channel parameters along `axis`.
    pub fn per_channel(scales: Vec<f32>, zero_points: Vec<i32>, axis: usize) -> Self {
        Self {
            scales,
            zero_points,
            axis,
        }
    }

    pub fn is_per_channel(&self) -> bool {
        self.scales.len() > 1
    }

    /// The first (or only) scale.
    pub fn scale(&self) -> f32 {
        self.scales.first().copied().unwrap_or(1.0)
    }

    /// The first (or only) zero point.
    pub fn zero_point(&self) -> i32 {
        self.zero_points.first().copied().unwrap_or(0)
    }

    /// Scale for channel `c`, falling back to the per-tensor scale.
    pub fn scale_for(&self, c: usize) -> f32 {
        self.scales.get(c).copied().unwrap_or_else(|| self.scale())
    }

    /// Zero point for channel `c`, falling back to the per-tensor value.
    pub fn zero_point_for(&self, c: usize) -> i32 {
        self.zero_points
            .get(c)
            .copied()
            .unwrap_or_else(|| self.zero_point())
    }
}

impl fmt::Display for QuantParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_per_channel() {
            write!(
                f,
                "q(per-channel axis={}, {} scales)",
                self.axis,
                self.scales.len()
            )
        } else {
            write!(f, "q(scale={:.6}, zp={})", self.scale(), self.zero_point())
        }
    }
}

/// Full static type of a tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorType {
    pub dtype: DType,
    pub shape: Shape,
    pub quant: Option<QuantParams>,
}

impl TensorType {
    pub fn new(dtype: DType, shape: impl Into<Shape>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
            quant: None,
        }
    }

    pub fn quantized(dtype: DType, shape: impl Into<Shape>, quant: QuantParams) -> Self {
        Self {
            dtype,
            shape: shape.into(),
            quant: Some(quant),
        }
    }

    /// Storage size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.shape.num_elements() * self.dtype.size_bytes()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)?;
        if let Some(q) = &self.quant {
            write!(f, " {q}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nhwc_padding() {
        assert_eq!(Shape::new([135, 41, 6]).to_nhwc(), Some([1, 135, 41, 6]));
        assert_eq!(Shape::new([10]).to_nhwc(), Some([1, 1, 1, 10]));
        assert_eq!(Shape::new([1, 2, 3, 4, 5]).to_nhwc(), None);
    }

    #[test]
    fn strides_and_unravel() {
        let s = Shape::new([2, 3, 4]);
        assert_eq!(s.strides(), vec![12, 4, 1]);
        assert_eq!(s.unravel(17), vec![1, 1, 1]);
        assert_eq!(s.num_elements(), 24);
    }

    #[test]
    fn type_size() {
        let t = TensorType::new(DType::Int8, [1, 135, 41, 6]);
        assert_eq!(t.size_bytes(), 33210);
        let t = TensorType::new(DType::Int32, [16]);
        assert_eq!(t.size_bytes(), 64);
    }

    #[test]
    fn dtype_codes_roundtrip_and_ranges() {
        for d in [
            DType::Int8,
            DType::UInt8,
            DType::Int16,
            DType::Int32,
            DType::Float32,
        ] {
            assert_eq!(DType::from_code(d.code()), Some(d));
        }
        assert_eq!(DType::Int8.int_range(), Some((-128, 127)));
        assert_eq!(DType::Float32.int_range(), None);
    }

    #[test]
    fn display_type() {
        let t = TensorType::quantized(DType::Int8, [1, 4], QuantParams::per_tensor(0.5, -3));
        assert_eq!(format!("{t}"), "int8[1, 4] q(scale=0.500000, zp=-3)");
    }
}
