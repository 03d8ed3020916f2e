//! Runtime tensor values.
//!
//! A [`Tensor`] owns its data in an `ndarray` array of one element type
//! plus optional quantization parameters. Executors never share tensors;
//! they are compared by value.

use ndarray::{ArrayD, IxDyn};

use crate::error::IrError;
use crate::types::{DType, QuantParams, Shape, TensorType};

/// Typed element storage.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    Int8(ArrayD<i8>),
    UInt8(ArrayD<u8>),
    Int16(ArrayD<i16>),
    Int32(ArrayD<i32>),
    Float32(ArrayD<f32>),
}

/// A concrete tensor value.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: TensorData,
    pub quant: Option<QuantParams>,
}

fn shaped<T>(shape: &[usize], values: Vec<T>) -> Result<ArrayD<T>, IrError> {
    let len = values.len();
    ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| IrError::ShapeMismatch {
        context: "tensor data".into(),
        expected: Shape::new(shape.to_vec()).to_string(),
        found: format!("{len} elements"),
    })
}

/// Round half away from zero and saturate to an integer range.
fn saturate(value: f64, lo: i64, hi: i64) -> i64 {
    if value.is_nan() {
        return 0;
    }
    let r = value.round();
    if r < lo as f64 {
        lo
    } else if r > hi as f64 {
        hi
    } else {
        r as i64
    }
}

impl Tensor {
    pub fn new(data: TensorData, quant: Option<QuantParams>) -> Self {
        Self { data, quant }
    }

    /// Builds a float tensor from row-major values.
    pub fn from_f32(shape: &[usize], values: Vec<f32>) -> Result<Self, IrError> {
        Ok(Self::new(TensorData::Float32(shaped(shape, values)?), None))
    }

    /// Builds an int8 tensor from row-major values.
    pub fn from_i8(
        shape: &[usize],
        values: Vec<i8>,
        quant: Option<QuantParams>,
    ) -> Result<Self, IrError> {
        Ok(Self::new(TensorData::Int8(shaped(shape, values)?), quant))
    }

    /// Builds an int32 tensor from row-major values.
    pub fn from_i32(
        shape: &[usize],
        values: Vec<i32>,
        quant: Option<QuantParams>,
    ) -> Result<Self, IrError> {
        Ok(Self::new(TensorData::Int32(shaped(shape, values)?), quant))
    }

    /// A zero-filled tensor of the given type.
    pub fn zeros(ty: &TensorType) -> Self {
        let dim = IxDyn(&ty.shape.dims);
        let data = match ty.dtype {
            DType::Int8 => TensorData::Int8(ArrayD::zeros(dim)),
            DType::UInt8 => TensorData::UInt8(ArrayD::zeros(dim)),
            DType::Int16 => TensorData::Int16(ArrayD::zeros(dim)),
            DType::Int32 => TensorData::Int32(ArrayD::zeros(dim)),
            DType::Float32 => TensorData::Float32(ArrayD::zeros(dim)),
        };
        Self::new(data, ty.quant.clone())
    }

    pub fn dtype(&self) -> DType {
        match &self.data {
            TensorData::Int8(_) => DType::Int8,
            TensorData::UInt8(_) => DType::UInt8,
            TensorData::Int16(_) => DType::Int16,
            TensorData::Int32(_) => DType::Int32,
            TensorData::Float32(_) => DType::Float32,
        }
    }

    pub fn shape(&self) -> Shape {
        let dims = match &self.data {
            TensorData::Int8(a) => a.shape(),
            TensorData::UInt8(a) => a.shape(),
            TensorData::Int16(a) => a.shape(),
            TensorData::Int32(a) => a.shape(),
            TensorData::Float32(a) => a.shape(),
        };
        Shape::new(dims.to_vec())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape().num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The static type this value carries.
    pub fn tensor_type(&self) -> TensorType {
        TensorType {
            dtype: self.dtype(),
            shape: self.shape(),
            quant: self.quant.clone(),
        }
    }

    /// Returns `true` when dtype and shape match `ty`.
    pub fn conforms_to(&self, ty: &TensorType) -> bool {
        self.dtype() == ty.dtype && self.shape() == ty.shape
    }

    /// Stored values (quantized units for integer tensors) in row-major order.
    pub fn raw_values(&self) -> Vec<f64> {
        match &self.data {
            TensorData::Int8(a) => a.iter().map(|&v| v as f64).collect(),
            TensorData::UInt8(a) => a.iter().map(|&v| v as f64).collect(),
            TensorData::Int16(a) => a.iter().map(|&v| v as f64).collect(),
            TensorData::Int32(a) => a.iter().map(|&v| v as f64).collect(),
            TensorData::Float32(a) => a.iter().map(|&v| v as f64).collect(),
        }
    }

    /// Stored integer values in row-major order. Floats are truncated.
    pub fn int_values(&self) -> Vec<i64> {
        match &self.data {
            TensorData::Int8(a) => a.iter().map(|&v| v as i64).collect(),
            TensorData::UInt8(a) => a.iter().map(|&v| v as i64).collect(),
            TensorData::Int16(a) => a.iter().map(|&v| v as i64).collect(),
            TensorData::Int32(a) => a.iter().map(|&v| v as i64).collect(),
            TensorData::Float32(a) => a.iter().map(|&v| v as i64).collect(),
        }
    }

    /// Real values: `(q - zp) * scale` for quantized tensors, the raw
    /// values otherwise.
    pub fn dequantize(&self) -> Vec<f64> {
        let raw = self.raw_values();
        let Some(q) = &self.quant else {
            return raw;
        };
        if !q.is_per_channel() {
            let (scale, zp) = (q.scale() as f64, q.zero_point() as f64);
            return raw.into_iter().map(|v| (v - zp) * scale).collect();
        }
        let shape = self.shape();
        let strides = shape.strides();
        let (stride, extent) = match (strides.get(q.axis), shape.dims.get(q.axis)) {
            (Some(&s), Some(&d)) => (s, d.max(1)),
            _ => (1, 1),
        };
        raw.into_iter()
            .enumerate()
            .map(|(i, v)| {
                let c = (i / stride) % extent;
                (v - q.zero_point_for(c) as f64) * q.scale_for(c) as f64
            })
            .collect()
    }

    /// Builds a tensor of type `ty` from real values, quantizing when the
    /// type carries quantization parameters.
    pub fn quantize(values: &[f64], ty: &TensorType) -> Result<Self, IrError> {
        let expected = ty.shape.num_elements();
        if values.len() != expected {
            return Err(IrError::ShapeMismatch {
                context: "quantize".into(),
                expected: ty.shape.to_string(),
                found: format!("{} elements", values.len()),
            });
        }
        let dims = &ty.shape.dims;
        let Some((lo, hi)) = ty.dtype.int_range() else {
            let data = values.iter().map(|&v| v as f32).collect();
            return Ok(Self::new(TensorData::Float32(shaped(dims, data)?), None));
        };

        let strides = ty.shape.strides();
        let ints: Vec<i64> = match &ty.quant {
            None => values.iter().map(|&v| saturate(v, lo, hi)).collect(),
            Some(q) => {
                let stride = strides.get(q.axis).copied().unwrap_or(1);
                let extent = dims.get(q.axis).copied().unwrap_or(1).max(1);
                values
                    .iter()
                    .enumerate()
                    .map(|(i, &v)| {
                        let c = if q.is_per_channel() {
                            (i / stride) % extent
                        } else {
                            0
                        };
                        let scaled = v / q.scale_for(c) as f64;
                        saturate(scaled + q.zero_point_for(c) as f64, lo, hi)
                    })
                    .collect()
            }
        };
        Self::from_ints(ty, &ints)
    }

    /// Builds an integer tensor of type `ty` from already-quantized values.
    /// Values are saturated to the dtype range.
    pub fn from_ints(ty: &TensorType, ints: &[i64]) -> Result<Self, IrError> {
        let dims = &ty.shape.dims;
        let (lo, hi) = ty.dtype.int_range().unwrap_or((i64::MIN, i64::MAX));
        let clamp = |v: i64| v.clamp(lo, hi);
        let data = match ty.dtype {
            DType::Int8 => TensorData::Int8(shaped(
                dims,
                ints.iter().map(|&v| clamp(v) as i8).collect(),
            )?),
            DType::UInt8 => TensorData::UInt8(shaped(
                dims,
                ints.iter().map(|&v| clamp(v) as u8).collect(),
            )?),
            DType::Int16 => TensorData::Int16(shaped(
                dims,
                ints.iter().map(|&v| clamp(v) as i16).collect(),
            )?),
            DType::Int32 => TensorData::Int32(shaped(
                dims,
                ints.iter().map(|&v| clamp(v) as i32).collect(),
            )?),
            DType::Float32 => TensorData::Float32(shaped(
                dims,
                ints.iter().map(|&v| v as f32).collect(),
            )?),
        };
        Ok(Self::new(data, ty.quant.clone()))
    }

    /// Little-endian byte image in row-major order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::Int8(a) => a.iter().map(|&v| v as u8).collect(),
            TensorData::UInt8(a) => a.iter().copied().collect(),
            TensorData::Int16(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Int32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Float32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Reads a tensor of type `ty` from its little-endian byte image.
    pub fn from_le_bytes(ty: &TensorType, bytes: &[u8]) -> Result<Self, IrError> {
        if bytes.len() != ty.size_bytes() {
            return Err(IrError::ShapeMismatch {
                context: "tensor bytes".into(),
                expected: format!("{} bytes", ty.size_bytes()),
                found: format!("{} bytes", bytes.len()),
            });
        }
        let dims = &ty.shape.dims;
        let data = match ty.dtype {
            DType::Int8 => TensorData::Int8(shaped(dims, bytes.iter().map(|&b| b as i8).collect())?),
            DType::UInt8 => TensorData::UInt8(shaped(dims, bytes.to_vec())?),
            DType::Int16 => TensorData::Int16(shaped(
                dims,
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            )?),
            DType::Int32 => TensorData::Int32(shaped(
                dims,
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )?),
            DType::Float32 => TensorData::Float32(shaped(
                dims,
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )?),
        };
        Ok(Self::new(data, ty.quant.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequantize_per_tensor() {
        let q = QuantParams::per_tensor(0.5, 2);
        let t = Tensor::from_i8(&[3], vec![2, 4, -2], Some(q)).unwrap();
        assert_eq!(t.dequantize(), vec![0.0, 1.0, -2.0]);
    }

    #[test]
    fn dequantize_per_channel_last_axis() {
        let q = QuantParams::per_channel(vec![1.0, 0.5], vec![0, 0], 1);
        let t = Tensor::from_i8(&[2, 2], vec![2, 2, 4, 4], Some(q)).unwrap();
        assert_eq!(t.dequantize(), vec![2.0, 1.0, 4.0, 2.0]);
    }

    #[test]
    fn quantize_rounds_and_saturates() {
        let ty = TensorType::quantized(DType::Int8, [4], QuantParams::per_tensor(0.1, -1));
        let t = Tensor::quantize(&[0.0, 0.3, -100.0, 100.0], &ty).unwrap();
        assert_eq!(t.int_values(), vec![-1, 2, -128, 127]);

        // Halves are exact at scale 0.5 and round away from zero.
        let ty = TensorType::quantized(DType::Int8, [4], QuantParams::per_tensor(0.5, 0));
        let t = Tensor::quantize(&[0.25, -0.25, 0.75, -0.75], &ty).unwrap();
        assert_eq!(t.int_values(), vec![1, -1, 2, -2]);
    }

    #[test]
    fn quantize_rejects_wrong_length() {
        let ty = TensorType::new(DType::Int8, [4]);
        assert!(Tensor::quantize(&[1.0], &ty).is_err());
    }

    #[test]
    fn bytes_roundtrip_int32() {
        let t = Tensor::from_i32(&[2], vec![-5, 70000], None).unwrap();
        let bytes = t.to_le_bytes();
        assert_eq!(bytes.len(), 8);
        let back = Tensor::from_le_bytes(&t.tensor_type(), &bytes).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn zeros_matches_type() {
        let ty = TensorType::new(DType::UInt8, [2, 3]);
        let t = Tensor::zeros(&ty);
        assert!(t.conforms_to(&ty));
        assert_eq!(t.len(), 6);
    }
}
