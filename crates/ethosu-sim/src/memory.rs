//! Simulated memory pools.

use ethosu_backend_core::DeviceError;
use ethosu_backend_core::command::FeatureMap;
use ethosu_backend_core::numeric::saturate;
use ethosu_ir::DType;

use crate::malformed;

/// Byte-addressable pools, sized to the program's high-water marks.
#[derive(Debug)]
pub(crate) struct Memory {
    pools: Vec<Vec<u8>>,
}

impl Memory {
    pub(crate) fn new(sizes: impl IntoIterator<Item = usize>) -> Self {
        Self {
            pools: sizes.into_iter().map(|n| vec![0u8; n]).collect(),
        }
    }

    pub(crate) fn read(&self, pool: usize, offset: usize, len: usize) -> Result<&[u8], DeviceError> {
        self.pools
            .get(pool)
            .and_then(|p| p.get(offset..offset.checked_add(len)?))
            .ok_or_else(|| malformed(format!("read of {len} byte(s) at {pool}:0x{offset:x} is out of bounds")))
    }

    pub(crate) fn write(&mut self, pool: usize, offset: usize, data: &[u8]) -> Result<(), DeviceError> {
        let len = data.len();
        let slot = self
            .pools
            .get_mut(pool)
            .and_then(|p| p.get_mut(offset..offset.checked_add(len)?))
            .ok_or_else(|| malformed(format!("write of {len} byte(s) at {pool}:0x{offset:x} is out of bounds")))?;
        slot.copy_from_slice(data);
        Ok(())
    }

    /// Loads a whole feature map as integers, in HWC order.
    pub(crate) fn load(&self, fm: &FeatureMap) -> Result<Vec<i64>, DeviceError> {
        let bytes = self.read(fm.pool as usize, fm.offset as usize, fm.size_bytes())?;
        decode(fm.dtype, bytes)
    }

    /// Stores integers into a feature map, saturating to its type.
    pub(crate) fn store(&mut self, fm: &FeatureMap, values: &[i64]) -> Result<(), DeviceError> {
        if values.len() != fm.elements() {
            return Err(malformed(format!(
                "produced {} element(s) for a feature map of {}",
                values.len(),
                fm.elements()
            )));
        }
        let bytes = encode(fm.dtype, values)?;
        self.write(fm.pool as usize, fm.offset as usize, &bytes)
    }
}

fn decode(dtype: DType, bytes: &[u8]) -> Result<Vec<i64>, DeviceError> {
    Ok(match dtype {
        DType::Int8 => bytes.iter().map(|&b| b as i8 as i64).collect(),
        DType::UInt8 => bytes.iter().map(|&b| b as i64).collect(),
        DType::Int16 => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as i64)
            .collect(),
        DType::Int32 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
            .collect(),
        DType::Float32 => return Err(malformed("feature map has a float element type")),
    })
}

fn encode(dtype: DType, values: &[i64]) -> Result<Vec<u8>, DeviceError> {
    let mut out = Vec::with_capacity(values.len() * dtype.size_bytes());
    for &v in values {
        let v = saturate(v, dtype);
        match dtype {
            DType::Int8 | DType::UInt8 => out.push(v as u8),
            DType::Int16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
            DType::Int32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
            DType::Float32 => return Err(malformed("feature map has a float element type")),
        }
    }
    Ok(out)
}
