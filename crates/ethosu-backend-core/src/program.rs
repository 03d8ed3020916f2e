//! The compiled artifact for one accelerator region.

use std::fmt::{self, Write};

use ethosu_ir::TensorType;

use crate::command::{Command, DecodeError, decode, words_to_bytes};
use crate::config::{AcceleratorVariant, MemoryArea};
use crate::Diagnostic;

const MAGIC: &[u8; 4] = b"EUPG";
const FORMAT_VERSION: u32 = 1;

/// A pool as used by a program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolAllocation {
    pub area: MemoryArea,
    pub capacity: usize,
    /// High-water mark of placed data in bytes.
    pub used: usize,
}

/// Location of a region input or output.
#[derive(Clone, Debug, PartialEq)]
pub struct IoBinding {
    pub name: String,
    /// Index into [`LoweredProgram::pools`].
    pub pool: usize,
    pub offset: usize,
    pub ty: TensorType,
}

/// Command stream, constant blob and memory layout for one region.
#[derive(Clone, Debug, PartialEq)]
pub struct LoweredProgram {
    pub variant: AcceleratorVariant,
    /// Encoded command stream.
    pub command_stream: Vec<u32>,
    /// Packed weights, bias/scale records and lookup tables.
    pub constants: Vec<u8>,
    /// Pool holding the constant blob, placed at offset 0.
    pub constants_pool: usize,
    pub pools: Vec<PoolAllocation>,
    pub inputs: Vec<IoBinding>,
    pub outputs: Vec<IoBinding>,
    pub diagnostics: Vec<Diagnostic>,
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_binding(out: &mut Vec<u8>, b: &IoBinding) {
    put_u32(out, b.name.len() as u32);
    out.extend_from_slice(b.name.as_bytes());
    put_u32(out, b.pool as u32);
    put_u32(out, b.offset as u32);
    out.push(b.ty.dtype.code());
    put_u32(out, b.ty.shape.rank() as u32);
    for &d in &b.ty.shape.dims {
        put_u32(out, d as u32);
    }
    match &b.ty.quant {
        Some(q) => {
            put_u32(out, q.scales.len() as u32);
            for (s, z) in q.scales.iter().zip(&q.zero_points) {
                put_u32(out, s.to_bits());
                put_u32(out, *z as u32);
            }
        }
        None => put_u32(out, 0),
    }
}

impl LoweredProgram {
    /// Decodes the command stream.
    pub fn commands(&self) -> Result<Vec<Command>, DecodeError> {
        decode(&self.command_stream)
    }

    /// Canonical serialization. Identical programs give identical bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let stream = words_to_bytes(&self.command_stream);
        let mut out = Vec::with_capacity(64 + stream.len() + self.constants.len());
        out.extend_from_slice(MAGIC);
        put_u32(&mut out, FORMAT_VERSION);
        out.push(self.variant.code());

        put_u32(&mut out, stream.len() as u32);
        out.extend_from_slice(&stream);
        put_u32(&mut out, self.constants_pool as u32);
        put_u32(&mut out, self.constants.len() as u32);
        out.extend_from_slice(&self.constants);

        put_u32(&mut out, self.pools.len() as u32);
        for p in &self.pools {
            out.push(p.area.code());
            put_u32(&mut out, p.capacity as u32);
            put_u32(&mut out, p.used as u32);
        }
        put_u32(&mut out, self.inputs.len() as u32);
        for b in &self.inputs {
            put_binding(&mut out, b);
        }
        put_u32(&mut out, self.outputs.len() as u32);
        for b in &self.outputs {
            put_binding(&mut out, b);
        }
        out
    }

    /// Human-readable listing of the program.
    pub fn disassemble(&self) -> Result<String, DecodeError> {
        let mut out = String::new();
        let _ = writeln!(out, "; variant {}", self.variant);
        for (i, p) in self.pools.iter().enumerate() {
            let _ = writeln!(
                out,
                "; pool {i}: {} {}/{} bytes{}",
                p.area,
                p.used,
                p.capacity,
                if i == self.constants_pool {
                    format!(" (constants {} bytes)", self.constants.len())
                } else {
                    String::new()
                }
            );
        }
        for b in &self.inputs {
            let _ = writeln!(out, "; input  {} @ {}:0x{:06x} {}", b.name, b.pool, b.offset, b.ty);
        }
        for b in &self.outputs {
            let _ = writeln!(out, "; output {} @ {}:0x{:06x} {}", b.name, b.pool, b.offset, b.ty);
        }
        for cmd in self.commands()? {
            let _ = writeln!(out, "{cmd}");
        }
        Ok(out)
    }

    /// Number of operation commands.
    pub fn operation_count(&self) -> usize {
        self.commands()
            .map(|cmds| cmds.iter().filter(|c| c.is_operation()).count())
            .unwrap_or(0)
    }
}

impl fmt::Display for LoweredProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} command word(s), {} constant byte(s), {} input(s), {} output(s)",
            self.variant,
            self.command_stream.len(),
            self.constants.len(),
            self.inputs.len(),
            self.outputs.len()
        )
    }
}
