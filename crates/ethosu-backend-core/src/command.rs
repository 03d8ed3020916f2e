//! Accelerator command set and its binary encoding.
//!
//! A command stream is a sequence of 32-bit little-endian words. Every
//! command starts with a header word holding the opcode in the low 16 bits
//! and a small parameter in the high 16 bits, followed by a fixed number
//! of payload words determined by the opcode. Register-setting commands
//! (`SET_*`) configure state consumed by the next operation command
//! (`OP_*`). The stream ends with `STOP`.

use std::fmt;

use ethosu_ir::DType;

mod opcode {
    pub const SET_IFM: u16 = 0x0001;
    pub const SET_IFM2: u16 = 0x0002;
    pub const SET_OFM: u16 = 0x0003;
    pub const SET_KERNEL: u16 = 0x0004;
    pub const SET_PADDING: u16 = 0x0005;
    pub const SET_WEIGHTS: u16 = 0x0006;
    pub const SET_SCALE: u16 = 0x0007;
    pub const SET_ACTIVATION: u16 = 0x0008;
    pub const SET_OFM_SCALE: u16 = 0x0009;
    pub const SET_IFM_SCALE: u16 = 0x000A;
    pub const SET_IFM2_SCALE: u16 = 0x000B;
    pub const OP_CONV: u16 = 0x0100;
    pub const OP_DEPTHWISE: u16 = 0x0101;
    pub const OP_POOL: u16 = 0x0102;
    pub const OP_ELEMENTWISE: u16 = 0x0103;
    pub const OP_DMA: u16 = 0x0104;
    pub const STOP: u16 = 0xFFFF;
}

/// A feature map (activation tensor) in memory, NHWC with batch 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureMap {
    /// Index into the program's pool table.
    pub pool: u8,
    /// Byte offset inside the pool.
    pub offset: u32,
    pub height: u32,
    pub width: u32,
    pub depth: u32,
    pub dtype: DType,
    pub zero_point: i32,
}

impl FeatureMap {
    pub fn elements(&self) -> usize {
        self.height as usize * self.width as usize * self.depth as usize
    }

    pub fn size_bytes(&self) -> usize {
        self.elements() * self.dtype.size_bytes()
    }
}

/// Kernel geometry for convolution and pooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Kernel {
    pub height: u16,
    pub width: u16,
    /// `[stride_y, stride_x]`.
    pub stride: [u8; 2],
    /// `[dilation_y, dilation_x]`.
    pub dilation: [u8; 2],
}

impl Kernel {
    /// A 1x1 kernel with unit stride.
    pub const IDENTITY: Kernel = Kernel {
        height: 1,
        width: 1,
        stride: [1, 1],
        dilation: [1, 1],
    };
}

/// Implicit zero padding around the IFM, in elements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PaddingBox {
    pub top: u8,
    pub left: u8,
    pub bottom: u8,
    pub right: u8,
}

/// A fixed-point scale `multiplier / 2^shift`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scale {
    pub multiplier: i32,
    pub shift: u8,
}

impl Scale {
    /// Exactly 1.0.
    pub const IDENTITY: Scale = Scale {
        multiplier: 1 << 30,
        shift: 30,
    };
}

/// Pooling mode of `OP_POOL`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    Average,
    /// 1x1 pass-through used for activations and table lookups.
    Identity,
}

/// Binary element-wise operation of `OP_ELEMENTWISE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementwiseOp {
    Add,
    Sub,
    Mul,
}

/// One accelerator command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    SetIfm(FeatureMap),
    SetIfm2(FeatureMap),
    SetOfm(FeatureMap),
    SetKernel(Kernel),
    SetPadding(PaddingBox),
    /// Weight stream location, relative to the constant blob.
    SetWeights { offset: u32, length: u32 },
    /// Bias/scale record location, relative to the constant blob.
    SetScale { offset: u32, length: u32 },
    /// Output clamp range and optional 256-entry LUT offset.
    SetActivation { min: i32, max: i32, lut: Option<u32> },
    SetOfmScale(Scale),
    SetIfmScale(Scale),
    SetIfm2Scale(Scale),
    OpConv,
    OpDepthwise,
    OpPool(PoolMode),
    OpElementwise { op: ElementwiseOp, left_shift: u8 },
    OpDma {
        src_pool: u8,
        src_offset: u32,
        dst_pool: u8,
        dst_offset: u32,
        length: u32,
    },
    Stop,
}

impl Command {
    /// Returns `true` for commands that launch work.
    pub fn is_operation(&self) -> bool {
        matches!(
            self,
            Self::OpConv
                | Self::OpDepthwise
                | Self::OpPool(_)
                | Self::OpElementwise { .. }
                | Self::OpDma { .. }
        )
    }
}

/// Errors produced while decoding a command stream.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("command stream length {0} is not a multiple of 4")]
    Unaligned(usize),
    #[error("unknown opcode 0x{opcode:04x} at word {offset}")]
    UnknownOpcode { offset: usize, opcode: u16 },
    #[error("truncated payload for opcode 0x{opcode:04x} at word {offset}")]
    Truncated { offset: usize, opcode: u16 },
    #[error("invalid field at word {offset}: {reason}")]
    InvalidField { offset: usize, reason: String },
    #[error("command stream has no STOP")]
    MissingStop,
    #[error("{0} word(s) after STOP")]
    TrailingWords(usize),
}

fn payload_len(op: u16) -> Option<usize> {
    use opcode::*;
    Some(match op {
        SET_IFM | SET_IFM2 | SET_OFM => 6,
        SET_KERNEL => 2,
        SET_PADDING => 1,
        SET_WEIGHTS | SET_SCALE => 2,
        SET_ACTIVATION => 3,
        SET_OFM_SCALE | SET_IFM_SCALE | SET_IFM2_SCALE => 1,
        OP_CONV | OP_DEPTHWISE | OP_POOL | OP_ELEMENTWISE => 0,
        OP_DMA => 4,
        STOP => 0,
        _ => return None,
    })
}

fn header(op: u16, param: u16) -> u32 {
    op as u32 | ((param as u32) << 16)
}

fn encode_fm(out: &mut Vec<u32>, op: u16, fm: &FeatureMap) {
    out.push(header(op, 0));
    out.push(fm.pool as u32 | ((fm.dtype.code() as u32) << 8));
    out.push(fm.offset);
    out.push(fm.height);
    out.push(fm.width);
    out.push(fm.depth);
    out.push(fm.zero_point as u32);
}

fn encode_scale(out: &mut Vec<u32>, op: u16, s: &Scale) {
    out.push(header(op, s.shift as u16));
    out.push(s.multiplier as u32);
}

/// Encodes commands into words.
pub fn encode(commands: &[Command]) -> Vec<u32> {
    let mut out = Vec::with_capacity(commands.len() * 3);
    for cmd in commands {
        match cmd {
            Command::SetIfm(fm) => encode_fm(&mut out, opcode::SET_IFM, fm),
            Command::SetIfm2(fm) => encode_fm(&mut out, opcode::SET_IFM2, fm),
            Command::SetOfm(fm) => encode_fm(&mut out, opcode::SET_OFM, fm),
            Command::SetKernel(k) => {
                out.push(header(opcode::SET_KERNEL, 0));
                out.push(k.height as u32 | ((k.width as u32) << 16));
                out.push(
                    k.stride[0] as u32
                        | ((k.stride[1] as u32) << 8)
                        | ((k.dilation[0] as u32) << 16)
                        | ((k.dilation[1] as u32) << 24),
                );
            }
            Command::SetPadding(p) => {
                out.push(header(opcode::SET_PADDING, 0));
                out.push(
                    p.top as u32
                        | ((p.left as u32) << 8)
                        | ((p.bottom as u32) << 16)
                        | ((p.right as u32) << 24),
                );
            }
            Command::SetWeights { offset, length } => {
                out.extend([header(opcode::SET_WEIGHTS, 0), *offset, *length]);
            }
            Command::SetScale { offset, length } => {
                out.extend([header(opcode::SET_SCALE, 0), *offset, *length]);
            }
            Command::SetActivation { min, max, lut } => {
                out.extend([
                    header(opcode::SET_ACTIVATION, lut.is_some() as u16),
                    *min as u32,
                    *max as u32,
                    lut.unwrap_or(0),
                ]);
            }
            Command::SetOfmScale(s) => encode_scale(&mut out, opcode::SET_OFM_SCALE, s),
            Command::SetIfmScale(s) => encode_scale(&mut out, opcode::SET_IFM_SCALE, s),
            Command::SetIfm2Scale(s) => encode_scale(&mut out, opcode::SET_IFM2_SCALE, s),
            Command::OpConv => out.push(header(opcode::OP_CONV, 0)),
            Command::OpDepthwise => out.push(header(opcode::OP_DEPTHWISE, 0)),
            Command::OpPool(mode) => {
                let param = match mode {
                    PoolMode::Max => 0,
                    PoolMode::Average => 1,
                    PoolMode::Identity => 2,
                };
                out.push(header(opcode::OP_POOL, param));
            }
            Command::OpElementwise { op, left_shift } => {
                let code = match op {
                    ElementwiseOp::Add => 0u16,
                    ElementwiseOp::Sub => 1,
                    ElementwiseOp::Mul => 2,
                };
                out.push(header(opcode::OP_ELEMENTWISE, code | ((*left_shift as u16) << 8)));
            }
            Command::OpDma {
                src_pool,
                src_offset,
                dst_pool,
                dst_offset,
                length,
            } => {
                out.extend([
                    header(opcode::OP_DMA, 0),
                    *src_pool as u32 | ((*dst_pool as u32) << 8),
                    *src_offset,
                    *dst_offset,
                    *length,
                ]);
            }
            Command::Stop => out.push(header(opcode::STOP, 0)),
        }
    }
    out
}

/// Little-endian byte image of an encoded stream.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Splits a little-endian byte image into words.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, DecodeError> {
    if bytes.len() % 4 != 0 {
        return Err(DecodeError::Unaligned(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn decode_fm(p: &[u32]) -> Result<FeatureMap, String> {
    let dtype_code = ((p[0] >> 8) & 0xFF) as u8;
    let dtype = DType::from_code(dtype_code).ok_or_else(|| format!("unknown dtype code {dtype_code}"))?;
    Ok(FeatureMap {
        pool: (p[0] & 0xFF) as u8,
        offset: p[1],
        height: p[2],
        width: p[3],
        depth: p[4],
        dtype,
        zero_point: p[5] as i32,
    })
}

fn decode_scale(param: u16, p: &[u32]) -> Result<Scale, String> {
    if param > 63 {
        return Err(format!("shift {param} exceeds 63"));
    }
    Ok(Scale {
        multiplier: p[0] as i32,
        shift: param as u8,
    })
}

fn decode_one(op: u16, param: u16, p: &[u32]) -> Result<Command, String> {
    use opcode::*;
    Ok(match op {
        SET_IFM => Command::SetIfm(decode_fm(p)?),
        SET_IFM2 => Command::SetIfm2(decode_fm(p)?),
        SET_OFM => Command::SetOfm(decode_fm(p)?),
        SET_KERNEL => Command::SetKernel(Kernel {
            height: (p[0] & 0xFFFF) as u16,
            width: (p[0] >> 16) as u16,
            stride: [(p[1] & 0xFF) as u8, ((p[1] >> 8) & 0xFF) as u8],
            dilation: [((p[1] >> 16) & 0xFF) as u8, (p[1] >> 24) as u8],
        }),
        SET_PADDING => Command::SetPadding(PaddingBox {
            top: (p[0] & 0xFF) as u8,
            left: ((p[0] >> 8) & 0xFF) as u8,
            bottom: ((p[0] >> 16) & 0xFF) as u8,
            right: (p[0] >> 24) as u8,
        }),
        SET_WEIGHTS => Command::SetWeights {
            offset: p[0],
            length: p[1],
        },
        SET_SCALE => Command::SetScale {
            offset: p[0],
            length: p[1],
        },
        SET_ACTIVATION => Command::SetActivation {
            min: p[0] as i32,
            max: p[1] as i32,
            lut: (param & 1 == 1).then_some(p[2]),
        },
        SET_OFM_SCALE => Command::SetOfmScale(decode_scale(param, p)?),
        SET_IFM_SCALE => Command::SetIfmScale(decode_scale(param, p)?),
        SET_IFM2_SCALE => Command::SetIfm2Scale(decode_scale(param, p)?),
        OP_CONV => Command::OpConv,
        OP_DEPTHWISE => Command::OpDepthwise,
        OP_POOL => Command::OpPool(match param {
            0 => PoolMode::Max,
            1 => PoolMode::Average,
            2 => PoolMode::Identity,
            other => return Err(format!("unknown pool mode {other}")),
        }),
        OP_ELEMENTWISE => Command::OpElementwise {
            op: match param & 0xFF {
                0 => ElementwiseOp::Add,
                1 => ElementwiseOp::Sub,
                2 => ElementwiseOp::Mul,
                other => return Err(format!("unknown element-wise op {other}")),
            },
            left_shift: (param >> 8) as u8,
        },
        OP_DMA => Command::OpDma {
            src_pool: (p[0] & 0xFF) as u8,
            dst_pool: ((p[0] >> 8) & 0xFF) as u8,
            src_offset: p[1],
            dst_offset: p[2],
            length: p[3],
        },
        STOP => Command::Stop,
        _ => return Err(format!("unknown opcode 0x{op:04x}")),
    })
}

/// Decodes a word stream. The stream must end with exactly one `STOP`.
pub fn decode(words: &[u32]) -> Result<Vec<Command>, DecodeError> {
    let mut commands = Vec::new();
    let mut pos = 0;
    while pos < words.len() {
        let head = words[pos];
        let op = (head & 0xFFFF) as u16;
        let param = (head >> 16) as u16;
        let len = payload_len(op).ok_or(DecodeError::UnknownOpcode {
            offset: pos,
            opcode: op,
        })?;
        let payload = words
            .get(pos + 1..pos + 1 + len)
            .ok_or(DecodeError::Truncated {
                offset: pos,
                opcode: op,
            })?;
        let cmd = decode_one(op, param, payload)
            .map_err(|reason| DecodeError::InvalidField { offset: pos, reason })?;
        pos += 1 + len;
        if cmd == Command::Stop {
            commands.push(cmd);
            if pos != words.len() {
                return Err(DecodeError::TrailingWords(words.len() - pos));
            }
            return Ok(commands);
        }
        commands.push(cmd);
    }
    Err(DecodeError::MissingStop)
}

/// Decodes a little-endian byte image.
pub fn decode_bytes(bytes: &[u8]) -> Result<Vec<Command>, DecodeError> {
    decode(&words_from_bytes(bytes)?)
}

impl fmt::Display for FeatureMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool={} off=0x{:06x} {}x{}x{} {} zp={}",
            self.pool, self.offset, self.height, self.width, self.depth, self.dtype, self.zero_point
        )
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mult={} shift={}", self.multiplier, self.shift)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetIfm(fm) => write!(f, "SET_IFM {fm}"),
            Self::SetIfm2(fm) => write!(f, "SET_IFM2 {fm}"),
            Self::SetOfm(fm) => write!(f, "SET_OFM {fm}"),
            Self::SetKernel(k) => write!(
                f,
                "SET_KERNEL {}x{} stride={}x{} dilation={}x{}",
                k.height, k.width, k.stride[0], k.stride[1], k.dilation[0], k.dilation[1]
            ),
            Self::SetPadding(p) => write!(
                f,
                "SET_PADDING top={} left={} bottom={} right={}",
                p.top, p.left, p.bottom, p.right
            ),
            Self::SetWeights { offset, length } => {
                write!(f, "SET_WEIGHTS off=0x{offset:06x} len={length}")
            }
            Self::SetScale { offset, length } => {
                write!(f, "SET_SCALE off=0x{offset:06x} len={length}")
            }
            Self::SetActivation { min, max, lut } => {
                write!(f, "SET_ACTIVATION min={min} max={max}")?;
                if let Some(lut) = lut {
                    write!(f, " lut=0x{lut:06x}")?;
                }
                Ok(())
            }
            Self::SetOfmScale(s) => write!(f, "SET_OFM_SCALE {s}"),
            Self::SetIfmScale(s) => write!(f, "SET_IFM_SCALE {s}"),
            Self::SetIfm2Scale(s) => write!(f, "SET_IFM2_SCALE {s}"),
            Self::OpConv => f.write_str("OP_CONV"),
            Self::OpDepthwise => f.write_str("OP_DEPTHWISE"),
            Self::OpPool(mode) => write!(f, "OP_POOL {mode:?}"),
            Self::OpElementwise { op, left_shift } => {
                write!(f, "OP_ELEMENTWISE {op:?} left_shift={left_shift}")
            }
            Self::OpDma {
                src_pool,
                src_offset,
                dst_pool,
                dst_offset,
                length,
            } => write!(
                f,
                "OP_DMA {src_pool}:0x{src_offset:06x} -> {dst_pool}:0x{dst_offset:06x} len={length}"
            ),
            Self::Stop => f.write_str("STOP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Command> {
        let fm = FeatureMap {
            pool: 0,
            offset: 0x40,
            height: 135,
            width: 41,
            depth: 6,
            dtype: DType::Int8,
            zero_point: -128,
        };
        vec![
            Command::SetIfm(fm),
            Command::SetOfm(FeatureMap { offset: 0x8200, ..fm }),
            Command::SetKernel(Kernel::IDENTITY),
            Command::SetPadding(PaddingBox::default()),
            Command::SetIfmScale(Scale::IDENTITY),
            Command::SetOfmScale(Scale {
                multiplier: 1_518_500_250,
                shift: 38,
            }),
            Command::SetActivation {
                min: -128,
                max: 127,
                lut: Some(0x100),
            },
            Command::OpPool(PoolMode::Identity),
            Command::OpElementwise {
                op: ElementwiseOp::Sub,
                left_shift: 20,
            },
            Command::OpDma {
                src_pool: 0,
                src_offset: 16,
                dst_pool: 1,
                dst_offset: 32,
                length: 64,
            },
            Command::Stop,
        ]
    }

    #[test]
    fn encode_decode_preserves_commands() {
        let cmds = sample();
        let bytes = words_to_bytes(&encode(&cmds));
        assert_eq!(decode_bytes(&bytes).unwrap(), cmds);
    }

    #[test]
    fn decode_rejects_truncated_stream() {
        let words = encode(&sample());
        // Cut inside the first SET_IFM payload.
        assert!(matches!(
            decode(&words[..3]),
            Err(DecodeError::Truncated { offset: 0, opcode: 0x0001 })
        ));
        // Drop STOP.
        assert_eq!(decode(&words[..words.len() - 1]), Err(DecodeError::MissingStop));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode(&[0x1234]),
            Err(DecodeError::UnknownOpcode { opcode: 0x1234, .. })
        ));
        assert_eq!(decode_bytes(&[0, 1, 2]), Err(DecodeError::Unaligned(3)));
        assert_eq!(
            decode(&[0xFFFF, 0xFFFF]),
            Err(DecodeError::TrailingWords(1))
        );
        // OP_POOL with mode 7.
        assert!(matches!(
            decode(&[0x0007_0102, 0xFFFF]),
            Err(DecodeError::InvalidField { offset: 0, .. })
        ));
    }

    #[test]
    fn disassembly_text() {
        let text: Vec<String> = sample().iter().map(|c| c.to_string()).collect();
        assert_eq!(text[0], "SET_IFM pool=0 off=0x000040 135x41x6 int8 zp=-128");
        assert_eq!(text[7], "OP_POOL Identity");
        assert_eq!(text.last().unwrap(), "STOP");
    }
}
