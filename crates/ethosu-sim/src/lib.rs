//! Functional simulator for Ethos-U programs.
//!
//! [`Simulator`] executes a [`LoweredProgram`] the way the accelerator
//! would: pools are materialized as byte arrays, the constant blob is
//! loaded at offset 0 of its pool, inputs are written at their bindings
//! and the command stream is interpreted register by register. All
//! arithmetic is integer and follows the output stage defined in
//! [`ethosu_backend_core::numeric`], so results are bit-exact with the
//! hardware model regardless of host.

mod memory;
mod ops;

use ethosu_backend_core::command::{Command, FeatureMap, Kernel, PaddingBox, Scale};
use ethosu_backend_core::numeric::{rescale, saturate};
use ethosu_backend_core::{Device, DeviceError, LoweredProgram};
use ethosu_ir::{DType, Tensor};

use crate::memory::Memory;

pub(crate) fn malformed(reason: impl Into<String>) -> DeviceError {
    DeviceError::MalformedProgram(reason.into())
}

/// A `(offset, length)` window into the constant blob.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Window {
    offset: u32,
    length: u32,
}

/// Output clamp and optional lookup table.
#[derive(Clone, Copy, Debug)]
struct Activation {
    min: i32,
    max: i32,
    lut: Option<u32>,
}

/// Register file. `SET_*` commands write it, operations read it. Values
/// persist across operations.
#[derive(Clone, Debug)]
pub(crate) struct Registers {
    ifm: Option<FeatureMap>,
    ifm2: Option<FeatureMap>,
    ofm: Option<FeatureMap>,
    kernel: Kernel,
    padding: PaddingBox,
    weights: Option<Window>,
    scales: Option<Window>,
    activation: Option<Activation>,
    ofm_scale: Scale,
    ifm_scale: Scale,
    ifm2_scale: Scale,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            ifm: None,
            ifm2: None,
            ofm: None,
            kernel: Kernel::IDENTITY,
            padding: PaddingBox::default(),
            weights: None,
            scales: None,
            activation: None,
            ofm_scale: Scale::IDENTITY,
            ifm_scale: Scale::IDENTITY,
            ifm2_scale: Scale::IDENTITY,
        }
    }
}

/// Requantization, clamping and table lookup applied to every
/// accumulator before it is written to the OFM.
#[derive(Debug)]
pub(crate) struct OutputStage {
    zero_point: i64,
    dtype: DType,
    min: i64,
    max: i64,
    lut: Option<Vec<u8>>,
}

impl OutputStage {
    pub(crate) fn apply(&self, acc: i64, scale: Scale) -> Result<i64, DeviceError> {
        let y = rescale(acc, scale.multiplier, scale.shift).saturating_add(self.zero_point);
        let y = saturate(y, self.dtype).clamp(self.min, self.max);
        let Some(table) = &self.lut else {
            return Ok(y);
        };
        let (lo, _) = self.dtype.int_range().unwrap_or((0, 0));
        let entry = usize::try_from(y - lo)
            .ok()
            .and_then(|i| table.get(i))
            .ok_or_else(|| malformed(format!("lookup table index {y} outside the {} range", self.dtype)))?;
        Ok(match self.dtype {
            DType::Int8 => *entry as i8 as i64,
            _ => *entry as i64,
        })
    }
}

/// Interpreter state for one execution.
#[derive(Debug)]
pub(crate) struct Machine {
    memory: Memory,
    constants_pool: usize,
    block_depth: usize,
    regs: Registers,
}

impl Machine {
    fn required(fm: Option<FeatureMap>, what: &str) -> Result<FeatureMap, DeviceError> {
        fm.ok_or_else(|| malformed(format!("operation issued before {what} was set")))
    }

    pub(crate) fn ifm(&self) -> Result<FeatureMap, DeviceError> {
        Self::required(self.regs.ifm, "SET_IFM")
    }

    pub(crate) fn ifm2(&self) -> Result<FeatureMap, DeviceError> {
        Self::required(self.regs.ifm2, "SET_IFM2")
    }

    pub(crate) fn ofm(&self) -> Result<FeatureMap, DeviceError> {
        let ofm = Self::required(self.regs.ofm, "SET_OFM")?;
        // Bounds-check before any kernel sizes its output buffer.
        self.memory
            .read(ofm.pool as usize, ofm.offset as usize, ofm.size_bytes())?;
        Ok(ofm)
    }

    /// Bytes of the constant blob addressed by `window`.
    pub(crate) fn constants(&self, window: Window) -> Result<&[u8], DeviceError> {
        self.memory
            .read(self.constants_pool, window.offset as usize, window.length as usize)
    }

    pub(crate) fn output_stage(&self, ofm: &FeatureMap) -> Result<OutputStage, DeviceError> {
        let (lo, hi) = ofm
            .dtype
            .int_range()
            .ok_or_else(|| malformed("OFM has a float element type"))?;
        let act = self.regs.activation.unwrap_or(Activation {
            min: lo as i32,
            max: hi as i32,
            lut: None,
        });
        let lut = match act.lut {
            Some(offset) => {
                if ofm.dtype.size_bytes() != 1 {
                    return Err(malformed(format!("lookup table on a {} OFM", ofm.dtype)));
                }
                Some(self.constants(Window { offset, length: 256 })?.to_vec())
            }
            None => None,
        };
        Ok(OutputStage {
            zero_point: ofm.zero_point as i64,
            dtype: ofm.dtype,
            min: act.min as i64,
            max: act.max as i64,
            lut,
        })
    }

    fn step(&mut self, command: &Command) -> Result<(), DeviceError> {
        let regs = &mut self.regs;
        match *command {
            Command::SetIfm(fm) => regs.ifm = Some(fm),
            Command::SetIfm2(fm) => regs.ifm2 = Some(fm),
            Command::SetOfm(fm) => regs.ofm = Some(fm),
            Command::SetKernel(k) => regs.kernel = k,
            Command::SetPadding(p) => regs.padding = p,
            Command::SetWeights { offset, length } => regs.weights = Some(Window { offset, length }),
            Command::SetScale { offset, length } => regs.scales = Some(Window { offset, length }),
            Command::SetActivation { min, max, lut } => {
                if min > max {
                    return Err(malformed(format!("activation range {min}..={max} is empty")));
                }
                regs.activation = Some(Activation { min, max, lut });
            }
            Command::SetOfmScale(s) => regs.ofm_scale = s,
            Command::SetIfmScale(s) => regs.ifm_scale = s,
            Command::SetIfm2Scale(s) => regs.ifm2_scale = s,
            Command::OpConv => self.convolution(false)?,
            Command::OpDepthwise => self.convolution(true)?,
            Command::OpPool(mode) => self.pool(mode)?,
            Command::OpElementwise { op, left_shift } => self.elementwise(op, left_shift)?,
            Command::OpDma {
                src_pool,
                src_offset,
                dst_pool,
                dst_offset,
                length,
            } => {
                let data = self
                    .memory
                    .read(src_pool as usize, src_offset as usize, length as usize)?
                    .to_vec();
                self.memory.write(dst_pool as usize, dst_offset as usize, &data)?;
            }
            Command::Stop => {}
        }
        Ok(())
    }
}

/// Bit-exact software model of the accelerator.
#[derive(Clone, Copy, Debug, Default)]
pub struct Simulator;

impl Simulator {
    pub fn new() -> Self {
        Self
    }
}

impl Device for Simulator {
    fn name(&self) -> &str {
        "Ethos-U simulator"
    }

    fn execute(
        &self,
        program: &LoweredProgram,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>, DeviceError> {
        if inputs.len() != program.inputs.len() {
            return Err(DeviceError::InputCount {
                expected: program.inputs.len(),
                found: inputs.len(),
            });
        }
        for (index, (tensor, binding)) in inputs.iter().zip(&program.inputs).enumerate() {
            if !tensor.conforms_to(&binding.ty) {
                return Err(DeviceError::InputMismatch {
                    index,
                    expected: binding.ty.to_string(),
                    found: tensor.tensor_type().to_string(),
                });
            }
        }

        let mut machine = Machine {
            memory: Memory::new(program.pools.iter().map(|p| p.used)),
            constants_pool: program.constants_pool,
            block_depth: program.variant.ofm_block_depth(),
            regs: Registers::default(),
        };
        machine
            .memory
            .write(program.constants_pool, 0, &program.constants)?;
        for (tensor, binding) in inputs.iter().zip(&program.inputs) {
            machine
                .memory
                .write(binding.pool, binding.offset, &tensor.to_le_bytes())?;
        }

        let commands = program
            .commands()
            .map_err(|e| malformed(format!("command stream: {e}")))?;
        let mut operations = 0usize;
        for command in &commands {
            machine.step(command)?;
            if command.is_operation() {
                operations += 1;
            }
        }
        log::debug!(
            "{}: executed {} command(s), {} operation(s)",
            program.variant,
            commands.len(),
            operations
        );

        program
            .outputs
            .iter()
            .map(|binding| {
                let bytes = machine
                    .memory
                    .read(binding.pool, binding.offset, binding.ty.size_bytes())?;
                Tensor::from_le_bytes(&binding.ty, bytes)
                    .map_err(|e| malformed(format!("output '{}': {e}", binding.name)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosu_backend_core::command::{ElementwiseOp, PoolMode, encode};
    use ethosu_backend_core::{AcceleratorVariant, IoBinding, MemoryArea, PoolAllocation};
    use ethosu_ir::{QuantParams, TensorType};

    fn ty(zp: i32) -> TensorType {
        TensorType::quantized(DType::Int8, [1, 4], QuantParams::per_tensor(0.5, zp))
    }

    fn fm(offset: u32, zero_point: i32) -> FeatureMap {
        FeatureMap {
            pool: 0,
            offset,
            height: 1,
            width: 1,
            depth: 4,
            dtype: DType::Int8,
            zero_point,
        }
    }

    fn program(commands: &[Command], constants: Vec<u8>) -> LoweredProgram {
        LoweredProgram {
            variant: AcceleratorVariant::EthosU55_64,
            command_stream: encode(commands),
            constants_pool: 1,
            pools: vec![
                PoolAllocation {
                    area: MemoryArea::Sram,
                    capacity: 1024,
                    used: 32,
                },
                PoolAllocation {
                    area: MemoryArea::Flash,
                    capacity: 4096,
                    used: constants.len(),
                },
            ],
            constants,
            inputs: vec![IoBinding {
                name: "x".into(),
                pool: 0,
                offset: 0,
                ty: ty(0),
            }],
            outputs: vec![IoBinding {
                name: "y".into(),
                pool: 0,
                offset: 16,
                ty: ty(0),
            }],
            diagnostics: vec![],
        }
    }

    fn input(values: Vec<i8>) -> Tensor {
        Tensor::from_i8(&[1, 4], values, ty(0).quant).unwrap()
    }

    #[test]
    fn identity_pool_with_clamp() {
        let p = program(
            &[
                Command::SetIfm(fm(0, 0)),
                Command::SetOfm(fm(16, 0)),
                Command::SetActivation {
                    min: 0,
                    max: 10,
                    lut: None,
                },
                Command::OpPool(PoolMode::Identity),
                Command::Stop,
            ],
            vec![],
        );
        let out = Simulator.execute(&p, &[input(vec![-5, 3, 10, 100])]).unwrap();
        assert_eq!(out[0].int_values(), vec![0, 3, 10, 10]);
    }

    #[test]
    fn lookup_table_is_indexed_by_code() {
        // Table entry i holds 127 - i as i8.
        let table: Vec<u8> = (0..256).map(|i| (127 - i) as i8 as u8).collect();
        let p = program(
            &[
                Command::SetIfm(fm(0, 0)),
                Command::SetOfm(fm(16, 0)),
                Command::SetActivation {
                    min: -128,
                    max: 127,
                    lut: Some(0),
                },
                Command::OpPool(PoolMode::Identity),
                Command::Stop,
            ],
            table,
        );
        let out = Simulator.execute(&p, &[input(vec![-128, -1, 0, 127])]).unwrap();
        assert_eq!(out[0].int_values(), vec![127, 0, -1, -128]);
    }

    #[test]
    fn dma_copies_bytes() {
        let p = program(
            &[
                Command::OpDma {
                    src_pool: 0,
                    src_offset: 0,
                    dst_pool: 0,
                    dst_offset: 16,
                    length: 4,
                },
                Command::Stop,
            ],
            vec![],
        );
        let out = Simulator.execute(&p, &[input(vec![1, -2, 3, -4])]).unwrap();
        assert_eq!(out[0].int_values(), vec![1, -2, 3, -4]);
    }

    #[test]
    fn missing_ofm_is_malformed() {
        let p = program(
            &[
                Command::SetIfm(fm(0, 0)),
                Command::OpPool(PoolMode::Identity),
                Command::Stop,
            ],
            vec![],
        );
        let err = Simulator.execute(&p, &[input(vec![0; 4])]).unwrap_err();
        assert!(matches!(err, DeviceError::MalformedProgram(ref m) if m.contains("SET_OFM")));
    }

    #[test]
    fn inputs_are_checked() {
        let p = program(&[Command::Stop], vec![]);
        assert!(matches!(
            Simulator.execute(&p, &[]),
            Err(DeviceError::InputCount {
                expected: 1,
                found: 0
            })
        ));
        let wrong = Tensor::from_i8(&[1, 5], vec![0; 5], None).unwrap();
        assert!(matches!(
            Simulator.execute(&p, &[wrong]),
            Err(DeviceError::InputMismatch { index: 0, .. })
        ));
    }

    fn assert_malformed(p: &LoweredProgram) {
        let err = Simulator.execute(p, &[input(vec![1, -2, 3, -4])]).unwrap_err();
        assert!(matches!(err, DeviceError::MalformedProgram(_)), "{err}");
    }

    #[test]
    fn inverted_activation_range_is_malformed() {
        assert_malformed(&program(
            &[
                Command::SetIfm(fm(0, 0)),
                Command::SetOfm(fm(16, 0)),
                Command::SetActivation {
                    min: 10,
                    max: -10,
                    lut: None,
                },
                Command::OpPool(PoolMode::Identity),
                Command::Stop,
            ],
            vec![],
        ));
    }

    #[test]
    fn clamp_outside_lookup_table_is_malformed() {
        assert_malformed(&program(
            &[
                Command::SetIfm(fm(0, 0)),
                Command::SetOfm(fm(16, 0)),
                Command::SetActivation {
                    min: -1000,
                    max: -500,
                    lut: Some(0),
                },
                Command::OpPool(PoolMode::Identity),
                Command::Stop,
            ],
            vec![0; 256],
        ));
    }

    #[test]
    fn elementwise_overflow_is_malformed() {
        for (op, left_shift) in [(ElementwiseOp::Add, 64), (ElementwiseOp::Sub, 255), (ElementwiseOp::Mul, 62)] {
            assert_malformed(&program(
                &[
                    Command::SetIfm(fm(0, 0)),
                    Command::SetIfm2(fm(0, 0)),
                    Command::SetOfm(fm(16, 0)),
                    Command::OpElementwise { op, left_shift },
                    Command::Stop,
                ],
                vec![],
            ));
        }
    }

    #[test]
    fn truncated_stream_is_malformed() {
        let mut p = program(&[Command::Stop], vec![]);
        p.command_stream.clear();
        assert!(matches!(
            Simulator.execute(&p, &[input(vec![0; 4])]),
            Err(DeviceError::MalformedProgram(_))
        ));
    }
}
