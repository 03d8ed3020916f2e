//! Execution targets for compiled programs.

use std::fmt::Debug;

use ethosu_ir::Tensor;

use crate::program::LoweredProgram;

/// Errors raised while executing a program.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The program cannot be executed as encoded. Indicates a compiler
    /// fault rather than a caller error.
    #[error("malformed program: {0}")]
    MalformedProgram(String),

    /// The caller supplied the wrong number of inputs.
    #[error("expected {expected} input tensor(s), got {found}")]
    InputCount { expected: usize, found: usize },

    /// An input does not match the program's binding.
    #[error("input {index}: expected {expected}, found {found}")]
    InputMismatch {
        index: usize,
        expected: String,
        found: String,
    },
}

/// Something that can run a [`LoweredProgram`].
///
/// Implementations never mutate the program and return one tensor per
/// output binding, in binding order.
pub trait Device: Debug {
    /// Human-readable name.
    fn name(&self) -> &str;

    /// Executes `program` on `inputs`.
    fn execute(
        &self,
        program: &LoweredProgram,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>, DeviceError>;
}
