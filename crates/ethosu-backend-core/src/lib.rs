//! Backend trait, hardware model and command set for the Ethos-U pipeline.
//!
//! Defines the [`Backend`] trait that accelerator compilers implement, the
//! [`HardwareConfig`] they compile against, the command stream they emit
//! ([`command`]), the [`LoweredProgram`] container and the [`Device`] trait
//! that executes programs. A [`BackendRegistry`] maps variant identifiers
//! to backends for CLI dispatch.

use std::fmt::{self, Debug};

use ethosu_ir::{Graph, IrError};

pub mod command;
pub mod config;
mod device;
pub mod numeric;
mod program;

pub use config::{AcceleratorVariant, HardwareConfig, MemoryArea, MemoryPool, UnknownVariant};
pub use device::{Device, DeviceError};
pub use program::{IoBinding, LoweredProgram, PoolAllocation};

/// A compiler from one accelerator region to a [`LoweredProgram`].
pub trait Backend: Debug + Send + Sync {
    /// Human-readable name (e.g. "Arm Ethos-U").
    fn name(&self) -> &str;

    /// Target identifiers this backend handles (for `--accel` dispatch).
    fn targets(&self) -> &[&str];

    /// Compiles a standalone region graph for `config`.
    fn compile(
        &self,
        region: &Graph,
        config: &HardwareConfig,
    ) -> Result<LoweredProgram, BackendError>;
}

/// A non-fatal diagnostic message from a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub level: DiagnosticLevel,
    /// Human-readable message.
    pub message: String,
}

impl Diagnostic {
    /// An informational note.
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Info,
            message: message.into(),
        }
    }

    /// A warning that does not prevent compilation.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)
    }
}

/// Severity level for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticLevel {
    /// A warning that does not prevent compilation.
    Warning,
    /// An informational note.
    Info,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "Warning",
            Self::Info => "Info",
        })
    }
}

/// Errors that can occur during backend compilation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// An operator, or an operator/variant combination, cannot be lowered.
    #[error("unsupported operator '{node}': {reason}")]
    Unsupported { node: String, reason: String },

    /// A tensor or the constant blob fits no permitted memory pool.
    #[error("tensor '{tensor}' needs {required} bytes but only {available} bytes are available")]
    ResourceExhausted {
        tensor: String,
        required: usize,
        available: usize,
    },

    /// The region graph is malformed.
    #[error("invalid region: {0}")]
    InvalidRegion(#[from] IrError),

    /// A general backend error.
    #[error("{0}")]
    Other(String),
}

/// Registry of available backends, used for CLI `--accel` dispatch.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend.
    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    /// Finds a backend that handles the given target identifier.
    pub fn find(&self, target: &str) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.targets().contains(&target))
            .map(|b| &**b)
    }

    /// Lists all supported target identifiers.
    pub fn list_targets(&self) -> Vec<&str> {
        self.backends
            .iter()
            .flat_map(|b| b.targets().iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestBackend;

    impl Backend for TestBackend {
        fn name(&self) -> &str {
            "test"
        }

        fn targets(&self) -> &[&str] {
            &["test-target"]
        }

        fn compile(
            &self,
            _region: &Graph,
            config: &HardwareConfig,
        ) -> Result<LoweredProgram, BackendError> {
            Ok(LoweredProgram {
                variant: config.variant,
                command_stream: command::encode(&[command::Command::Stop]),
                constants: vec![],
                constants_pool: 0,
                pools: vec![],
                inputs: vec![],
                outputs: vec![],
                diagnostics: vec![Diagnostic::info("empty")],
            })
        }
    }

    #[test]
    fn registry_find_and_list() {
        let mut reg = BackendRegistry::new();
        assert!(reg.list_targets().is_empty());
        reg.register(Box::new(TestBackend));
        assert!(reg.find("test-target").is_some());
        assert!(reg.find("nonexistent").is_none());
        assert_eq!(reg.list_targets(), vec!["test-target"]);
    }

    #[test]
    fn custom_backend_compiles() {
        let cfg = HardwareConfig::for_variant(AcceleratorVariant::EthosU55_32);
        let program = TestBackend.compile(&Graph::new(), &cfg).unwrap();
        assert_eq!(program.variant, AcceleratorVariant::EthosU55_32);
        assert_eq!(program.operation_count(), 0);
    }

    #[test]
    fn display_diagnostic_and_level() {
        let warn = Diagnostic::warning("degenerate range");
        assert_eq!(format!("{warn}"), "[Warning] degenerate range");
        assert_eq!(format!("{}", Diagnostic::info("done")), "[Info] done");
    }

    #[test]
    fn backend_error_display() {
        let e = BackendError::ResourceExhausted {
            tensor: "ifm".into(),
            required: 786_432,
            available: 524_288,
        };
        assert_eq!(
            e.to_string(),
            "tensor 'ifm' needs 786432 bytes but only 524288 bytes are available"
        );
        let e = BackendError::Unsupported {
            node: "softmax_0".into(),
            reason: "no accelerator lowering".into(),
        };
        assert_eq!(e.to_string(), "unsupported operator 'softmax_0': no accelerator lowering");
    }
}
