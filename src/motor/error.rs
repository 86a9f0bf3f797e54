// Error taxonomy for the DaMiao bus driver

use std::fmt;
use std::time::Duration;

use super::registry::ControlMode;

/// Error types for bus communication and command preconditions
#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Failed to open {port} at {baud_rate} baud: {source}")]
    Connection {
        port: String,
        baud_rate: u32,
        #[source]
        source: serialport::Error,
    },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No feedback within {0:?}")]
    Timeout(Duration),

    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("Motor 0x{address:02X} is not registered")]
    NotRegistered { address: u16 },

    #[error("Motor 0x{address:02X} is not enabled")]
    NotEnabled { address: u16 },

    #[error("Motor 0x{address:02X} is in {actual:?} mode, command needs {expected:?}")]
    ModeMismatch {
        address: u16,
        expected: ControlMode,
        actual: Option<ControlMode>,
    },

    #[error("{mode:?} value {value} outside [-{limit}, {limit}]")]
    Range {
        mode: ControlMode,
        value: f32,
        limit: f32,
    },

    #[error("Address 0x{address:02X} is already registered")]
    DuplicateAddress { address: u16 },

    #[error("Address 0x{address:03X} is outside 0x01..=0xFF")]
    InvalidAddress { address: u16 },

    #[error("Transport closed")]
    Closed,

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MotorError>;

/// Which part of the shutdown sequence failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    ZeroCommand { address: u16 },
    Disable { address: u16 },
    CloseTransport,
}

#[derive(Debug)]
pub struct ShutdownFailure {
    pub step: ShutdownStep,
    pub error: MotorError,
}

/// Every failure seen while stopping motors and closing the link.
///
/// Shutdown never stops at the first error, so this is a list.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub failures: Vec<ShutdownFailure>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn record(&mut self, step: ShutdownStep, result: Result<()>) {
        if let Err(error) = result {
            self.failures.push(ShutdownFailure { step, error });
        }
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return write!(f, "clean shutdown");
        }
        write!(f, "{} shutdown step(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{:?}: {}]", failure.step, failure.error)?;
        }
        Ok(())
    }
}

/// Per-motor outcome of a multi-motor dispatch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub sent: Vec<u16>,
    pub failures: Vec<(u16, MotorError)>,
}

impl BatchReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}
