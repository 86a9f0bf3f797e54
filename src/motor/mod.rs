// Motor control module for DaMiao actuators behind a serial-to-CAN adapter
//
// Provides:
// - Byte-stream transport (serial port)
// - DaMiao frame codec
// - Motor registry with enable/mode state
// - Session: command dispatch, feedback polling and guaranteed shutdown

pub mod damiao;
mod driver;
pub mod error;
pub mod registry;
pub mod transport;

pub use damiao::{ControlCommand, DecodedCommand, FeedbackFrame, SpecialCommand};
pub use driver::{open_session, ScopedOutcome, Session};
pub use error::{BatchReport, MotorError, ShutdownFailure, ShutdownReport, ShutdownStep};
pub use registry::{ControlMode, Motor, MotorHandle, MotorRegistry, MotorType};
pub use transport::{SerialTransport, Transport};
