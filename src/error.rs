//! Custom error types for the testbed controller.
//!
//! This module defines the primary error type, `TestbedError`, for the whole crate.
//! Using the `thiserror` crate, it provides one place for every failure that the
//! protocol, poller, telemetry and orchestration layers can produce.
//!
//! ## Error Hierarchy
//!
//! - **Protocol** (`ProtocolTimeout`, `ShortRead`, `ChecksumMismatch`, `MalformedFrame`,
//!   `UnexpectedReply`, `ShortPayload`): a single exchange with the device-under-test failed.
//!   These are recoverable; the next tick issues a fresh exchange.
//! - **Programmer errors** (`UnknownCommand`, `ArgumentArityMismatch`): the caller asked the
//!   codec for something the command table does not describe.
//! - **Configuration** (`OutOfRange`, `Configuration`, `Config`): the requested action is
//!   rejected synchronously and has no side effects.
//! - **Storage** (`LogIo`, `MalformedRecord`): the telemetry log could not be read or written.
//! - **`QueueEmpty`**: expected when the orchestrator drains an idle hand-off queue.
//!
//! By using `#[from]`, lower-level errors convert with the `?` operator.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, TestbedError>;

/// Every failure the testbed library reports.
#[derive(Error, Debug)]
pub enum TestbedError {
    #[error("No reply frame within {timeout_ms} ms")]
    ProtocolTimeout { timeout_ms: u128 },

    #[error("Stream closed after {received} of {expected} bytes")]
    ShortRead { expected: usize, received: usize },

    #[error("Unknown command id 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("Command 0x{command:02X} expects {expected}, got {got}")]
    ArgumentArityMismatch {
        command: u8,
        expected: String,
        got: String,
    },

    #[error("Payload for command 0x{command:02X} is {got} bytes, layout needs {needed}")]
    ShortPayload {
        command: u8,
        needed: usize,
        got: usize,
    },

    #[error("Checksum mismatch: frame carries 0x{actual:02X}, computed 0x{expected:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Reply for command 0x{got:02X} while waiting for 0x{expected:02X}")]
    UnexpectedReply { expected: u8, got: u8 },

    #[error("Setpoint {value} outside allowed range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("Telemetry log error at '{}': {source}", path.display())]
    LogIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed telemetry record '{line}': {reason}")]
    MalformedRecord { line: String, reason: String },

    #[error("Hand-off queue is empty")]
    QueueEmpty,

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("No experiment session is running")]
    SessionNotRunning,

    #[error("An experiment session is already running")]
    SessionAlreadyRunning,
}

impl TestbedError {
    /// Wrap an I/O error that happened on the telemetry store at `path`.
    pub fn log_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TestbedError::LogIo {
            path: path.into(),
            source,
        }
    }

    /// Whether the owning loop may carry on to its next iteration.
    ///
    /// Protocol- and measurement-level failures are local to one tick or one poller
    /// iteration. Configuration errors and programmer errors are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TestbedError::ProtocolTimeout { .. }
                | TestbedError::ShortRead { .. }
                | TestbedError::ShortPayload { .. }
                | TestbedError::ChecksumMismatch { .. }
                | TestbedError::MalformedFrame(_)
                | TestbedError::UnexpectedReply { .. }
                | TestbedError::QueueEmpty
                | TestbedError::Instrument(_)
                | TestbedError::Io(_)
                | TestbedError::LogIo { .. }
                | TestbedError::MalformedRecord { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_recoverable() {
        assert!(TestbedError::ProtocolTimeout { timeout_ms: 200 }.is_recoverable());
        assert!(TestbedError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_recoverable());
        assert!(TestbedError::QueueEmpty.is_recoverable());
    }

    #[test]
    fn configuration_errors_are_not_recoverable() {
        let err = TestbedError::OutOfRange {
            value: 9.0,
            min: 0.0,
            max: 5.0,
        };
        assert!(!err.is_recoverable());
        assert!(!TestbedError::UnknownCommand(0x7F).is_recoverable());
        assert!(!TestbedError::Configuration("bad".into()).is_recoverable());
    }

    #[test]
    fn messages_carry_context() {
        let err = TestbedError::UnknownCommand(0x0A);
        assert_eq!(err.to_string(), "Unknown command id 0x0A");

        let err = TestbedError::log_io(
            "data/run.csv",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("data/run.csv"));
    }
}
