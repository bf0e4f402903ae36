//! Custom error types for the scan engine.
//!
//! This module defines `ScanError`, the error type shared by the worker, the
//! supervisor and the analysis pipeline. It follows the failure taxonomy of the
//! engine:
//!
//! - **Hardware-limit violations** (`LimitViolation`): a requested move would
//!   leave the axis soft limits. Reported to the caller, the move is not made,
//!   and the worker keeps running.
//! - **Connectivity failures** (`DeviceNotFound`, `DatabaseNotOpen`): a device
//!   name could not be resolved in the device database. The affected command
//!   fails; nothing else does.
//! - **Scan-level aborts** (`Aborted`): user-requested cancellation observed at
//!   a wait point. Always acknowledged downstream by the end-of-scan sentinel.
//! - **Protocol failures** (`WorkerGone`, `Timeout`): the supervisor lost
//!   contact with the worker or never saw the sentinel; the worker is rebuilt.
//!
//! Analysis-degenerate inputs never produce an error; the analysis functions
//! return well-defined zero results instead.

use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device database is not open (send start_mxdb first)")]
    DatabaseNotOpen,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid scan parameters: {0}")]
    InvalidParams(String),

    #[error("Move of '{device}' to {target} violates limits [{low}, {high}]")]
    LimitViolation {
        device: String,
        target: f64,
        low: f64,
        high: f64,
    },

    #[error("No detector selected")]
    NoDetector,

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Scan aborted")]
    Aborted,

    #[error("Scan worker is not accepting commands: {0}")]
    WorkerBusy(String),

    #[error("Scan worker is gone")]
    WorkerGone,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ScanError {
    /// Whether the condition is handled locally without rebuilding the worker.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScanError::LimitViolation { .. }
                | ScanError::DeviceNotFound(_)
                | ScanError::InvalidParams(_)
                | ScanError::Aborted
                | ScanError::WorkerBusy(_)
                | ScanError::Parse(_)
        )
    }
}

impl From<anyhow::Error> for ScanError {
    fn from(value: anyhow::Error) -> Self {
        ScanError::Hardware(format!("{value:#}"))
    }
}
