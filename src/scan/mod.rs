//! Scan execution
//!
//! - [`params`]: the scan request and its validation
//! - [`sequence`]: position sequences and the 2D acquisition grid
//! - [`trigger`]: abort-checked waits and per-point counting/triggering
//! - [`log_file`]: the growing scan log used in file-tail mode
//! - [`protocol`]: commands and result messages between supervisor and worker
//! - [`worker`]: the command-driven state machine that owns the hardware
//! - [`supervisor`]: spawns, drives, times out and rebuilds workers

pub mod abort;
pub mod log_file;
pub mod params;
pub mod protocol;
pub mod sequence;
pub mod state;
pub mod supervisor;
pub mod trigger;
pub mod worker;

pub use abort::AbortFlag;
pub use log_file::{LogLayout, ScanLogWriter};
pub use params::{ScanDim, ScanParams, MAX_SCAN_POINTS};
pub use protocol::{ResultMessage, ScanPoint, WorkerCommand};
pub use sequence::{build_sequence, AxisSweep, GridPoint, ScanGrid};
pub use state::WorkerState;
pub use supervisor::{ScanEvent, ScanReport, ScanSession, ScanSummary, Supervisor};
pub use worker::{ScanWorker, WorkerHandle};
