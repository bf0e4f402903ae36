//! Command and result channel message types.
//!
//! The supervisor talks to the scan worker over two unidirectional channels:
//!
//! - **command channel** (bounded `mpsc`, supervisor → worker): one
//!   [`WorkerCommand`] per request. Queries carry a `oneshot` sender and the
//!   worker answers on it once the command has been processed.
//! - **result channel** (unbounded `mpsc`, worker → supervisor): a stream of
//!   [`ResultMessage`]s for the running sweep, always terminated by
//!   [`ResultMessage::StopLivePlotting`].
//!
//! ```text
//! Supervisor                          Worker thread
//! ----------                          -------------
//! SetScanParams{params, reply} ---->  validate + store
//!                              <----  reply: Ok(())
//! Scan{accepted}               ---->  resolve devices
//!                              <----  accepted: Ok(points)
//!                              <----  Point, Point, ...
//!                              <----  StopLivePlotting
//! ```
//!
//! Each command variant has a helper that builds the command and returns
//! the receiver to await, so a caller can never forget the reply channel.

use crate::error::ScanResult;
use crate::hardware::{DetectorParams, DeviceInventory};
use crate::scan::params::ScanParams;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Reply sender carried by a command
pub type Reply<T> = oneshot::Sender<ScanResult<T>>;

/// Commands accepted by the scan worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Open the device database. Must succeed before anything else.
    StartMxdb {
        /// Database location understood by the device provider
        path: String,
        /// Completion
        reply: Reply<()>,
    },

    /// Validate and store the parameters of the next sweep.
    ///
    /// Re-resolves the detector when the request names one.
    SetScanParams {
        /// Replaces any stored parameters wholesale
        params: Box<ScanParams>,
        /// Completion
        reply: Reply<()>,
    },

    /// Run the sweep with the stored parameters.
    ///
    /// `accepted` answers as soon as the devices are resolved, with the total
    /// number of points; the end of the sweep is signalled on the result
    /// channel.
    Scan {
        /// Start acknowledgement
        accepted: Reply<usize>,
    },

    /// List device names per kind
    GetDevices {
        /// Inventory
        reply: Reply<DeviceInventory>,
    },

    /// Read an axis position
    GetPosition {
        /// Axis name
        device: String,
        /// Position in device units
        reply: Reply<f64>,
    },

    /// Read the second axis position (defaults to `device2` of the stored
    /// parameters)
    GetPosition2 {
        /// Explicit axis name
        device: Option<String>,
        /// Position in device units
        reply: Reply<f64>,
    },

    /// Move an axis and wait until it settles
    MoveAbs {
        /// Axis name
        device: String,
        /// Absolute target
        value: f64,
        /// Position read back after the move
        reply: Reply<f64>,
    },

    /// Move the second axis (defaults to `device2` of the stored parameters)
    MoveAbs2 {
        /// Explicit axis name
        device: Option<String>,
        /// Absolute target
        value: f64,
        /// Position read back after the move
        reply: Reply<f64>,
    },

    /// Read detector settings (defaults to the stored detector)
    GetDetParams {
        /// Explicit detector name
        detector: Option<String>,
        /// Settings
        reply: Reply<DetectorParams>,
    },

    /// Open every shutter
    OpenShutters {
        /// Read-back value per shutter
        reply: Reply<Vec<(String, u32)>>,
    },

    /// Close every shutter
    CloseShutters {
        /// Read-back value per shutter
        reply: Reply<Vec<(String, u32)>>,
    },

    /// Best-effort detector abort, valid with or without a running scan
    AbortDet {
        /// Detector name
        name: String,
        /// Optional completion
        reply: Option<Reply<()>>,
    },
}

impl WorkerCommand {
    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::StartMxdb { .. } => "start_mxdb",
            WorkerCommand::SetScanParams { .. } => "set_scan_params",
            WorkerCommand::Scan { .. } => "scan",
            WorkerCommand::GetDevices { .. } => "get_devices",
            WorkerCommand::GetPosition { .. } => "get_position",
            WorkerCommand::GetPosition2 { .. } => "get_position2",
            WorkerCommand::MoveAbs { .. } => "move_abs",
            WorkerCommand::MoveAbs2 { .. } => "move_abs2",
            WorkerCommand::GetDetParams { .. } => "get_det_params",
            WorkerCommand::OpenShutters { .. } => "open_shutters",
            WorkerCommand::CloseShutters { .. } => "close_shutters",
            WorkerCommand::AbortDet { .. } => "abort_det",
        }
    }

    /// Creates a `start_mxdb` command and the receiver for its reply
    pub fn start_mxdb(path: &str) -> (Self, oneshot::Receiver<ScanResult<()>>) {
        let (reply, rx) = oneshot::channel();
        let path = path.to_string();
        (Self::StartMxdb { path, reply }, rx)
    }

    /// Creates a `set_scan_params` command and the receiver for its reply
    pub fn set_scan_params(params: ScanParams) -> (Self, oneshot::Receiver<ScanResult<()>>) {
        let (reply, rx) = oneshot::channel();
        let params = Box::new(params);
        (Self::SetScanParams { params, reply }, rx)
    }

    /// Creates a `scan` command and the receiver for its reply
    pub fn scan() -> (Self, oneshot::Receiver<ScanResult<usize>>) {
        let (accepted, rx) = oneshot::channel();
        (Self::Scan { accepted }, rx)
    }

    /// Creates a `get_devices` command and the receiver for its reply
    pub fn get_devices() -> (Self, oneshot::Receiver<ScanResult<DeviceInventory>>) {
        let (reply, rx) = oneshot::channel();
        (Self::GetDevices { reply }, rx)
    }

    /// Creates a `get_position` command and the receiver for its reply
    pub fn get_position(device: &str) -> (Self, oneshot::Receiver<ScanResult<f64>>) {
        let (reply, rx) = oneshot::channel();
        let device = device.to_string();
        (Self::GetPosition { device, reply }, rx)
    }

    /// Creates a `get_position2` command and the receiver for its reply
    pub fn get_position2(device: Option<&str>) -> (Self, oneshot::Receiver<ScanResult<f64>>) {
        let (reply, rx) = oneshot::channel();
        let device = device.map(str::to_string);
        (Self::GetPosition2 { device, reply }, rx)
    }

    /// Creates a `move_abs` command and the receiver for its reply
    pub fn move_abs(device: &str, value: f64) -> (Self, oneshot::Receiver<ScanResult<f64>>) {
        let (reply, rx) = oneshot::channel();
        let device = device.to_string();
        (Self::MoveAbs { device, value, reply }, rx)
    }

    /// Creates a `move_abs2` command and the receiver for its reply
    pub fn move_abs2(
        device: Option<&str>,
        value: f64,
    ) -> (Self, oneshot::Receiver<ScanResult<f64>>) {
        let (reply, rx) = oneshot::channel();
        let device = device.map(str::to_string);
        (Self::MoveAbs2 { device, value, reply }, rx)
    }

    /// Creates a `get_det_params` command and the receiver for its reply
    pub fn get_det_params(
        detector: Option<&str>,
    ) -> (Self, oneshot::Receiver<ScanResult<DetectorParams>>) {
        let (reply, rx) = oneshot::channel();
        let detector = detector.map(str::to_string);
        (Self::GetDetParams { detector, reply }, rx)
    }

    /// Creates a `open_shutters` command and the receiver for its reply
    pub fn open_shutters() -> (Self, oneshot::Receiver<ScanResult<Vec<(String, u32)>>>) {
        let (reply, rx) = oneshot::channel();
        (Self::OpenShutters { reply }, rx)
    }

    /// Creates a `close_shutters` command and the receiver for its reply
    pub fn close_shutters() -> (Self, oneshot::Receiver<ScanResult<Vec<(String, u32)>>>) {
        let (reply, rx) = oneshot::channel();
        (Self::CloseShutters { reply }, rx)
    }

    /// Creates a `abort_det` command and the receiver for its reply
    pub fn abort_det(name: &str) -> (Self, oneshot::Receiver<ScanResult<()>>) {
        let (reply, rx) = oneshot::channel();
        let name = name.to_string();
        (
            Self::AbortDet {
                name,
                reply: Some(reply),
            },
            rx,
        )
    }
}

/// One measured point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    /// Running index in acquisition order
    pub index: usize,
    /// Inner axis position
    pub position: f64,
    /// Outer axis position (2D only)
    pub position2: Option<f64>,
    /// Single scaler read, or the ratio in ratio mode
    pub intensity: f64,
    /// Individual scaler reads
    pub raw: Vec<f64>,
}

/// Messages on the result channel
#[derive(Debug, Clone, PartialEq)]
pub enum ResultMessage {
    /// A measured point
    Point(ScanPoint),
    /// The scan log file being written (file-tail handshake)
    Filename(PathBuf),
    /// End of the sweep, completed or aborted. Always the last message.
    StopLivePlotting,
}

impl ResultMessage {
    /// Wire name of the end-of-scan sentinel
    pub const STOP_SENTINEL: &'static str = "stop_live_plotting";

    /// Whether this message ends the sweep
    pub fn is_sentinel(&self) -> bool {
        matches!(self, ResultMessage::StopLivePlotting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names_match_wire_protocol() {
        let (cmd, _rx) = WorkerCommand::start_mxdb("");
        assert_eq!(cmd.name(), "start_mxdb");
        let (cmd, _rx) = WorkerCommand::move_abs2(None, 1.0);
        assert_eq!(cmd.name(), "move_abs2");
        let (cmd, _rx) = WorkerCommand::abort_det("det1");
        assert_eq!(cmd.name(), "abort_det");
    }

    #[tokio::test]
    async fn test_reply_reaches_receiver() {
        let (cmd, rx) = WorkerCommand::get_position("m1");
        match cmd {
            WorkerCommand::GetPosition { device, reply } => {
                assert_eq!(device, "m1");
                reply.send(Ok(1.5)).unwrap();
            }
            other => panic!("unexpected command {}", other.name()),
        }
        assert_eq!(rx.await.unwrap().unwrap(), 1.5);
    }

    #[test]
    fn test_sentinel() {
        assert!(ResultMessage::StopLivePlotting.is_sentinel());
        assert!(!ResultMessage::Filename(PathBuf::from("scan.txt")).is_sentinel());
        assert_eq!(ResultMessage::STOP_SENTINEL, "stop_live_plotting");
    }
}
