//! Device Capabilities
//!
//! Fine-grained capability traits for the devices a scan consumes. The scan
//! engine never talks to a concrete driver; it is handed trait objects from the
//! device database and only ever calls the operations below:
//!
//! - An axis (motor) implements [`Axis`]
//! - A counting gate implements [`Timer`]
//! - A counter channel implements [`Scaler`]
//! - An area detector implements [`Detector`]
//! - A multi-channel burst source implements [`PulseGenerator`]
//! - Shutters and the software trigger line implement [`BinaryOutput`]
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Never blocks until completion; callers poll `is_busy`/`get_status`
//!   so that every wait can observe an abort request

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Status bit reported by a detector while it is acquiring frames.
pub const DETECTOR_STATUS_BUSY: u32 = 0x1;

/// Status bit reported by a pulse generator while a burst is running.
pub const PULSE_GENERATOR_STATUS_BUSY: u32 = 0x1;

/// Capability: Motion Control
///
/// # Contract
/// - `move_absolute` initiates motion and returns before completion
/// - `is_busy` reports whether motion is still in progress
/// - `stop` halts motion in progress; the axis keeps wherever it stopped
#[async_trait]
pub trait Axis: Send + Sync {
    /// Start a move to an absolute position in device units
    async fn move_absolute(&self, position: f64) -> Result<()>;

    /// Whether the axis is still moving
    async fn is_busy(&self) -> Result<bool>;

    /// Stop motion immediately
    async fn stop(&self) -> Result<()>;

    /// Current position (approximate while moving)
    async fn get_position(&self) -> Result<f64>;

    /// Soft limits `(low, high)` in device units
    ///
    /// # Default Implementation
    /// Unlimited travel.
    fn limits(&self) -> (f64, f64) {
        (f64::NEG_INFINITY, f64::INFINITY)
    }
}

/// Capability: Counting Gate
///
/// The timer defines the counting window of every scaler it gates.
#[async_trait]
pub trait Timer: Send + Sync {
    /// Reset the timer
    async fn clear(&self) -> Result<()>;

    /// Open the gate for `seconds`
    async fn start(&self, seconds: f64) -> Result<()>;

    /// Whether the gate is still open
    async fn is_busy(&self) -> Result<bool>;

    /// Close the gate early
    async fn stop(&self) -> Result<()>;
}

/// Capability: Counter Readout
#[async_trait]
pub trait Scaler: Send + Sync {
    /// Zero the accumulated count
    async fn clear(&self) -> Result<()>;

    /// Read the count accumulated during the last gate
    async fn read(&self) -> Result<f64>;
}

/// Detector trigger source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Free-running, internally timed exposures
    Internal,
    /// One frame per external trigger edge
    External,
}

/// Detector acquisition settings as reported by the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorParams {
    /// Trigger source
    pub trigger_mode: TriggerMode,
    /// Frames per arm
    pub num_frames: u32,
    /// Exposure time in seconds
    pub exposure_time: f64,
    /// Frame period in seconds
    pub exposure_period: f64,
    /// Raw status word (see [`DETECTOR_STATUS_BUSY`])
    pub status: u32,
    /// Output file name for the next acquisition
    pub filename: Option<String>,
}

/// Capability: Area Detector
///
/// # Contract
/// - Settings apply to the next `arm()`
/// - `abort()` is best-effort and valid in any state
#[async_trait]
pub trait Detector: Send + Sync {
    /// Select internal or external triggering
    async fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()>;

    /// Number of frames to take per arm
    async fn set_num_frames(&self, frames: u32) -> Result<()>;

    /// Exposure time in seconds
    async fn set_exp_time(&self, seconds: f64) -> Result<()>;

    /// Frame period in seconds
    async fn set_exp_period(&self, seconds: f64) -> Result<()>;

    /// Name of the file the next acquisition is written to
    async fn set_filename(&self, filename: &str) -> Result<()>;

    /// Wait for triggers
    async fn arm(&self) -> Result<()>;

    /// Stop acquiring and disarm
    async fn abort(&self) -> Result<()>;

    /// Raw status word
    async fn get_status(&self) -> Result<u32>;

    /// Current acquisition settings
    async fn get_params(&self) -> Result<DetectorParams>;
}

/// Timing of one pulse-generator channel, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseSetup {
    /// Pulse width
    pub width: f64,
    /// Delay from the burst start
    pub delay: f64,
    /// Pulse period
    pub period: f64,
    /// Pulses per burst
    pub num_pulses: u32,
}

/// Capability: Multi-channel Pulse/Burst Generator
#[async_trait]
pub trait PulseGenerator: Send + Sync {
    /// Number of output channels
    fn num_channels(&self) -> usize;

    /// Configure one channel
    async fn setup(&self, channel: usize, setup: PulseSetup) -> Result<()>;

    /// Arm the burst; it starts on the next trigger edge
    async fn arm(&self) -> Result<()>;

    /// Stop any burst in progress
    async fn stop(&self) -> Result<()>;

    /// Raw status word (see [`PULSE_GENERATOR_STATUS_BUSY`])
    async fn get_status(&self) -> Result<u32>;
}

/// Capability: Binary Output (shutters, software trigger line)
#[async_trait]
pub trait BinaryOutput: Send + Sync {
    /// Write the output value
    async fn write(&self, value: u32) -> Result<()>;

    /// Read back the output value
    async fn read(&self) -> Result<u32>;
}
