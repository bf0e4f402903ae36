//! Scan parameter model
//!
//! A [`ScanParams`] value describes one scan request. It is built once per
//! request, validated before the scan starts, never mutated while the scan
//! runs, and replaced wholesale by the next request.

use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest number of grid points a single request may produce.
pub const MAX_SCAN_POINTS: usize = 1_000_000;

/// Scan dimensionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanDim {
    /// Single-axis sweep
    #[serde(rename = "1D")]
    OneD,
    /// Two-axis map; `device2` is the outer (slow) axis
    #[serde(rename = "2D")]
    TwoD,
}

impl fmt::Display for ScanDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanDim::OneD => write!(f, "1D"),
            ScanDim::TwoD => write!(f, "2D"),
        }
    }
}

/// One scan request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    /// Scanned axis (inner, fast axis for 2D)
    pub device: String,
    /// Second axis (outer, slow axis), 2D only
    #[serde(default)]
    pub device2: Option<String>,
    /// First position of `device`
    pub start: f64,
    /// Last position of `device`
    pub stop: f64,
    /// Step magnitude of `device`; its sign comes from `stop - start`
    pub step: f64,
    /// First position of `device2`
    #[serde(default)]
    pub start2: Option<f64>,
    /// Last position of `device2`
    #[serde(default)]
    pub stop2: Option<f64>,
    /// Step magnitude of `device2`
    #[serde(default)]
    pub step2: Option<f64>,
    /// Scaler channels read at every point
    pub scalers: Vec<String>,
    /// Counting gate; required unless a detector drives the counting window
    #[serde(default)]
    pub timer: Option<String>,
    /// Counting time per point in seconds
    pub dwell_time: f64,
    /// Externally triggered area detector
    #[serde(default)]
    pub detector: Option<String>,
    /// Dimensionality
    pub scan_dim: ScanDim,
    /// Open the shutters for the duration of the sweep
    #[serde(default)]
    pub open_shutter: bool,
    /// Report `scalers[0] / scalers[1]` instead of a single read
    #[serde(default)]
    pub ratio: bool,
}

impl ScanParams {
    /// A 1D request with no counters selected yet
    pub fn line(device: &str, start: f64, stop: f64, step: f64) -> Self {
        Self {
            device: device.to_string(),
            device2: None,
            start,
            stop,
            step,
            start2: None,
            stop2: None,
            step2: None,
            scalers: Vec::new(),
            timer: None,
            dwell_time: 0.1,
            detector: None,
            scan_dim: ScanDim::OneD,
            open_shutter: false,
            ratio: false,
        }
    }

    /// Turn the request into a 2D map with `device2` as the outer axis
    pub fn with_outer(mut self, device2: &str, start2: f64, stop2: f64, step2: f64) -> Self {
        self.device2 = Some(device2.to_string());
        self.start2 = Some(start2);
        self.stop2 = Some(stop2);
        self.step2 = Some(step2);
        self.scan_dim = ScanDim::TwoD;
        self
    }

    /// Set the counting gate
    pub fn with_timer(mut self, timer: &str) -> Self {
        self.timer = Some(timer.to_string());
        self
    }

    /// Set the scaler channels
    pub fn with_scalers(mut self, scalers: &[&str]) -> Self {
        self.scalers = scalers.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the dwell time in seconds
    pub fn with_dwell(mut self, seconds: f64) -> Self {
        self.dwell_time = seconds;
        self
    }

    /// Attach an externally triggered detector
    pub fn with_detector(mut self, detector: &str) -> Self {
        self.detector = Some(detector.to_string());
        self
    }

    /// Open the shutters during the sweep
    pub fn with_open_shutter(mut self, open: bool) -> Self {
        self.open_shutter = open;
        self
    }

    /// Report the ratio of the two scalers
    pub fn with_ratio(mut self, ratio: bool) -> Self {
        self.ratio = ratio;
        self
    }

    /// Step for `device` with the sign of `stop - start`
    pub fn signed_step(&self) -> f64 {
        signed(self.start, self.stop, self.step)
    }

    /// Step for `device2` with the sign of `stop2 - start2`
    pub fn signed_step2(&self) -> Option<f64> {
        match (self.start2, self.stop2, self.step2) {
            (Some(a), Some(b), Some(s)) => Some(signed(a, b, s)),
            _ => None,
        }
    }

    /// Outer axis settings, present for complete 2D requests
    pub fn outer(&self) -> Option<(&str, f64, f64, f64)> {
        match (&self.device2, self.start2, self.stop2, self.step2) {
            (Some(d), Some(a), Some(b), Some(s)) => Some((d.as_str(), a, b, s)),
            _ => None,
        }
    }

    /// Check the request before a scan is allowed to start
    pub fn validate(&self) -> ScanResult<()> {
        if self.device.trim().is_empty() {
            return Err(invalid("must select a device to scan"));
        }
        check_range("", self.start, self.stop, self.step)?;

        if !(self.dwell_time > 0.0) || !self.dwell_time.is_finite() {
            return Err(invalid("dwell time must be a positive number of seconds"));
        }

        if self.scalers.is_empty() {
            return Err(invalid("must select a scaler"));
        }
        if self.ratio && self.scalers.len() != 2 {
            return Err(invalid("ratio mode needs exactly two scalers"));
        }
        if self.detector.is_none() && self.timer.is_none() {
            return Err(invalid("must select a timer to gate the scalers"));
        }

        let mut points = range_len(self.start, self.stop, self.step);

        if self.scan_dim == ScanDim::TwoD {
            let (device2, start2, stop2, step2) = self.outer().ok_or_else(|| {
                invalid("2D scans need device2, start2, stop2 and step2")
            })?;
            if device2.trim().is_empty() {
                return Err(invalid("must select a second device for a 2D scan"));
            }
            if device2 == self.device {
                return Err(invalid("the two scan axes must be different devices"));
            }
            check_range("2", start2, stop2, step2)?;
            points = points.saturating_mul(range_len(start2, stop2, step2));
        }

        if points > MAX_SCAN_POINTS {
            return Err(invalid(&format!(
                "scan would produce {} points (limit {})",
                points, MAX_SCAN_POINTS
            )));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ScanError {
    ScanError::InvalidParams(msg.to_string())
}

fn signed(start: f64, stop: f64, step: f64) -> f64 {
    if stop < start {
        -step.abs()
    } else {
        step.abs()
    }
}

fn check_range(suffix: &str, start: f64, stop: f64, step: f64) -> ScanResult<()> {
    if !start.is_finite() || !stop.is_finite() {
        return Err(invalid(&format!(
            "start{suffix} and stop{suffix} must be finite"
        )));
    }
    if !step.is_finite() || (step == 0.0 && start != stop) {
        return Err(invalid(&format!("step{suffix} must be a non-zero number")));
    }
    Ok(())
}

/// Upper bound on the number of positions in one axis range
fn range_len(start: f64, stop: f64, step: f64) -> usize {
    if start == stop || step == 0.0 {
        return 1;
    }
    let n = ((stop - start).abs() / step.abs()).ceil();
    if n.is_finite() && n < usize::MAX as f64 {
        n as usize + 1
    } else {
        usize::MAX
    }
}
