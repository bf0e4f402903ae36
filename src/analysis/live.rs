//! Live analysis state
//!
//! [`LiveAnalysis`] accumulates samples with [`LiveAnalysis::push_sample`] and
//! recomputes every derived quantity from scratch on each new sample. Readers
//! take an owned [`AnalysisSnapshot`] on their own schedule.

use crate::analysis::fit::{fit_gaussian, GaussianFit};
use crate::analysis::stats::{calc_com, calc_fwhm, gradient, Fwhm};
use serde::{Deserialize, Serialize};

/// One accumulated sample: `(x, y)` for 1D, `(x, y, z)` for 2D maps
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Inner axis position
    pub x: f64,
    /// Intensity (1D) or outer axis position (2D)
    pub y: f64,
    /// Intensity of a 2D map
    pub z: Option<f64>,
}

impl Sample {
    /// 1D sample
    pub fn line(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    /// 2D sample
    pub fn map(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }
}

/// Series the Gaussian fit runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitTarget {
    /// No fit
    #[default]
    None,
    /// Raw intensity
    Raw,
    /// Derivative series
    Derivative,
}

/// User toggles of the analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    /// Compute the derivative and its statistics
    pub derivative_enabled: bool,
    /// Flip the derivative sign (edge scans falling instead of rising)
    pub invert_derivative: bool,
    /// Which series to fit
    pub fit_target: FitTarget,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            derivative_enabled: true,
            invert_derivative: false,
            fit_target: FitTarget::None,
        }
    }
}

/// FWHM and COM of one series
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PeakStats {
    /// Last computed FWHM; kept while the series has too few samples
    pub fwhm: Option<Fwhm>,
    /// Center of mass
    pub com: f64,
}

/// Point-in-time copy of the analysis state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    /// Inner axis positions
    pub x: Vec<f64>,
    /// Intensities (1D) or outer positions (2D)
    pub y: Vec<f64>,
    /// Map intensities (2D only)
    pub z: Vec<f64>,
    /// Gradient of `y` over `x`, possibly sign-flipped (1D only)
    pub derivative: Vec<f64>,
    /// Statistics of the raw series
    pub raw: PeakStats,
    /// Statistics of the derivative, when enabled
    pub derivative_stats: Option<PeakStats>,
    /// Gaussian fit, when a target is selected
    pub fit: Option<GaussianFit>,
}

impl AnalysisSnapshot {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether no sample has arrived yet
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Whether this snapshot holds a 2D map
    pub fn is_map(&self) -> bool {
        !self.z.is_empty()
    }
}

/// Accumulated samples plus derived statistics
#[derive(Debug, Clone, Default)]
pub struct LiveAnalysis {
    options: AnalysisOptions,
    state: AnalysisSnapshot,
}

impl LiveAnalysis {
    /// Empty analysis with the given toggles
    pub fn new(options: AnalysisOptions) -> Self {
        Self {
            options,
            state: AnalysisSnapshot::default(),
        }
    }

    /// Current toggles
    pub fn options(&self) -> AnalysisOptions {
        self.options
    }

    /// Append one sample and recompute
    pub fn push_sample(&mut self, sample: Sample) {
        self.state.x.push(sample.x);
        self.state.y.push(sample.y);
        if let Some(z) = sample.z {
            self.state.z.push(z);
        }
        self.recompute();
    }

    /// Flip the derivative sign and recompute
    pub fn set_invert_derivative(&mut self, invert: bool) {
        self.options.invert_derivative = invert;
        self.recompute();
    }

    /// Change the fit target and recompute
    pub fn set_fit_target(&mut self, target: FitTarget) {
        self.options.fit_target = target;
        self.recompute();
    }

    /// Drop every sample and derived value
    pub fn clear(&mut self) {
        self.state = AnalysisSnapshot::default();
    }

    /// Owned copy of the current state
    pub fn snapshot(&self) -> AnalysisSnapshot {
        self.state.clone()
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Whether no sample has arrived yet
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    fn recompute(&mut self) {
        // Maps are accumulated for display only.
        if self.state.is_map() {
            return;
        }
        let state = &mut self.state;

        if state.x.len() >= 2 {
            let sign = if self.options.invert_derivative {
                -1.0
            } else {
                1.0
            };
            state.derivative = gradient(&state.x, &state.y)
                .into_iter()
                .map(|v| sign * v)
                .collect();
        } else {
            state.derivative = vec![0.0; state.x.len()];
        }

        update_stats(&mut state.raw, &state.x, &state.y);

        if self.options.derivative_enabled {
            let stats = state.derivative_stats.get_or_insert_with(PeakStats::default);
            update_stats(stats, &state.x, &state.derivative);
        } else {
            state.derivative_stats = None;
        }

        state.fit = match self.options.fit_target {
            FitTarget::None => None,
            FitTarget::Raw => Some(fit_gaussian(&state.x, &state.y)),
            FitTarget::Derivative => Some(fit_gaussian(&state.x, &state.derivative)),
        };
    }
}

fn update_stats(stats: &mut PeakStats, x: &[f64], y: &[f64]) {
    if let Some(fwhm) = calc_fwhm(x, y) {
        stats.fwhm = Some(fwhm);
    }
    stats.com = calc_com(x, y);
}
