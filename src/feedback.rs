//! Intensity-feedback peak search
//!
//! Walks an axis toward the maximum of a scaler reading: keep stepping in the
//! current direction while the intensity rises; on a drop, reverse and halve
//! the step. The loop is bounded three ways (minimum step, reversal count,
//! iteration count) and checks the abort flag before every move.
//!
//! When the search ends the axis is left at the best position seen.

use crate::error::{ScanError, ScanResult};
use crate::hardware::Axis;
use crate::scan::abort::AbortFlag;
use crate::scan::trigger::{wait_for_axis, Measurement, TriggerSynchronizer, WaitOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Search bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakSearch {
    /// First step size (axis units)
    pub initial_step: f64,
    /// Stop once the step falls below this
    pub min_step: f64,
    /// Hard cap on moves
    pub max_iterations: usize,
    /// Hard cap on direction changes
    pub max_reversals: usize,
}

impl Default for PeakSearch {
    fn default() -> Self {
        Self {
            initial_step: 0.1,
            min_step: 0.001,
            max_iterations: 200,
            max_reversals: 20,
        }
    }
}

/// Where the search ended
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakSearchOutcome {
    /// Best position seen
    pub position: f64,
    /// Intensity at `position`
    pub intensity: f64,
    /// Moves made
    pub iterations: usize,
    /// Stopped on step size or reversals rather than the iteration cap
    pub converged: bool,
}

impl PeakSearch {
    fn check(&self) -> ScanResult<()> {
        if !(self.initial_step.is_finite() && self.initial_step > 0.0) {
            return Err(ScanError::InvalidParams(
                "initial step must be positive".to_string(),
            ));
        }
        if !(self.min_step.is_finite() && self.min_step > 0.0) {
            return Err(ScanError::InvalidParams(
                "minimum step must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Run the search on `axis`, reading intensity through `sync`.
    ///
    /// The first configured scaler is the feedback signal.
    pub async fn run(
        &self,
        axis: &Arc<dyn Axis>,
        sync: &TriggerSynchronizer,
        abort: &AbortFlag,
        interval: Duration,
    ) -> ScanResult<PeakSearchOutcome> {
        self.check()?;
        let (low, high) = axis.limits();

        let mut position = axis.get_position().await?;
        let mut best = read_intensity(sync).await?;
        let mut step = self.initial_step;
        let mut direction = 1.0;
        let mut reversals = 0;
        let mut iterations = 0;

        let converged = loop {
            if step < self.min_step || reversals >= self.max_reversals {
                break true;
            }
            if iterations >= self.max_iterations {
                break false;
            }
            if abort.is_set() {
                return Err(ScanError::Aborted);
            }
            iterations += 1;

            let target = position + direction * step;
            if target < low || target > high {
                direction = -direction;
                step /= 2.0;
                reversals += 1;
                continue;
            }

            move_and_wait(axis, target, abort, interval).await?;
            let intensity = read_intensity(sync).await?;
            debug!(iteration = iterations, position = target, intensity, step, "feedback step");

            if intensity > best {
                position = target;
                best = intensity;
            } else {
                direction = -direction;
                step /= 2.0;
                reversals += 1;
            }
        };

        move_and_wait(axis, position, abort, interval).await?;
        info!(position, intensity = best, iterations, converged, "peak search finished");
        Ok(PeakSearchOutcome {
            position,
            intensity: best,
            iterations,
            converged,
        })
    }
}

async fn move_and_wait(
    axis: &Arc<dyn Axis>,
    target: f64,
    abort: &AbortFlag,
    interval: Duration,
) -> ScanResult<()> {
    axis.move_absolute(target).await?;
    match wait_for_axis(axis, abort, interval).await? {
        WaitOutcome::Ready => Ok(()),
        WaitOutcome::Aborted => {
            axis.stop().await?;
            Err(ScanError::Aborted)
        }
    }
}

async fn read_intensity(sync: &TriggerSynchronizer) -> ScanResult<f64> {
    match sync.measure().await? {
        Measurement::Counts(counts) => counts
            .first()
            .copied()
            .ok_or_else(|| ScanError::InvalidParams("must select a scaler".to_string())),
        Measurement::Aborted => Err(ScanError::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::hardware::{DeviceDefinition, SimulatedBeamline};
    use approx::assert_abs_diff_eq;

    fn demo() -> (Arc<dyn Axis>, TriggerSynchronizer, AbortFlag) {
        let beamline = SimulatedBeamline::build(&DeviceDefinition::demo_beamline()).unwrap();
        let db = beamline.database();
        let abort = AbortFlag::new();
        let sync = TriggerSynchronizer::new(
            Some(db.timer("t1").unwrap()),
            vec![db.scaler("i0").unwrap()],
            0.001,
            TimingConfig::default(),
            abort.clone(),
        );
        (db.axis("m1").unwrap(), sync, abort)
    }

    #[tokio::test]
    async fn test_climbs_to_profile_peak() {
        let (axis, sync, abort) = demo();
        let search = PeakSearch {
            initial_step: 0.4,
            min_step: 0.005,
            ..Default::default()
        };
        let outcome = search
            .run(&axis, &sync, &abort, Duration::from_millis(1))
            .await
            .unwrap();

        assert!(outcome.converged);
        assert_abs_diff_eq!(outcome.position, 1.0, epsilon = 0.02);
        assert_abs_diff_eq!(axis.get_position().await.unwrap(), outcome.position, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_iteration_cap_is_not_convergence() {
        let (axis, sync, abort) = demo();
        let search = PeakSearch {
            initial_step: 0.01,
            min_step: 0.001,
            max_iterations: 3,
            max_reversals: 20,
        };
        let outcome = search
            .run(&axis, &sync, &abort, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn test_abort_stops_search() {
        let (axis, sync, abort) = demo();
        abort.set();
        let err = PeakSearch::default()
            .run(&axis, &sync, &abort, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Aborted));
    }

    #[tokio::test]
    async fn test_rejects_non_positive_steps() {
        let (axis, sync, abort) = demo();
        let search = PeakSearch {
            initial_step: 0.0,
            ..Default::default()
        };
        assert!(search
            .run(&axis, &sync, &abort, Duration::from_millis(1))
            .await
            .is_err());
    }
}
