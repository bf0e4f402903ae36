//! Trigger synchronizer
//!
//! Drives one measurement at one grid point to completion while staying
//! abortable at every blocking wait.
//!
//! Without a detector the timer gates the scalers: clear, start the timer for
//! the dwell time, poll `is_busy` until it clears.
//!
//! With a detector the detector is armed for external triggering before the
//! sweep, and every point fires one burst of the four-channel pulse generator
//! through the software trigger line:
//!
//! | Channel | Pulse |
//! |---|---|
//! | A | short calibration pulse priming the generator |
//! | B | detector exposure |
//! | C | scaler counting window |
//! | D | desynchronizing pulse, offset from B |
//!
//! The channel offsets come from [`BurstTiming`]. Identical channel timings
//! make the generator miss triggers.

use crate::config::{BurstTiming, TimingConfig};
use crate::hardware::capabilities::PULSE_GENERATOR_STATUS_BUSY;
use crate::hardware::{
    Axis, BinaryOutput, Detector, PulseGenerator, PulseSetup, Scaler, Timer, TriggerMode,
};
use crate::scan::abort::AbortFlag;
use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of an abort-checked wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The device went idle
    Ready,
    /// The abort flag was observed
    Aborted,
}

/// Result of one measurement
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    /// One read per scaler, in request order
    Counts(Vec<f64>),
    /// The abort flag was observed; nothing was read
    Aborted,
}

/// Poll `busy` every `interval` until it reports idle or `abort` is set.
///
/// The abort flag is checked before every poll, so no device access happens
/// after an abort has been observed.
pub async fn wait_until_idle<F, Fut>(
    abort: &AbortFlag,
    interval: Duration,
    mut busy: F,
) -> Result<WaitOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    loop {
        if abort.is_set() {
            return Ok(WaitOutcome::Aborted);
        }
        if !busy().await? {
            return Ok(WaitOutcome::Ready);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait for an axis to settle
pub async fn wait_for_axis(
    axis: &Arc<dyn Axis>,
    abort: &AbortFlag,
    interval: Duration,
) -> Result<WaitOutcome> {
    wait_until_idle(abort, interval, || axis.is_busy()).await
}

/// Channel settings for one burst
pub fn burst_channels(timing: &BurstTiming, dwell: f64, period: f64) -> [PulseSetup; 4] {
    [
        PulseSetup {
            width: timing.calibration_width,
            delay: 0.0,
            period,
            num_pulses: 1,
        },
        PulseSetup {
            width: dwell,
            delay: timing.exposure_delay,
            period,
            num_pulses: 1,
        },
        PulseSetup {
            width: dwell,
            delay: timing.counting_delay,
            period,
            num_pulses: 1,
        },
        PulseSetup {
            width: dwell,
            delay: timing.exposure_delay + timing.desync_offset,
            period,
            num_pulses: 1,
        },
    ]
}

/// Detector and the hardware that triggers it
#[derive(Clone)]
pub struct DetectorTrigger {
    /// Externally triggered detector
    pub detector: Arc<dyn Detector>,
    /// Four-channel burst generator
    pub generator: Arc<dyn PulseGenerator>,
    /// Software trigger line kicking off each burst
    pub line: Arc<dyn BinaryOutput>,
}

/// Coordinates counting and detector exposure for one point
pub struct TriggerSynchronizer {
    timer: Option<Arc<dyn Timer>>,
    scalers: Vec<Arc<dyn Scaler>>,
    detector: Option<DetectorTrigger>,
    dwell: f64,
    timing: TimingConfig,
    abort: AbortFlag,
}

impl TriggerSynchronizer {
    /// Timer-gated counting
    pub fn new(
        timer: Option<Arc<dyn Timer>>,
        scalers: Vec<Arc<dyn Scaler>>,
        dwell: f64,
        timing: TimingConfig,
        abort: AbortFlag,
    ) -> Self {
        Self {
            timer,
            scalers,
            detector: None,
            dwell,
            timing,
            abort,
        }
    }

    /// Burst-triggered counting with a detector
    pub fn with_detector(mut self, trigger: DetectorTrigger) -> Self {
        self.detector = Some(trigger);
        self
    }

    /// Whether a detector is attached
    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    /// Detector frame period: dwell time plus the configured epsilon
    pub fn frame_period(&self) -> f64 {
        self.dwell + self.timing.period_epsilon
    }

    /// Arm the detector for `frames` externally triggered frames and load the
    /// burst timing into the pulse generator.
    ///
    /// Called once before a 1D sweep and once per outer point of a 2D map.
    pub async fn arm_detector(&self, frames: u32, filename: &str) -> Result<()> {
        let Some(trigger) = &self.detector else {
            return Ok(());
        };
        let period = self.frame_period();
        let detector = &trigger.detector;
        detector.set_trigger_mode(TriggerMode::External).await?;
        detector.set_num_frames(frames).await?;
        detector.set_exp_time(self.dwell).await?;
        detector.set_exp_period(period).await?;
        detector.set_filename(filename).await?;
        detector.arm().await?;

        let generator = &trigger.generator;
        if generator.num_channels() < 4 {
            return Err(anyhow!(
                "pulse generator has {} channels, 4 are needed",
                generator.num_channels()
            ));
        }
        for (channel, setup) in burst_channels(&self.timing.burst, self.dwell, period)
            .into_iter()
            .enumerate()
        {
            generator.setup(channel, setup).await?;
        }
        debug!(frames, period, filename, "detector armed");
        Ok(())
    }

    /// Take one measurement.
    ///
    /// On abort the counting hardware is stopped and nothing is read.
    pub async fn measure(&self) -> Result<Measurement> {
        for scaler in &self.scalers {
            scaler.clear().await?;
        }

        let outcome = match &self.detector {
            Some(trigger) => self.fire_burst(trigger).await?,
            None => self.count_with_timer().await?,
        };

        if outcome == WaitOutcome::Aborted {
            self.abort_hardware().await;
            return Ok(Measurement::Aborted);
        }

        let mut counts = Vec::with_capacity(self.scalers.len());
        for scaler in &self.scalers {
            counts.push(scaler.read().await?);
        }
        Ok(Measurement::Counts(counts))
    }

    async fn count_with_timer(&self) -> Result<WaitOutcome> {
        let timer = self
            .timer
            .as_ref()
            .ok_or_else(|| anyhow!("no timer selected to gate the scalers"))?;
        timer.clear().await?;
        timer.start(self.dwell).await?;
        wait_until_idle(&self.abort, self.timing.poll_interval(), || timer.is_busy()).await
    }

    async fn fire_burst(&self, trigger: &DetectorTrigger) -> Result<WaitOutcome> {
        if self.abort.is_set() {
            return Ok(WaitOutcome::Aborted);
        }
        trigger.generator.arm().await?;
        trigger.line.write(1).await?;
        trigger.line.write(0).await?;
        let generator = &trigger.generator;
        wait_until_idle(&self.abort, self.timing.poll_interval(), || async move {
            let status = generator.get_status().await?;
            Ok::<_, anyhow::Error>(status & PULSE_GENERATOR_STATUS_BUSY != 0)
        })
        .await
    }

    /// Best-effort stop of everything this synchronizer drives
    pub async fn abort_hardware(&self) {
        if let Some(trigger) = &self.detector {
            if let Err(e) = trigger.detector.abort().await {
                warn!("detector abort failed: {e:#}");
            }
            if let Err(e) = trigger.generator.stop().await {
                warn!("pulse generator stop failed: {e:#}");
            }
        }
        if let Some(timer) = &self.timer {
            if let Err(e) = timer.stop().await {
                warn!("timer stop failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{
        MockBinaryOutput, MockDetector, MockPulseGenerator, MockScaler, MockTimer,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn timing() -> TimingConfig {
        TimingConfig {
            poll_interval_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_wait_observes_abort_before_polling() {
        let abort = AbortFlag::new();
        abort.set();
        let polls = AtomicUsize::new(0);
        let outcome = wait_until_idle(&abort, Duration::from_millis(1), || async {
            polls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Aborted);
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_returns_when_idle() {
        let abort = AbortFlag::new();
        let polls = AtomicUsize::new(0);
        let outcome = wait_until_idle(&abort, Duration::from_millis(1), || async {
            Ok(polls.fetch_add(1, Ordering::SeqCst) < 3)
        })
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timer_gated_measurement() {
        let timer = Arc::new(MockTimer::new());
        let scaler = Arc::new(MockScaler::constant(42.0));
        let sync = TriggerSynchronizer::new(
            Some(timer.clone()),
            vec![scaler.clone()],
            0.01,
            timing(),
            AbortFlag::new(),
        );
        let m = sync.measure().await.unwrap();
        assert_eq!(m, Measurement::Counts(vec![42.0]));
        assert_eq!(timer.start_count(), 1);
        assert_eq!(timer.last_duration().await, 0.01);
        assert_eq!(scaler.clear_count(), 1);
    }

    #[tokio::test]
    async fn test_abort_stops_timer_without_reading() {
        let timer = Arc::new(MockTimer::new());
        let scaler = Arc::new(MockScaler::constant(1.0));
        let abort = AbortFlag::new();
        let sync = TriggerSynchronizer::new(
            Some(timer.clone()),
            vec![scaler.clone()],
            5.0,
            timing(),
            abort.clone(),
        );
        let flag = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.set();
        });
        assert_eq!(sync.measure().await.unwrap(), Measurement::Aborted);
        assert_eq!(timer.stop_count(), 1);
        assert_eq!(scaler.read_count(), 0);
    }

    #[tokio::test]
    async fn test_burst_triggers_one_frame_per_point() {
        let detector = Arc::new(MockDetector::new());
        let generator = Arc::new(MockPulseGenerator::new().with_detector(detector.clone()));
        let line = Arc::new(MockBinaryOutput::new().with_generator(generator.clone()));
        let scaler = Arc::new(MockScaler::constant(7.0));
        let sync = TriggerSynchronizer::new(None, vec![scaler], 0.005, timing(), AbortFlag::new())
            .with_detector(DetectorTrigger {
                detector: detector.clone(),
                generator: generator.clone(),
                line,
            });

        sync.arm_detector(3, "scan_0001").await.unwrap();
        let params = detector.get_params().await.unwrap();
        assert_eq!(params.trigger_mode, TriggerMode::External);
        assert_eq!(params.num_frames, 3);
        assert!((params.exposure_period - (0.005 + 1e-4)).abs() < 1e-12);

        for _ in 0..3 {
            assert_eq!(sync.measure().await.unwrap(), Measurement::Counts(vec![7.0]));
        }
        assert_eq!(generator.burst_count(), 3);
        assert_eq!(detector.frame_count(), 3);
    }

    #[test]
    fn test_burst_channels_are_distinct() {
        let timing = BurstTiming::default();
        let channels = burst_channels(&timing, 0.1, 0.1001);
        assert_eq!(channels[0].width, timing.calibration_width);
        let delays: Vec<f64> = channels.iter().map(|c| c.delay).collect();
        for (i, a) in delays.iter().enumerate() {
            for b in &delays[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(channels.iter().all(|c| c.period == 0.1001));
    }
}
