//! Mock Hardware Implementations
//!
//! Simulated devices for running scans without a beamline. All mocks keep
//! their state behind `tokio::sync::RwLock` and derive busy flags from
//! wall-clock deadlines, so nothing ever sleeps inside a device call: the scan
//! worker's own polling loop is what observes motion and counting finish.
//!
//! # Available Mocks
//!
//! - `MockAxis` - motor with finite speed, settling time and soft limits
//! - `MockTimer` - counting gate
//! - `MockScaler` - counter whose rate follows a Gaussian beam profile
//! - `MockDetector` - externally triggered area detector
//! - `MockPulseGenerator` - four-channel burst source feeding the detector
//! - `MockBinaryOutput` - shutter or software trigger line
//!
//! Every mock counts the calls tests care about (stops, aborts, arms).

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::hardware::capabilities::{
    Axis, BinaryOutput, Detector, DetectorParams, PulseGenerator, PulseSetup, Scaler, Timer,
    TriggerMode, DETECTOR_STATUS_BUSY, PULSE_GENERATOR_STATUS_BUSY,
};

// =============================================================================
// MockAxis - Simulated Motor
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    started: Instant,
    travel: Duration,
    settle: Duration,
}

impl Motion {
    fn position_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started);
        if self.travel.is_zero() || elapsed >= self.travel {
            return self.to;
        }
        let fraction = elapsed.as_secs_f64() / self.travel.as_secs_f64();
        self.from + (self.to - self.from) * fraction
    }

    fn busy_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) < self.travel + self.settle
    }
}

/// Mock motor axis
///
/// Travel time is `distance / speed`; the axis stays busy for an extra
/// settling time after arriving. A speed of `f64::INFINITY` makes moves
/// instantaneous.
pub struct MockAxis {
    name: String,
    position: RwLock<f64>,
    motion: RwLock<Option<Motion>>,
    speed: f64,
    settle: Duration,
    limits: (f64, f64),
    moves: AtomicUsize,
    stops: AtomicUsize,
}

impl MockAxis {
    /// Create an instantaneous, unlimited axis at `position`
    pub fn new(name: &str, position: f64) -> Self {
        Self {
            name: name.to_string(),
            position: RwLock::new(position),
            motion: RwLock::new(None),
            speed: f64::INFINITY,
            settle: Duration::ZERO,
            limits: (f64::NEG_INFINITY, f64::INFINITY),
            moves: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// Set travel speed in units per second
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Set settling time after each move
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Set soft limits
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = (low, high);
        self
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of `move_absolute` calls accepted
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls received
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Position without going through the async trait (for scaler profiles)
    async fn current_position(&self) -> f64 {
        match *self.motion.read().await {
            Some(motion) => motion.position_at(Instant::now()),
            None => *self.position.read().await,
        }
    }
}

#[async_trait]
impl Axis for MockAxis {
    async fn move_absolute(&self, target: f64) -> Result<()> {
        let (low, high) = self.limits;
        if target < low || target > high {
            bail!(
                "{}: target {} outside limits [{}, {}]",
                self.name,
                target,
                low,
                high
            );
        }

        let from = self.current_position().await;
        let travel = if self.speed.is_finite() && self.speed > 0.0 {
            Duration::from_secs_f64((target - from).abs() / self.speed)
        } else {
            Duration::ZERO
        };

        debug!(axis = %self.name, from, target, ?travel, "mock axis move");
        *self.motion.write().await = Some(Motion {
            from,
            to: target,
            started: Instant::now(),
            travel,
            settle: self.settle,
        });
        *self.position.write().await = target;
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(self
            .motion
            .read()
            .await
            .map(|m| m.busy_at(Instant::now()))
            .unwrap_or(false))
    }

    async fn stop(&self) -> Result<()> {
        let here = self.current_position().await;
        *self.motion.write().await = None;
        *self.position.write().await = here;
        self.stops.fetch_add(1, Ordering::SeqCst);
        debug!(axis = %self.name, position = here, "mock axis stopped");
        Ok(())
    }

    async fn get_position(&self) -> Result<f64> {
        Ok(self.current_position().await)
    }

    fn limits(&self) -> (f64, f64) {
        self.limits
    }
}

// =============================================================================
// MockTimer - Simulated Counting Gate
// =============================================================================

/// Mock counting gate; busy for the requested duration after `start`.
#[derive(Default)]
pub struct MockTimer {
    busy_until: RwLock<Option<Instant>>,
    last_duration: RwLock<f64>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockTimer {
    /// Create an idle timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of gates started
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of early stops
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Duration of the most recent gate
    pub async fn last_duration(&self) -> f64 {
        *self.last_duration.read().await
    }
}

#[async_trait]
impl Timer for MockTimer {
    async fn clear(&self) -> Result<()> {
        *self.busy_until.write().await = None;
        Ok(())
    }

    async fn start(&self, seconds: f64) -> Result<()> {
        if !(seconds >= 0.0) || !seconds.is_finite() {
            bail!("invalid gate time {}", seconds);
        }
        *self.busy_until.write().await = Some(Instant::now() + Duration::from_secs_f64(seconds));
        *self.last_duration.write().await = seconds;
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(self
            .busy_until
            .read()
            .await
            .map(|t| Instant::now() < t)
            .unwrap_or(false))
    }

    async fn stop(&self) -> Result<()> {
        *self.busy_until.write().await = None;
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockScaler - Simulated Counter
// =============================================================================

/// Gaussian count-rate profile over one or two axes
#[derive(Clone)]
pub struct BeamProfile {
    /// Axis the peak is scanned along
    pub axis: Arc<MockAxis>,
    /// Peak center on `axis`
    pub center: f64,
    /// Peak sigma on `axis`
    pub sigma: f64,
    /// Optional second axis for 2D maps: `(axis, center, sigma)`
    pub axis2: Option<(Arc<MockAxis>, f64, f64)>,
    /// Peak count
    pub amplitude: f64,
    /// Flat background count
    pub background: f64,
}

impl BeamProfile {
    async fn counts(&self) -> f64 {
        let gauss = |x: f64, c: f64, s: f64| {
            if s > 0.0 {
                (-(x - c).powi(2) / (2.0 * s * s)).exp()
            } else {
                1.0
            }
        };

        let x = self.axis.current_position().await;
        let mut value = gauss(x, self.center, self.sigma);
        if let Some((axis2, c2, s2)) = &self.axis2 {
            value *= gauss(axis2.current_position().await, *c2, *s2);
        }
        self.background + self.amplitude * value
    }
}

/// Mock counter channel
///
/// Without a profile it reads a constant. Noise is uniform in
/// `[-noise/2, noise/2]` from a seeded generator so runs are reproducible.
pub struct MockScaler {
    constant: f64,
    profile: Option<BeamProfile>,
    noise: f64,
    rng: Mutex<StdRng>,
    failing: AtomicBool,
    clears: AtomicUsize,
    reads: AtomicUsize,
}

impl MockScaler {
    /// Scaler that always reads `constant`
    pub fn constant(constant: f64) -> Self {
        Self {
            constant,
            profile: None,
            noise: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            failing: AtomicBool::new(false),
            clears: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// Scaler following a beam profile
    pub fn with_profile(profile: BeamProfile) -> Self {
        Self {
            profile: Some(profile),
            ..Self::constant(0.0)
        }
    }

    /// Add uniform noise with a fixed seed
    pub fn with_noise(mut self, noise: f64, seed: u64) -> Self {
        self.noise = noise;
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Make subsequent reads fail (fault injection)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of reads served
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of clears received
    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scaler for MockScaler {
    async fn clear(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self) -> Result<f64> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("scaler readout failed");
        }
        let base = match &self.profile {
            Some(profile) => profile.counts().await,
            None => self.constant,
        };
        let jitter = if self.noise > 0.0 {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| anyhow!("scaler noise generator poisoned"))?;
            (rng.gen::<f64>() - 0.5) * self.noise
        } else {
            0.0
        };
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(base + jitter)
    }
}

// =============================================================================
// MockDetector - Simulated Area Detector
// =============================================================================

/// Mock externally triggered detector
///
/// Busy from `arm()` until it has taken `num_frames` frames or is aborted.
/// Frames are delivered by the pulse generator it is wired to.
pub struct MockDetector {
    params: RwLock<DetectorParams>,
    remaining: RwLock<u32>,
    frames: AtomicUsize,
    arms: AtomicUsize,
    aborts: AtomicUsize,
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDetector {
    /// Create an idle detector in internal trigger mode
    pub fn new() -> Self {
        Self {
            params: RwLock::new(DetectorParams {
                trigger_mode: TriggerMode::Internal,
                num_frames: 1,
                exposure_time: 0.1,
                exposure_period: 0.1,
                status: 0,
                filename: None,
            }),
            remaining: RwLock::new(0),
            frames: AtomicUsize::new(0),
            arms: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Deliver one external trigger
    pub async fn expose_frame(&self) {
        let mut remaining = self.remaining.write().await;
        if *remaining > 0 {
            *remaining -= 1;
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Total frames taken
    pub fn frame_count(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Number of arms
    pub fn arm_count(&self) -> usize {
        self.arms.load(Ordering::SeqCst)
    }

    /// Number of aborts
    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for MockDetector {
    async fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()> {
        self.params.write().await.trigger_mode = mode;
        Ok(())
    }

    async fn set_num_frames(&self, frames: u32) -> Result<()> {
        self.params.write().await.num_frames = frames;
        Ok(())
    }

    async fn set_exp_time(&self, seconds: f64) -> Result<()> {
        self.params.write().await.exposure_time = seconds;
        Ok(())
    }

    async fn set_exp_period(&self, seconds: f64) -> Result<()> {
        let mut params = self.params.write().await;
        if seconds < params.exposure_time {
            bail!(
                "frame period {} shorter than exposure {}",
                seconds,
                params.exposure_time
            );
        }
        params.exposure_period = seconds;
        Ok(())
    }

    async fn set_filename(&self, filename: &str) -> Result<()> {
        self.params.write().await.filename = Some(filename.to_string());
        Ok(())
    }

    async fn arm(&self) -> Result<()> {
        let frames = self.params.read().await.num_frames;
        *self.remaining.write().await = frames;
        self.arms.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        *self.remaining.write().await = 0;
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_status(&self) -> Result<u32> {
        if *self.remaining.read().await > 0 {
            Ok(DETECTOR_STATUS_BUSY)
        } else {
            Ok(0)
        }
    }

    async fn get_params(&self) -> Result<DetectorParams> {
        let mut params = self.params.read().await.clone();
        params.status = self.get_status().await?;
        Ok(params)
    }
}

// =============================================================================
// MockPulseGenerator - Simulated Burst Generator
// =============================================================================

/// Mock four-channel pulse generator
///
/// `arm()` readies a burst; the burst starts when [`MockPulseGenerator::fire`]
/// is called (normally by a trigger line). The generator stays busy for the
/// longest `delay + period * num_pulses` across configured channels and
/// exposes one detector frame per pulse.
pub struct MockPulseGenerator {
    channels: RwLock<Vec<Option<PulseSetup>>>,
    armed: RwLock<bool>,
    busy_until: RwLock<Option<Instant>>,
    detector: Option<Arc<MockDetector>>,
    bursts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockPulseGenerator {
    /// Number of channels on the simulated generator
    pub const CHANNELS: usize = 4;

    /// Create an unwired generator
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(vec![None; Self::CHANNELS]),
            armed: RwLock::new(false),
            busy_until: RwLock::new(None),
            detector: None,
            bursts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// Wire channel output to a detector's trigger input
    pub fn with_detector(mut self, detector: Arc<MockDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Start the armed burst (trigger edge)
    pub async fn fire(&self) {
        {
            let mut armed = self.armed.write().await;
            if !*armed {
                debug!("mock pulse generator: trigger edge while not armed, ignored");
                return;
            }
            *armed = false;
        }

        let channels = self.channels.read().await.clone();
        let burst = channels
            .iter()
            .flatten()
            .map(|c| c.delay + c.period * f64::from(c.num_pulses))
            .fold(0.0_f64, f64::max);
        let pulses = channels
            .iter()
            .flatten()
            .map(|c| c.num_pulses)
            .max()
            .unwrap_or(0);

        *self.busy_until.write().await = Some(Instant::now() + Duration::from_secs_f64(burst));
        self.bursts.fetch_add(1, Ordering::SeqCst);

        if let Some(detector) = &self.detector {
            for _ in 0..pulses {
                detector.expose_frame().await;
            }
        }
    }

    /// Configured setup of one channel
    pub async fn channel(&self, channel: usize) -> Option<PulseSetup> {
        self.channels.read().await.get(channel).copied().flatten()
    }

    /// Number of bursts fired
    pub fn burst_count(&self) -> usize {
        self.bursts.load(Ordering::SeqCst)
    }

    /// Number of stops received
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Default for MockPulseGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PulseGenerator for MockPulseGenerator {
    fn num_channels(&self) -> usize {
        Self::CHANNELS
    }

    async fn setup(&self, channel: usize, setup: PulseSetup) -> Result<()> {
        let mut channels = self.channels.write().await;
        let slot = channels
            .get_mut(channel)
            .ok_or_else(|| anyhow!("no pulse generator channel {}", channel))?;
        *slot = Some(setup);
        Ok(())
    }

    async fn arm(&self) -> Result<()> {
        *self.armed.write().await = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.armed.write().await = false;
        *self.busy_until.write().await = None;
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_status(&self) -> Result<u32> {
        let busy = self
            .busy_until
            .read()
            .await
            .map(|t| Instant::now() < t)
            .unwrap_or(false);
        Ok(if busy { PULSE_GENERATOR_STATUS_BUSY } else { 0 })
    }
}

// =============================================================================
// MockBinaryOutput - Simulated Shutter / Trigger Line
// =============================================================================

/// Mock binary output
///
/// When wired to a pulse generator, a rising edge fires the generator.
#[derive(Default)]
pub struct MockBinaryOutput {
    value: RwLock<u32>,
    generator: Option<Arc<MockPulseGenerator>>,
    writes: AtomicUsize,
}

impl MockBinaryOutput {
    /// Create an output reading 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire this line to a pulse generator's trigger input
    pub fn with_generator(mut self, generator: Arc<MockPulseGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Number of writes received
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BinaryOutput for MockBinaryOutput {
    async fn write(&self, value: u32) -> Result<()> {
        let previous = std::mem::replace(&mut *self.value.write().await, value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        if previous == 0 && value != 0 {
            if let Some(generator) = &self.generator {
                generator.fire().await;
            }
        }
        Ok(())
    }

    async fn read(&self) -> Result<u32> {
        Ok(*self.value.read().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_axis_travel_and_settle() {
        let axis = MockAxis::new("m1", 0.0)
            .with_speed(100.0)
            .with_settle(Duration::from_millis(20));

        axis.move_absolute(1.0).await.unwrap();
        assert!(axis.is_busy().await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!axis.is_busy().await.unwrap());
        assert_eq!(axis.get_position().await.unwrap(), 1.0);
        assert_eq!(axis.move_count(), 1);
    }

    #[tokio::test]
    async fn test_axis_stop_holds_intermediate_position() {
        let axis = MockAxis::new("m1", 0.0).with_speed(1.0);
        axis.move_absolute(10.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        axis.stop().await.unwrap();

        let here = axis.get_position().await.unwrap();
        assert!(here > 0.0 && here < 10.0, "stopped at {}", here);
        assert!(!axis.is_busy().await.unwrap());
        assert_eq!(axis.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_axis_rejects_moves_past_limits() {
        let axis = MockAxis::new("m1", 0.0).with_limits(-1.0, 1.0);
        assert!(axis.move_absolute(2.0).await.is_err());
        assert_eq!(axis.get_position().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_timer_gate() {
        let timer = MockTimer::new();
        timer.start(0.02).await.unwrap();
        assert!(timer.is_busy().await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!timer.is_busy().await.unwrap());
        assert_eq!(timer.last_duration().await, 0.02);
    }

    #[tokio::test]
    async fn test_scaler_follows_profile() {
        let axis = Arc::new(MockAxis::new("m1", 0.0));
        let scaler = MockScaler::with_profile(BeamProfile {
            axis: axis.clone(),
            center: 0.0,
            sigma: 1.0,
            axis2: None,
            amplitude: 100.0,
            background: 5.0,
        });

        assert_eq!(scaler.read().await.unwrap(), 105.0);
        axis.move_absolute(50.0).await.unwrap();
        assert!((scaler.read().await.unwrap() - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_scaler_fault_injection() {
        let scaler = MockScaler::constant(1.0);
        scaler.set_failing(true);
        assert!(scaler.read().await.is_err());
        scaler.set_failing(false);
        assert_eq!(scaler.read().await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_trigger_line_fires_armed_burst() {
        let detector = Arc::new(MockDetector::new());
        let generator = Arc::new(MockPulseGenerator::new().with_detector(detector.clone()));
        let line = MockBinaryOutput::new().with_generator(generator.clone());

        detector.set_num_frames(1).await.unwrap();
        detector.arm().await.unwrap();
        assert_eq!(detector.get_status().await.unwrap(), DETECTOR_STATUS_BUSY);

        generator
            .setup(
                1,
                PulseSetup {
                    width: 0.01,
                    delay: 0.0,
                    period: 0.02,
                    num_pulses: 1,
                },
            )
            .await
            .unwrap();

        // Not armed: edge ignored
        line.write(1).await.unwrap();
        line.write(0).await.unwrap();
        assert_eq!(generator.burst_count(), 0);

        generator.arm().await.unwrap();
        line.write(1).await.unwrap();
        line.write(0).await.unwrap();
        assert_eq!(generator.burst_count(), 1);
        assert_eq!(
            generator.get_status().await.unwrap(),
            PULSE_GENERATOR_STATUS_BUSY
        );
        assert_eq!(detector.frame_count(), 1);
        assert_eq!(detector.get_status().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(generator.get_status().await.unwrap(), 0);
    }
}
