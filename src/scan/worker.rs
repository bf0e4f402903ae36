//! Scan worker
//!
//! The worker owns every hardware handle. It runs on a dedicated OS thread
//! with its own single-threaded runtime, receives [`WorkerCommand`]s in FIFO
//! order and answers each on the command's reply channel. A `scan` command
//! runs the whole sweep inside the command loop, pushing [`ResultMessage`]s
//! as points are measured.
//!
//! # Lifecycle
//!
//! A worker is single-use. After one sweep (completed, aborted or failed) the
//! supervisor shuts it down and spawns a fresh one; hardware does not reliably
//! accept further commands from the session that ran a sweep.
//!
//! # Failure handling
//!
//! Errors and panics are caught at the dispatch boundary and logged; the
//! loop keeps serving commands. A sweep that fails with a hardware error
//! emits no end-of-scan sentinel: the supervisor detects the silence with its
//! completion timeout and rebuilds the worker. An aborted sweep always emits
//! the sentinel.

use crate::config::{AppConfig, OutputConfig, TimingConfig};
use crate::error::{ScanError, ScanResult};
use crate::hardware::{Axis, BinaryOutput, DetectorParams, DeviceDatabase, DeviceProvider};
use crate::hardware::{Detector, DeviceInventory};
use crate::scan::abort::AbortFlag;
use crate::scan::log_file::{ratio, ScanLogWriter};
use crate::scan::params::ScanParams;
use crate::scan::protocol::{Reply, ResultMessage, ScanPoint, WorkerCommand};
use crate::scan::sequence::ScanGrid;
use crate::scan::state::WorkerState;
use crate::scan::trigger::{
    wait_for_axis, DetectorTrigger, Measurement, TriggerSynchronizer, WaitOutcome,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How a sweep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepOutcome {
    Completed,
    Aborted,
}

/// Devices resolved for one sweep
struct ScanPlan {
    params: ScanParams,
    grid: ScanGrid,
    inner: Arc<dyn Axis>,
    outer: Option<Arc<dyn Axis>>,
    sync: TriggerSynchronizer,
    shutters: Vec<(String, Arc<dyn BinaryOutput>)>,
}

/// Command-driven scan state machine
pub struct ScanWorker {
    provider: Arc<dyn DeviceProvider>,
    timing: TimingConfig,
    output: OutputConfig,
    abort: AbortFlag,
    results: mpsc::UnboundedSender<ResultMessage>,
    db: Option<DeviceDatabase>,
    params: Option<ScanParams>,
    detector: Option<Arc<dyn Detector>>,
    state: WorkerState,
}

impl ScanWorker {
    /// Create a worker that reports on `results` and observes `abort`
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        config: &AppConfig,
        abort: AbortFlag,
        results: mpsc::UnboundedSender<ResultMessage>,
    ) -> Self {
        Self {
            provider,
            timing: config.timing.clone(),
            output: config.output.clone(),
            abort,
            results,
            db: None,
            params: None,
            detector: None,
            state: WorkerState::Idle,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Serve commands until the command channel closes
    pub async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        info!("scan worker started");
        while let Some(command) = commands.recv().await {
            let name = command.name();
            let span = info_span!("command", name);
            let handled = AssertUnwindSafe(self.dispatch(command))
                .catch_unwind()
                .instrument(span)
                .await;
            if let Err(panic) = handled {
                error!(command = name, "command panicked: {}", panic_message(&panic));
            }
        }
        info!(state = %self.state, "command channel closed, scan worker exiting");
    }

    async fn dispatch(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::StartMxdb { path, reply } => {
                let result = self.start_mxdb(&path).await;
                respond("start_mxdb", reply, result);
            }
            WorkerCommand::SetScanParams { params, reply } => {
                let result = self.set_scan_params(*params);
                respond("set_scan_params", reply, result);
            }
            WorkerCommand::Scan { accepted } => self.scan(accepted).await,
            WorkerCommand::GetDevices { reply } => {
                let result = self.get_devices();
                respond("get_devices", reply, result);
            }
            WorkerCommand::GetPosition { device, reply } => {
                let result = self.get_position(&device).await;
                respond("get_position", reply, result);
            }
            WorkerCommand::GetPosition2 { device, reply } => {
                let result = match self.second_axis(device) {
                    Ok(device) => self.get_position(&device).await,
                    Err(e) => Err(e),
                };
                respond("get_position2", reply, result);
            }
            WorkerCommand::MoveAbs {
                device,
                value,
                reply,
            } => {
                let result = self.move_abs(&device, value).await;
                respond("move_abs", reply, result);
            }
            WorkerCommand::MoveAbs2 {
                device,
                value,
                reply,
            } => {
                let result = match self.second_axis(device) {
                    Ok(device) => self.move_abs(&device, value).await,
                    Err(e) => Err(e),
                };
                respond("move_abs2", reply, result);
            }
            WorkerCommand::GetDetParams { detector, reply } => {
                let result = self.get_det_params(detector.as_deref()).await;
                respond("get_det_params", reply, result);
            }
            WorkerCommand::OpenShutters { reply } => {
                let result = self.set_shutters(1).await;
                respond("open_shutters", reply, result);
            }
            WorkerCommand::CloseShutters { reply } => {
                let result = self.set_shutters(0).await;
                respond("close_shutters", reply, result);
            }
            WorkerCommand::AbortDet { name, reply } => {
                let result = self.abort_det(&name).await;
                match reply {
                    Some(reply) => respond("abort_det", reply, result),
                    None => {
                        if let Err(e) = result {
                            warn!(detector = %name, "detector abort failed: {e}");
                        }
                    }
                }
            }
        }
    }

    fn database(&self) -> ScanResult<&DeviceDatabase> {
        self.db.as_ref().ok_or(ScanError::DatabaseNotOpen)
    }

    async fn start_mxdb(&mut self, path: &str) -> ScanResult<()> {
        let db = self.provider.open(path).await?;
        let inventory = db.inventory();
        info!(
            path,
            axes = inventory.axes.len(),
            scalers = inventory.scalers.len(),
            detectors = inventory.detectors.len(),
            "device database opened"
        );
        self.db = Some(db);
        Ok(())
    }

    fn set_scan_params(&mut self, params: ScanParams) -> ScanResult<()> {
        if !self.state.can_set_params() {
            return Err(ScanError::WorkerBusy(format!("worker is {}", self.state)));
        }
        let db = self.database()?;
        params.validate()?;

        // Resolve every name now so a typo fails here, not mid-sweep.
        db.axis(&params.device)?;
        if let Some((device2, ..)) = params.outer() {
            db.axis(device2)?;
        }
        for scaler in &params.scalers {
            db.scaler(scaler)?;
        }
        if let Some(timer) = &params.timer {
            db.timer(timer)?;
        }
        let detector = match &params.detector {
            Some(name) => {
                db.trigger_hardware()?;
                Some(db.detector(name)?)
            }
            None => None,
        };

        info!(
            device = %params.device,
            dim = %params.scan_dim,
            start = params.start,
            stop = params.stop,
            step = params.step,
            "scan parameters set"
        );
        self.detector = detector;
        self.params = Some(params);
        self.state = WorkerState::ParamsSet;
        Ok(())
    }

    fn get_devices(&self) -> ScanResult<DeviceInventory> {
        Ok(self.database()?.inventory())
    }

    fn second_axis(&self, device: Option<String>) -> ScanResult<String> {
        device
            .or_else(|| self.params.as_ref().and_then(|p| p.device2.clone()))
            .ok_or_else(|| ScanError::InvalidParams("no second device selected".to_string()))
    }

    async fn get_position(&self, device: &str) -> ScanResult<f64> {
        let axis = self.database()?.axis(device)?;
        Ok(axis.get_position().await?)
    }

    async fn move_abs(&self, device: &str, value: f64) -> ScanResult<f64> {
        let axis = self.database()?.axis(device)?;
        check_limits(device, axis.limits(), value)?;
        axis.move_absolute(value).await?;
        if wait_for_axis(&axis, &self.abort, self.timing.poll_interval()).await?
            == WaitOutcome::Aborted
        {
            axis.stop().await?;
            return Err(ScanError::Aborted);
        }
        let position = axis.get_position().await?;
        debug!(device, position, "move complete");
        Ok(position)
    }

    async fn get_det_params(&self, detector: Option<&str>) -> ScanResult<DetectorParams> {
        let detector = match detector {
            Some(name) => self.database()?.detector(name)?,
            None => self.detector.clone().ok_or(ScanError::NoDetector)?,
        };
        Ok(detector.get_params().await?)
    }

    async fn set_shutters(&self, value: u32) -> ScanResult<Vec<(String, u32)>> {
        let shutters = self.database()?.shutters();
        write_outputs(&shutters, value).await
    }

    async fn abort_det(&self, name: &str) -> ScanResult<()> {
        let detector = match (name.is_empty(), &self.detector) {
            (true, Some(current)) => current.clone(),
            (true, None) => return Err(ScanError::NoDetector),
            (false, _) => self.database()?.detector(name)?,
        };
        detector.abort().await?;
        info!(detector = name, "detector aborted");
        Ok(())
    }

    fn prepare_scan(&self) -> ScanResult<ScanPlan> {
        if !self.state.can_scan() {
            return Err(ScanError::WorkerBusy(format!(
                "cannot scan while worker is {}",
                self.state
            )));
        }
        let db = self.database()?;
        let params = self
            .params
            .clone()
            .ok_or_else(|| ScanError::InvalidParams("no scan parameters set".to_string()))?;
        let grid = ScanGrid::from_params(&params)?;

        let inner = db.axis(&params.device)?;
        let outer = match params.outer() {
            Some((device2, ..)) => Some(db.axis(device2)?),
            None => None,
        };
        let scalers = params
            .scalers
            .iter()
            .map(|name| db.scaler(name))
            .collect::<ScanResult<Vec<_>>>()?;
        for &target in &grid.inner.positions {
            check_limits(&params.device, inner.limits(), target)?;
        }
        if let (Some(axis), Some(sweep), Some((device2, ..))) =
            (&outer, &grid.outer, params.outer())
        {
            for &target in &sweep.positions {
                check_limits(device2, axis.limits(), target)?;
            }
        }
        let timer = match &params.timer {
            Some(name) => Some(db.timer(name)?),
            None => None,
        };

        let mut sync = TriggerSynchronizer::new(
            timer,
            scalers,
            params.dwell_time,
            self.timing.clone(),
            self.abort.clone(),
        );
        if let Some(detector) = &self.detector {
            let (generator, line) = db.trigger_hardware()?;
            sync = sync.with_detector(DetectorTrigger {
                detector: detector.clone(),
                generator,
                line,
            });
        }

        Ok(ScanPlan {
            params,
            grid,
            inner,
            outer,
            sync,
            shutters: db.shutters(),
        })
    }

    async fn scan(&mut self, accepted: oneshot::Sender<ScanResult<usize>>) {
        let plan = match self.prepare_scan() {
            Ok(plan) => plan,
            Err(e) => {
                warn!("scan rejected: {e}");
                let _ = accepted.send(Err(e));
                return;
            }
        };

        let total = plan.grid.len();
        self.state = WorkerState::Running;
        if accepted.send(Ok(total)).is_err() {
            debug!("scan acknowledgement dropped by supervisor");
        }
        info!(points = total, device = %plan.params.device, "sweep started");

        let outcome = self.sweep(&plan).await;
        match outcome {
            Ok(SweepOutcome::Completed) => {
                if plan.params.open_shutter {
                    if let Err(e) = write_outputs(&plan.shutters, 0).await {
                        warn!("closing shutters failed: {e}");
                    }
                }
                self.state = WorkerState::Completed;
                info!(points = total, "sweep completed");
                self.emit(ResultMessage::StopLivePlotting);
            }
            Ok(SweepOutcome::Aborted) => {
                self.safe_state(&plan).await;
                self.state = WorkerState::Aborted;
                info!("sweep aborted");
                self.emit(ResultMessage::StopLivePlotting);
            }
            Err(e) => {
                // No sentinel: the supervisor times out and rebuilds the worker.
                error!("sweep failed: {e}");
                self.safe_state(&plan).await;
                self.state = WorkerState::Aborted;
            }
        }
    }

    async fn sweep(&self, plan: &ScanPlan) -> ScanResult<SweepOutcome> {
        let interval = self.timing.poll_interval();
        let mut log = if self.output.file_tail {
            let log = ScanLogWriter::create(&self.output.directory, &plan.params).await?;
            self.emit(ResultMessage::Filename(log.path().to_path_buf()));
            Some(log)
        } else {
            None
        };
        let stem = log
            .as_ref()
            .and_then(|l| l.path().file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scan".to_string());

        let inner_len = plan.grid.inner.positions.len();
        if plan.sync.has_detector() && !plan.grid.is_2d() {
            plan.sync.arm_detector(frames(inner_len)?, &stem).await?;
        }

        for point in plan.grid.points() {
            if self.abort.is_set() {
                return Ok(SweepOutcome::Aborted);
            }

            if let (Some(axis), Some(target), Some(row)) = (&plan.outer, point.outer, point.outer_index)
            {
                if point.inner_index == 0 {
                    let device2 = plan.params.device2.as_deref().unwrap_or_default();
                    if let Err(e) = check_limits(device2, axis.limits(), target) {
                        warn!("{e}, aborting sweep");
                        return Ok(SweepOutcome::Aborted);
                    }
                    axis.move_absolute(target).await?;
                    if wait_for_axis(axis, &self.abort, interval).await? == WaitOutcome::Aborted {
                        return Ok(SweepOutcome::Aborted);
                    }
                    if plan.sync.has_detector() {
                        let name = format!("{stem}_{row:04}");
                        plan.sync.arm_detector(frames(inner_len)?, &name).await?;
                    }
                }
            }

            if let Err(e) = check_limits(&plan.params.device, plan.inner.limits(), point.inner) {
                warn!("{e}, aborting sweep");
                return Ok(SweepOutcome::Aborted);
            }
            plan.inner.move_absolute(point.inner).await?;
            if wait_for_axis(&plan.inner, &self.abort, interval).await? == WaitOutcome::Aborted {
                return Ok(SweepOutcome::Aborted);
            }

            if point.index == 0 && plan.params.open_shutter {
                write_outputs(&plan.shutters, 1).await?;
                debug!("shutters opened");
            }

            let counts = match plan.sync.measure().await? {
                Measurement::Counts(counts) => counts,
                Measurement::Aborted => return Ok(SweepOutcome::Aborted),
            };
            let first = counts.first().copied().unwrap_or(0.0);
            let intensity = if plan.params.ratio {
                ratio(first, counts.get(1).copied().unwrap_or(0.0))
            } else {
                first
            };

            let result = ScanPoint {
                index: point.index,
                position: point.inner,
                position2: point.outer,
                intensity,
                raw: counts,
            };
            if let Some(log) = log.as_mut() {
                log.append(&result).await?;
            }
            debug!(point = point.index, position = point.inner, intensity, "point measured");
            self.emit(ResultMessage::Point(result));
        }
        Ok(SweepOutcome::Completed)
    }

    /// Stop everything the sweep may have left running.
    async fn safe_state(&self, plan: &ScanPlan) {
        plan.sync.abort_hardware().await;
        let axes = std::iter::once(&plan.inner).chain(plan.outer.as_ref());
        for axis in axes {
            if let Err(e) = axis.stop().await {
                warn!("axis stop failed: {e:#}");
            }
        }
        if plan.params.open_shutter {
            if let Err(e) = write_outputs(&plan.shutters, 0).await {
                warn!("closing shutters failed: {e}");
            }
        }
    }

    fn emit(&self, message: ResultMessage) {
        if self.results.send(message).is_err() {
            debug!("result channel closed, message dropped");
        }
    }
}

fn check_limits(device: &str, (low, high): (f64, f64), target: f64) -> ScanResult<()> {
    if target >= low && target <= high {
        Ok(())
    } else {
        Err(ScanError::LimitViolation {
            device: device.to_string(),
            target,
            low,
            high,
        })
    }
}

fn frames(count: usize) -> ScanResult<u32> {
    u32::try_from(count)
        .map_err(|_| ScanError::InvalidParams(format!("{count} frames exceed the detector limit")))
}

async fn write_outputs(
    outputs: &[(String, Arc<dyn BinaryOutput>)],
    value: u32,
) -> ScanResult<Vec<(String, u32)>> {
    let mut readback = Vec::with_capacity(outputs.len());
    for (name, output) in outputs {
        output.write(value).await?;
        readback.push((name.clone(), output.read().await?));
    }
    Ok(readback)
}

fn respond<T>(command: &str, reply: Reply<T>, result: ScanResult<T>) {
    if let Err(e) = &result {
        warn!(command, "command failed: {e}");
    }
    if reply.send(result).is_err() {
        debug!(command, "reply receiver dropped");
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Owned handle to a worker thread and its channels.
///
/// Single-use: [`WorkerHandle::shutdown`] consumes it.
pub struct WorkerHandle {
    generation: u64,
    commands: mpsc::Sender<WorkerCommand>,
    results: mpsc::UnboundedReceiver<ResultMessage>,
    abort: AbortFlag,
    thread: std::thread::JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker thread with fresh channels and a fresh abort flag
    pub fn spawn(
        provider: Arc<dyn DeviceProvider>,
        config: &AppConfig,
        generation: u64,
    ) -> ScanResult<Self> {
        let (commands, command_rx) = mpsc::channel(config.supervisor.channel_capacity.max(1));
        let (result_tx, results) = mpsc::unbounded_channel();
        let abort = AbortFlag::new();
        let worker = ScanWorker::new(provider, config, abort.clone(), result_tx);

        let thread = std::thread::Builder::new()
            .name(format!("scan-worker-{generation}"))
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(worker.run(command_rx)),
                    Err(e) => error!("failed to build worker runtime: {e}"),
                }
            })?;

        debug!(generation, "scan worker spawned");
        Ok(Self {
            generation,
            commands,
            results,
            abort,
            thread,
        })
    }

    /// Send a command built by one of the [`WorkerCommand`] helpers and await
    /// its reply
    pub async fn request<T>(
        &self,
        (command, reply): (WorkerCommand, oneshot::Receiver<ScanResult<T>>),
    ) -> ScanResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ScanError::WorkerGone)?;
        reply.await.map_err(|_| ScanError::WorkerGone)?
    }

    /// Queue a command without waiting for its reply
    pub async fn send(&self, command: WorkerCommand) -> ScanResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ScanError::WorkerGone)
    }

    /// Poll the result channel
    pub fn try_recv(&mut self) -> Result<ResultMessage, mpsc::error::TryRecvError> {
        self.results.try_recv()
    }

    /// Discard every queued result; returns how many were dropped
    pub fn drain_results(&mut self) -> usize {
        let mut dropped = 0;
        while self.results.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// The abort flag observed by this worker
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Spawn counter of this worker
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Close the channels and join the thread.
    ///
    /// Returns `false` if the thread did not exit within `join_timeout`; it
    /// is then left detached.
    pub async fn shutdown(self, join_timeout: Duration) -> bool {
        let WorkerHandle {
            generation,
            commands,
            results,
            thread,
            ..
        } = self;
        drop(commands);
        drop(results);

        let join = tokio::task::spawn_blocking(move || thread.join());
        match tokio::time::timeout(join_timeout, join).await {
            Ok(Ok(Ok(()))) => {
                debug!(generation, "scan worker joined");
                true
            }
            Ok(Ok(Err(_))) => {
                error!(generation, "scan worker thread panicked");
                true
            }
            Ok(Err(e)) => {
                error!(generation, "joining scan worker failed: {e}");
                false
            }
            Err(_) => {
                warn!(generation, ?join_timeout, "scan worker did not exit, detaching");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{DeviceDefinition, SimulatedBeamline, SimulatedProvider};

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.timing.poll_interval_ms = 1;
        config
    }

    fn spawn_demo() -> (WorkerHandle, SimulatedBeamline) {
        let beamline = SimulatedBeamline::build(&DeviceDefinition::demo_beamline()).unwrap();
        let provider = SimulatedProvider::with_beamline(beamline.clone());
        let handle = WorkerHandle::spawn(Arc::new(provider), &test_config(), 1).unwrap();
        (handle, beamline)
    }

    #[tokio::test]
    async fn test_commands_require_open_database() {
        let (worker, _) = spawn_demo();
        let err = worker
            .request(WorkerCommand::get_position("m1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::DatabaseNotOpen));

        worker.request(WorkerCommand::start_mxdb("")).await.unwrap();
        assert_eq!(worker.request(WorkerCommand::get_position("m1")).await.unwrap(), 0.0);
        assert!(worker.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_move_abs_reports_limit_violation() {
        let (worker, beamline) = spawn_demo();
        worker.request(WorkerCommand::start_mxdb("")).await.unwrap();

        let err = worker
            .request(WorkerCommand::move_abs("m1", 1e6))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::LimitViolation { .. }));
        assert_eq!(beamline.axes["m1"].move_count(), 0);

        let position = worker
            .request(WorkerCommand::move_abs("m1", 0.25))
            .await
            .unwrap();
        assert!((position - 0.25).abs() < 1e-9);
        worker.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_scan_past_soft_limit_is_rejected_before_moving() {
        let (worker, beamline) = spawn_demo();
        worker.request(WorkerCommand::start_mxdb("")).await.unwrap();

        let params = ScanParams::line("m1", 0.0, 1.0, 0.5)
            .with_outer("m2", 99.0, 101.0, 1.0)
            .with_timer("t1")
            .with_scalers(&["i0"]);
        worker
            .request(WorkerCommand::set_scan_params(params))
            .await
            .unwrap();
        let err = worker.request(WorkerCommand::scan()).await.unwrap_err();
        match err {
            ScanError::LimitViolation { device, target, .. } => {
                assert_eq!(device, "m2");
                assert_eq!(target, 101.0);
            }
            other => panic!("expected limit violation, got {other}"),
        }
        assert_eq!(beamline.axes["m1"].move_count(), 0);
        assert_eq!(beamline.axes["m2"].move_count(), 0);
        worker.shutdown(Duration::from_secs(5)).await;
    }

    #[test]
    fn test_check_limits_is_inclusive() {
        assert!(check_limits("m1", (-1.0, 1.0), 1.0).is_ok());
        assert!(check_limits("m1", (-1.0, 1.0), -1.0).is_ok());
        assert!(check_limits("m1", (-1.0, 1.0), 1.5).is_err());
        assert!(check_limits("m1", (-1.0, 1.0), f64::NAN).is_err());
    }

    #[tokio::test]
    async fn test_set_scan_params_resolves_devices() {
        let (worker, _) = spawn_demo();
        worker.request(WorkerCommand::start_mxdb("")).await.unwrap();

        let missing = ScanParams::line("nope", 0.0, 1.0, 0.5)
            .with_timer("t1")
            .with_scalers(&["i0"]);
        let err = worker
            .request(WorkerCommand::set_scan_params(missing))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::DeviceNotFound(_)));

        // Scan without parameters is rejected synchronously.
        let err = worker.request(WorkerCommand::scan()).await.unwrap_err();
        assert!(matches!(err, ScanError::WorkerBusy(_)));
        worker.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_second_axis_defaults_to_device2() {
        let (worker, _) = spawn_demo();
        worker.request(WorkerCommand::start_mxdb("")).await.unwrap();
        let err = worker
            .request(WorkerCommand::get_position2(None))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidParams(_)));

        let params = ScanParams::line("m1", 0.0, 1.0, 0.5)
            .with_outer("m2", -1.0, 1.0, 1.0)
            .with_timer("t1")
            .with_scalers(&["i0"]);
        worker
            .request(WorkerCommand::set_scan_params(params))
            .await
            .unwrap();
        let moved = worker
            .request(WorkerCommand::move_abs2(None, -0.5))
            .await
            .unwrap();
        assert!((moved + 0.5).abs() < 1e-9);
        worker.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_shutters_and_detector_queries() {
        let (worker, beamline) = spawn_demo();
        worker.request(WorkerCommand::start_mxdb("")).await.unwrap();

        let open = worker.request(WorkerCommand::open_shutters()).await.unwrap();
        assert_eq!(open, vec![("sh1".to_string(), 1)]);
        let closed = worker.request(WorkerCommand::close_shutters()).await.unwrap();
        assert_eq!(closed, vec![("sh1".to_string(), 0)]);

        let err = worker
            .request(WorkerCommand::get_det_params(None))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NoDetector));
        let params = worker
            .request(WorkerCommand::get_det_params(Some("det1")))
            .await
            .unwrap();
        assert_eq!(params.num_frames, 1);

        worker.request(WorkerCommand::abort_det("det1")).await.unwrap();
        assert_eq!(beamline.detectors["det1"].abort_count(), 1);
        worker.shutdown(Duration::from_secs(5)).await;
    }
}
