//! Scan supervisor
//!
//! The supervisor is the only component that talks to the worker. It
//! validates requests, records where the scanned axes started, starts the
//! sweep and then polls the result channel on a fixed cadence. Every
//! message resets an idle timer; if the worker stays silent for longer than
//! the completion timeout the scan is declared failed.
//!
//! After the sentinel (or a failure) the worker is shut down and a fresh one
//! is spawned, and the axes are driven back to their initial positions.
//!
//! A [`ScanSession`] mutably borrows the supervisor, so manual moves and a
//! second scan cannot be requested while a sweep is in flight.

use crate::analysis::ingest::{spawn_direct, spawn_file_tail, IngestOutcome, Ingestion};
use crate::analysis::live::{AnalysisOptions, AnalysisSnapshot, LiveAnalysis, Sample};
use crate::config::AppConfig;
use crate::error::{ScanError, ScanResult};
use crate::hardware::{DetectorParams, DeviceInventory, DeviceProvider};
use crate::scan::abort::AbortFlag;
use crate::scan::log_file::LogLayout;
use crate::scan::params::ScanParams;
use crate::scan::protocol::{ResultMessage, ScanPoint, WorkerCommand};
use crate::scan::worker::WorkerHandle;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// One event observed while a scan runs
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A measured point
    Point(ScanPoint),
    /// The worker started writing a scan log
    LogFile(PathBuf),
    /// The sentinel arrived; the worker has been recycled
    Finished(ScanSummary),
}

/// How a scan ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    /// Sentinel arrived before every point was measured
    pub aborted: bool,
    /// Points received
    pub points: usize,
    /// Points the grid holds
    pub total: usize,
    /// Scan log, in file-tail mode
    pub log_file: Option<PathBuf>,
    /// Axes driven back to their initial position
    pub restored: Vec<(String, f64)>,
}

/// Everything a finished scan produced
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// How the scan ended
    pub summary: ScanSummary,
    /// Points in acquisition order
    pub points: Vec<ScanPoint>,
    /// Final analysis state
    pub snapshot: AnalysisSnapshot,
    /// Scan log headers (file-tail mode)
    pub headers: Vec<String>,
}

/// Owner of the scan worker
pub struct Supervisor {
    config: AppConfig,
    provider: Arc<dyn DeviceProvider>,
    db_path: String,
    worker: Option<WorkerHandle>,
    generation: u64,
    scan_active: bool,
    initial_positions: Vec<(String, f64)>,
}

impl Supervisor {
    /// Spawn a worker and open the device database at `db_path` in it
    pub async fn new(
        config: AppConfig,
        provider: Arc<dyn DeviceProvider>,
        db_path: &str,
    ) -> ScanResult<Self> {
        config.validate().map_err(ScanError::Configuration)?;
        let mut supervisor = Self {
            config,
            provider,
            db_path: db_path.to_string(),
            worker: None,
            generation: 0,
            scan_active: false,
            initial_positions: Vec::new(),
        };
        supervisor.worker = Some(supervisor.spawn_worker().await?);
        Ok(supervisor)
    }

    async fn spawn_worker(&mut self) -> ScanResult<WorkerHandle> {
        self.generation += 1;
        let handle = WorkerHandle::spawn(self.provider.clone(), &self.config, self.generation)?;
        let opened = tokio::time::timeout(
            self.config.supervisor.startup_timeout(),
            handle.request(WorkerCommand::start_mxdb(&self.db_path)),
        )
        .await;
        match opened {
            Ok(Ok(())) => {
                info!(generation = self.generation, db = %self.db_path, "scan worker ready");
                Ok(handle)
            }
            Ok(Err(e)) => {
                handle.shutdown(self.config.supervisor.startup_timeout()).await;
                Err(e)
            }
            Err(_) => {
                handle.abort_flag().set();
                handle.shutdown(self.config.supervisor.startup_timeout()).await;
                Err(ScanError::Timeout("start_mxdb".to_string()))
            }
        }
    }

    /// Shut the current worker down and spawn a fresh one
    async fn recycle_worker(&mut self) -> ScanResult<()> {
        if let Some(old) = self.worker.take() {
            old.shutdown(self.config.supervisor.startup_timeout()).await;
        }
        self.worker = Some(self.spawn_worker().await?);
        Ok(())
    }

    fn worker(&self) -> ScanResult<&WorkerHandle> {
        if self.scan_active {
            return Err(ScanError::WorkerBusy("a scan is running".to_string()));
        }
        self.worker.as_ref().ok_or(ScanError::WorkerGone)
    }

    fn worker_mut(&mut self) -> ScanResult<&mut WorkerHandle> {
        self.worker.as_mut().ok_or(ScanError::WorkerGone)
    }

    /// Configuration in use
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// How many workers have been spawned so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a scan was started and has not been settled
    pub fn is_scanning(&self) -> bool {
        self.scan_active
    }

    /// Device names per capability
    pub async fn devices(&self) -> ScanResult<DeviceInventory> {
        self.worker()?.request(WorkerCommand::get_devices()).await
    }

    /// Current position of an axis
    pub async fn get_position(&self, device: &str) -> ScanResult<f64> {
        self.worker()?
            .request(WorkerCommand::get_position(device))
            .await
    }

    /// Move an axis and wait for it to settle; returns the read-back
    /// position
    pub async fn move_to(&self, device: &str, value: f64) -> ScanResult<f64> {
        self.worker()?
            .request(WorkerCommand::move_abs(device, value))
            .await
    }

    /// Parameters of a detector
    pub async fn detector_params(&self, detector: &str) -> ScanResult<DetectorParams> {
        self.worker()?
            .request(WorkerCommand::get_det_params(Some(detector)))
            .await
    }

    /// Open every shutter; returns the read-back values
    pub async fn open_shutters(&self) -> ScanResult<Vec<(String, u32)>> {
        self.worker()?.request(WorkerCommand::open_shutters()).await
    }

    /// Close every shutter; returns the read-back values
    pub async fn close_shutters(&self) -> ScanResult<Vec<(String, u32)>> {
        self.worker()?.request(WorkerCommand::close_shutters()).await
    }

    /// Start a sweep.
    ///
    /// Validates `params`, discards stale results, records the initial
    /// positions of the scanned axes and hands the parameters to the worker.
    /// Returns once the worker has accepted the scan.
    pub async fn start_scan(&mut self, params: ScanParams) -> ScanResult<ScanSession<'_>> {
        if self.scan_active {
            return Err(ScanError::WorkerBusy("a scan is running".to_string()));
        }
        params.validate()?;

        let worker = self.worker_mut()?;
        let stale = worker.drain_results();
        if stale > 0 {
            debug!(stale, "discarded results left over from a previous scan");
        }

        let mut initial = vec![(
            params.device.clone(),
            worker.request(WorkerCommand::get_position(&params.device)).await?,
        )];
        if let Some((device2, ..)) = params.outer() {
            let position = worker.request(WorkerCommand::get_position(device2)).await?;
            initial.push((device2.to_string(), position));
        }

        worker
            .request(WorkerCommand::set_scan_params(params.clone()))
            .await?;
        let total = worker.request(WorkerCommand::scan()).await?;
        let abort = worker.abort_flag();

        info!(points = total, device = %params.device, "scan started");
        self.scan_active = true;
        self.initial_positions = initial;
        Ok(ScanSession {
            supervisor: self,
            params,
            total,
            received: 0,
            abort,
            last_activity: Instant::now(),
            log_file: None,
            finished: false,
        })
    }

    /// Start a sweep and run it to completion with live analysis
    pub async fn run_scan(
        &mut self,
        params: ScanParams,
        options: AnalysisOptions,
    ) -> ScanResult<ScanReport> {
        self.start_scan(params).await?.run_to_completion(options).await
    }

    /// Drive the axes of the last scan back to where they started.
    ///
    /// Best effort: axes that fail to move are logged and left out of the
    /// returned list.
    pub async fn restore_positions(&self) -> Vec<(String, f64)> {
        let worker = match self.worker() {
            Ok(worker) => worker,
            Err(e) => {
                warn!("cannot restore positions: {e}");
                return Vec::new();
            }
        };
        let mut restored = Vec::with_capacity(self.initial_positions.len());
        for (device, position) in &self.initial_positions {
            match worker
                .request(WorkerCommand::move_abs(device, *position))
                .await
            {
                Ok(reached) => {
                    debug!(device = %device, position = reached, "position restored");
                    restored.push((device.clone(), reached));
                }
                Err(e) => warn!(device = %device, "failed to restore position: {e}"),
            }
        }
        restored
    }

    /// Settle a scan whose session was dropped before the sentinel.
    ///
    /// The dropped session has already raised the abort flag; the worker is
    /// replaced without waiting for its sentinel.
    pub async fn recover(&mut self) -> ScanResult<Vec<(String, f64)>> {
        if !self.scan_active {
            return Ok(Vec::new());
        }
        warn!("recovering from an abandoned scan");
        if let Some(worker) = &self.worker {
            worker.abort_flag().set();
        }
        self.scan_active = false;
        self.recycle_worker().await?;
        Ok(self.restore_positions().await)
    }

    /// Stop the worker thread
    pub async fn shutdown(mut self) {
        if let Some(worker) = self.worker.take() {
            if self.scan_active {
                worker.abort_flag().set();
            }
            worker
                .shutdown(self.config.supervisor.startup_timeout())
                .await;
        }
        info!("supervisor shut down");
    }
}

/// A running sweep.
///
/// Dropping an unfinished session raises the abort flag; call
/// [`Supervisor::recover`] afterwards to get a usable worker back.
pub struct ScanSession<'a> {
    supervisor: &'a mut Supervisor,
    params: ScanParams,
    total: usize,
    received: usize,
    abort: AbortFlag,
    last_activity: Instant,
    log_file: Option<PathBuf>,
    finished: bool,
}

impl ScanSession<'_> {
    /// Points the grid holds
    pub fn total_points(&self) -> usize {
        self.total
    }

    /// Points received so far
    pub fn points_received(&self) -> usize {
        self.received
    }

    /// The request being executed
    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    /// Scan log being written, once announced
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// A clone of the abort flag, for aborting from another task
    pub fn abort_handle(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Request an abort; the worker stops at its next check and sends the
    /// sentinel
    pub fn abort(&self) {
        info!("scan abort requested");
        self.abort.set();
    }

    /// Wait for the next message from the worker.
    ///
    /// Polls the result channel every `poll_period`. Returns
    /// [`ScanError::Timeout`] if nothing arrives within the completion
    /// timeout; the worker has then been rebuilt.
    pub async fn next_event(&mut self) -> ScanResult<ScanEvent> {
        if self.finished {
            return Err(ScanError::InvalidParams(
                "scan session already finished".to_string(),
            ));
        }
        let timeout = self.supervisor.config.supervisor.completion_timeout();
        let mut ticker = tokio::time::interval(self.supervisor.config.supervisor.poll_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let polled = self.supervisor.worker_mut()?.try_recv();
            let message = match polled {
                Ok(message) => message,
                Err(TryRecvError::Empty) => {
                    if self.last_activity.elapsed() > timeout {
                        let err = ScanError::Timeout(format!(
                            "{} ({} of {} points received)",
                            ResultMessage::STOP_SENTINEL,
                            self.received,
                            self.total
                        ));
                        return Err(self.fail(err).await);
                    }
                    continue;
                }
                Err(TryRecvError::Disconnected) => {
                    return Err(self.fail(ScanError::WorkerGone).await);
                }
            };

            self.last_activity = Instant::now();
            match message {
                ResultMessage::Point(point) => {
                    self.received += 1;
                    return Ok(ScanEvent::Point(point));
                }
                ResultMessage::Filename(path) => {
                    info!(path = %path.display(), "scan log announced");
                    self.log_file = Some(path.clone());
                    return Ok(ScanEvent::LogFile(path));
                }
                ResultMessage::StopLivePlotting => {
                    return Ok(ScanEvent::Finished(self.complete().await?));
                }
            }
        }
    }

    async fn complete(&mut self) -> ScanResult<ScanSummary> {
        self.finished = true;
        let aborted = self.abort.is_set() || self.received < self.total;
        info!(points = self.received, total = self.total, aborted, "scan finished");

        self.supervisor.scan_active = false;
        self.supervisor.recycle_worker().await?;
        let restored = self.supervisor.restore_positions().await;
        Ok(ScanSummary {
            aborted,
            points: self.received,
            total: self.total,
            log_file: self.log_file.clone(),
            restored,
        })
    }

    async fn fail(&mut self, err: ScanError) -> ScanError {
        self.finished = true;
        error!(points = self.received, total = self.total, "scan failed: {err}");
        self.abort.set();
        self.supervisor.scan_active = false;
        match self.supervisor.recycle_worker().await {
            Ok(()) => {
                self.supervisor.restore_positions().await;
            }
            Err(e) => error!("failed to rebuild scan worker: {e}"),
        }
        err
    }

    /// Consume events until the sentinel, feeding live analysis.
    ///
    /// In direct mode every point goes straight to the analysis task. In
    /// file-tail mode the analysis task follows the scan log announced by
    /// the worker.
    pub async fn run_to_completion(mut self, options: AnalysisOptions) -> ScanResult<ScanReport> {
        let config = &self.supervisor.config;
        let poll = config.supervisor.poll_period();
        let startup_timeout = config.supervisor.startup_timeout();
        let file_tail = config.output.file_tail;
        let layout = LogLayout::for_params(&self.params);
        let two_d = self.params.outer().is_some();

        let (samples, sample_rx) = mpsc::unbounded_channel();
        let mut ingestion: Option<Ingestion> = if file_tail {
            drop(sample_rx);
            None
        } else {
            Some(spawn_direct(LiveAnalysis::new(options), sample_rx, poll))
        };

        let mut points = Vec::with_capacity(self.total);
        let summary = loop {
            let event = match self.next_event().await {
                Ok(event) => event,
                Err(e) => {
                    if let Some(ingestion) = ingestion {
                        ingestion.finish().await;
                    }
                    return Err(e);
                }
            };
            match event {
                ScanEvent::Point(point) => {
                    if !file_tail {
                        forward_sample(&samples, &point, two_d);
                    }
                    if let Some(ingestion) = &ingestion {
                        let (analyzed, stats) = ingestion.stats();
                        let fwhm = stats.fwhm.unwrap_or_default();
                        debug!(
                            point = point.index,
                            analyzed,
                            fwhm = fwhm.width,
                            fwhm_center = fwhm.center(),
                            com = stats.com,
                            "live statistics"
                        );
                    }
                    points.push(point);
                }
                ScanEvent::LogFile(path) => {
                    if file_tail && ingestion.is_none() {
                        ingestion = Some(spawn_file_tail(
                            path,
                            layout,
                            LiveAnalysis::new(options),
                            poll,
                            startup_timeout,
                        ));
                    }
                }
                ScanEvent::Finished(summary) => break summary,
            }
        };
        drop(samples);

        let outcome = match ingestion {
            Some(ingestion) => ingestion.finish().await,
            None => IngestOutcome {
                analysis: LiveAnalysis::new(options),
                headers: Vec::new(),
                samples: 0,
                error: None,
            },
        };
        if let Some(e) = &outcome.error {
            warn!("live analysis ended early: {e}");
        }

        Ok(ScanReport {
            summary,
            points,
            snapshot: outcome.analysis.snapshot(),
            headers: outcome.headers,
        })
    }
}

/// Hand a point to the direct ingestion task.
fn forward_sample(
    samples: &mpsc::UnboundedSender<Sample>,
    point: &ScanPoint,
    two_d: bool,
) -> bool {
    let sample = match point.position2 {
        Some(y) if two_d => Sample::map(point.position, y, point.intensity),
        _ => Sample::line(point.position, point.intensity),
    };
    if samples.send(sample).is_err() {
        debug!(point = point.index, "live analysis stopped, sample dropped");
        return false;
    }
    true
}

impl Drop for ScanSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("scan session dropped before the sentinel, aborting");
            self.abort.set();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedProvider;
    use tracing_test::traced_test;

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.timing.poll_interval_ms = 1;
        config.supervisor.poll_period_ms = 1;
        config.supervisor.completion_timeout_ms = 2000;
        config
    }

    async fn demo_supervisor() -> Supervisor {
        let provider = Arc::new(SimulatedProvider::new(Vec::new()));
        Supervisor::new(fast_config(), provider, "").await.unwrap()
    }

    fn line_scan() -> ScanParams {
        ScanParams::line("m1", 0.0, 2.0, 0.5)
            .with_timer("t1")
            .with_scalers(&["i0"])
            .with_dwell(0.001)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_worker_recycle_is_logged() {
        let mut supervisor = demo_supervisor().await;
        assert!(logs_contain("scan worker ready"));

        supervisor
            .run_scan(line_scan(), AnalysisOptions::default())
            .await
            .unwrap();
        assert!(logs_contain("scan finished"));
        assert_eq!(supervisor.generation(), 2);
        supervisor.shutdown().await;
    }

    #[test]
    #[traced_test]
    fn test_forward_sample_logs_when_ingestion_gone() {
        let point = ScanPoint {
            index: 3,
            position: 0.5,
            position2: Some(1.0),
            intensity: 7.0,
            raw: vec![7.0],
        };
        let (samples, mut rx) = mpsc::unbounded_channel();
        assert!(forward_sample(&samples, &point, true));
        assert_eq!(rx.try_recv().unwrap(), Sample::map(0.5, 1.0, 7.0));

        drop(rx);
        assert!(!forward_sample(&samples, &point, false));
        assert!(logs_contain("live analysis stopped, sample dropped"));
    }

    #[tokio::test]
    async fn test_invalid_params_rejected_before_worker() {
        let mut supervisor = demo_supervisor().await;
        let err = supervisor
            .start_scan(ScanParams::line("", 0.0, 1.0, 0.5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ScanError::InvalidParams(_)));
        assert!(!supervisor.is_scanning());
        assert_eq!(supervisor.generation(), 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_end_with_finished() {
        let mut supervisor = demo_supervisor().await;
        supervisor.move_to("m1", 0.75).await.unwrap();

        let mut session = supervisor.start_scan(line_scan()).await.unwrap();
        assert_eq!(session.total_points(), 5);
        let mut positions = Vec::new();
        let summary = loop {
            match session.next_event().await.unwrap() {
                ScanEvent::Point(p) => positions.push(p.position),
                ScanEvent::LogFile(_) => {}
                ScanEvent::Finished(summary) => break summary,
            }
        };
        drop(session);

        assert_eq!(positions, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert!(!summary.aborted);
        assert_eq!(summary.restored.len(), 1);
        assert!((supervisor.get_position("m1").await.unwrap() - 0.75).abs() < 1e-9);
        // One worker per scan.
        assert_eq!(supervisor.generation(), 2);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_session_blocks_until_recovered() {
        let mut supervisor = demo_supervisor().await;
        let session = supervisor.start_scan(line_scan()).await.unwrap();
        drop(session);

        let err = supervisor.move_to("m1", 1.0).await.unwrap_err();
        assert!(matches!(err, ScanError::WorkerBusy(_)));

        supervisor.recover().await.unwrap();
        assert!(!supervisor.is_scanning());
        supervisor.move_to("m1", 1.0).await.unwrap();
        supervisor.shutdown().await;
    }
}
