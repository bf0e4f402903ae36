//! CLI Entry Point for beamline-scan
//!
//! Provides command-line interface for:
//! - Running one 1D or 2D scan against the simulated device database
//! - Re-running live analysis over an existing scan log
//! - Walking an axis onto the intensity peak of a scaler
//!
//! # Usage
//!
//! Run a scan and save the results:
//! ```bash
//! beamline-scan scan --device m1 --start 0 --stop 2 --step 0.5 \
//!     --timer t1 --scaler i0 --dwell 0.1 --output results.csv
//! ```
//!
//! Analyze a scan log:
//! ```bash
//! beamline-scan analyze scans/scan_20240101_120000_abcd1234.txt --invert
//! ```
//!
//! Ctrl+C during a scan aborts it; the axes are still restored.

use anyhow::{anyhow, Context, Result};
use beamline_scan::analysis::{
    write_results, AnalysisOptions, AnalysisSnapshot, FitTarget, LiveAnalysis,
};
use beamline_scan::config::AppConfig;
use beamline_scan::feedback::PeakSearch;
use beamline_scan::hardware::{DeviceProvider, SimulatedProvider};
use beamline_scan::logging;
use beamline_scan::scan::trigger::TriggerSynchronizer;
use beamline_scan::scan::{AbortFlag, LogLayout, ScanParams, Supervisor};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "beamline-scan")]
#[command(about = "Beamline scan execution and live peak analysis", long_about = None)]
struct Cli {
    /// Configuration file (TOML); BEAMSCAN_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FitArg {
    None,
    Raw,
    Derivative,
}

impl From<FitArg> for FitTarget {
    fn from(arg: FitArg) -> Self {
        match arg {
            FitArg::None => FitTarget::None,
            FitArg::Raw => FitTarget::Raw,
            FitArg::Derivative => FitTarget::Derivative,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scan against the simulated device database
    Scan {
        /// Inner (fast) axis
        #[arg(long)]
        device: String,
        #[arg(long, allow_hyphen_values = true)]
        start: f64,
        #[arg(long, allow_hyphen_values = true)]
        stop: f64,
        #[arg(long)]
        step: f64,

        /// Outer (slow) axis for a 2D map
        #[arg(long, requires_all = ["start2", "stop2", "step2"])]
        device2: Option<String>,
        #[arg(long, allow_hyphen_values = true, requires_all = ["device2", "stop2", "step2"])]
        start2: Option<f64>,
        #[arg(long, allow_hyphen_values = true, requires_all = ["device2", "start2", "step2"])]
        stop2: Option<f64>,
        #[arg(long, requires_all = ["device2", "start2", "stop2"])]
        step2: Option<f64>,

        /// Timer gating the scalers
        #[arg(long)]
        timer: Option<String>,
        /// Scaler to read (repeat for ratio mode)
        #[arg(long = "scaler", required = true)]
        scalers: Vec<String>,
        /// Counting time per point (seconds)
        #[arg(long, default_value = "0.1")]
        dwell: f64,
        /// Externally triggered area detector
        #[arg(long)]
        detector: Option<String>,
        /// Intensity is scaler1 / scaler2
        #[arg(long)]
        ratio: bool,
        /// Open the shutters at the first point, close them at the end
        #[arg(long)]
        open_shutter: bool,

        /// Device database path (empty: configured devices)
        #[arg(long, default_value = "")]
        db: String,
        /// Write and tail a scan log instead of analyzing points directly
        #[arg(long)]
        file_tail: bool,
        /// Flip the derivative sign
        #[arg(long)]
        invert: bool,
        /// Series to fit with a Gaussian
        #[arg(long, value_enum, default_value = "none")]
        fit: FitArg,
        /// Results CSV
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run the analysis pipeline over an existing scan log
    Analyze {
        /// Scan log written in file-tail mode
        logfile: PathBuf,
        /// Results CSV
        #[arg(long)]
        output: Option<PathBuf>,
        /// Flip the derivative sign
        #[arg(long)]
        invert: bool,
        /// Series to fit with a Gaussian
        #[arg(long, value_enum, default_value = "none")]
        fit: FitArg,
    },

    /// Walk an axis onto the peak of a scaler reading
    Peak {
        #[arg(long)]
        device: String,
        #[arg(long)]
        scaler: String,
        #[arg(long)]
        timer: String,
        #[arg(long, default_value = "0.1")]
        dwell: f64,
        #[arg(long, default_value = "0.1")]
        step: f64,
        #[arg(long, default_value = "0.001")]
        min_step: f64,
        #[arg(long, default_value = "200")]
        max_iterations: usize,
        #[arg(long, default_value = "20")]
        max_reversals: usize,
        /// Device database path (empty: configured devices)
        #[arg(long, default_value = "")]
        db: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AppConfig::load().context("loading configuration")?,
    };
    config
        .validate()
        .map_err(|e| anyhow!("invalid configuration: {e}"))?;
    logging::init_from_config(&config).map_err(|e| anyhow!("logging setup failed: {e}"))?;

    match cli.command {
        Commands::Scan {
            device,
            start,
            stop,
            step,
            device2,
            start2,
            stop2,
            step2,
            timer,
            scalers,
            dwell,
            detector,
            ratio,
            open_shutter,
            db,
            file_tail,
            invert,
            fit,
            output,
        } => {
            let mut params = ScanParams::line(&device, start, stop, step)
                .with_dwell(dwell)
                .with_ratio(ratio)
                .with_open_shutter(open_shutter);
            params.scalers = scalers;
            if let Some(timer) = timer {
                params = params.with_timer(&timer);
            }
            if let Some(detector) = detector {
                params = params.with_detector(&detector);
            }
            if let (Some(device2), Some(start2), Some(stop2), Some(step2)) =
                (device2, start2, stop2, step2)
            {
                params = params.with_outer(&device2, start2, stop2, step2);
            }

            let mut config = config;
            config.output.file_tail |= file_tail;
            let options = AnalysisOptions {
                invert_derivative: invert,
                fit_target: fit.into(),
                ..Default::default()
            };
            let provider = Arc::new(SimulatedProvider::new(config.devices.clone()));
            run_scan(config, provider, &db, params, options, output).await
        }
        Commands::Analyze {
            logfile,
            output,
            invert,
            fit,
        } => {
            let options = AnalysisOptions {
                invert_derivative: invert,
                fit_target: fit.into(),
                ..Default::default()
            };
            analyze(&logfile, options, output).await
        }
        Commands::Peak {
            device,
            scaler,
            timer,
            dwell,
            step,
            min_step,
            max_iterations,
            max_reversals,
            db,
        } => {
            let search = PeakSearch {
                initial_step: step,
                min_step,
                max_iterations,
                max_reversals,
            };
            peak(config, &db, &device, &scaler, &timer, dwell, search).await
        }
    }
}

async fn run_scan(
    config: AppConfig,
    provider: Arc<dyn DeviceProvider>,
    db: &str,
    params: ScanParams,
    options: AnalysisOptions,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut supervisor = Supervisor::new(config, provider, db)
        .await
        .context("starting scan worker")?;
    let result = scan_and_report(&mut supervisor, params, options, output).await;
    supervisor.shutdown().await;
    result
}

async fn scan_and_report(
    supervisor: &mut Supervisor,
    params: ScanParams,
    options: AnalysisOptions,
    output: Option<PathBuf>,
) -> Result<()> {
    let session = supervisor
        .start_scan(params)
        .await
        .context("starting scan")?;
    info!(points = session.total_points(), "scan running, Ctrl+C to abort");

    let abort = session.abort_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting scan");
            abort.set();
        }
    });
    let report = session.run_to_completion(options).await;
    watcher.abort();
    let report = report.context("scan failed")?;

    if let Some(path) = &output {
        write_results(path, &report.snapshot, &report.headers)
            .await
            .with_context(|| format!("writing results to {}", path.display()))?;
        info!(path = %path.display(), "results saved");
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "summary": report.summary,
            "statistics": statistics(&report.snapshot),
        }))?
    );
    Ok(())
}

async fn analyze(logfile: &Path, options: AnalysisOptions, output: Option<PathBuf>) -> Result<()> {
    let text = tokio::fs::read_to_string(logfile)
        .await
        .with_context(|| format!("reading {}", logfile.display()))?;

    let headers: Vec<String> = text
        .lines()
        .filter(|line| line.starts_with('#'))
        .map(str::to_string)
        .collect();
    let layout = LogLayout::from_headers(&headers)
        .ok_or_else(|| anyhow!("{} has no '# columns:' header", logfile.display()))?;

    let mut analysis = LiveAnalysis::new(options);
    let mut skipped = 0;
    for line in text.lines().filter(|line| !line.starts_with('#')) {
        match layout.parse_line(line) {
            Some(sample) => analysis.push_sample(sample),
            None if line.trim().is_empty() => {}
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, "skipped malformed scan log lines");
    }
    let snapshot = analysis.snapshot();
    info!(samples = snapshot.len(), "scan log analyzed");

    if let Some(path) = &output {
        write_results(path, &snapshot, &headers)
            .await
            .with_context(|| format!("writing results to {}", path.display()))?;
    }
    println!("{}", serde_json::to_string_pretty(&statistics(&snapshot))?);
    Ok(())
}

async fn peak(
    config: AppConfig,
    db: &str,
    device: &str,
    scaler: &str,
    timer: &str,
    dwell: f64,
    search: PeakSearch,
) -> Result<()> {
    let provider = SimulatedProvider::new(config.devices.clone());
    let database = provider.open(db).await.context("opening device database")?;
    let axis = database.axis(device)?;
    let abort = AbortFlag::new();
    let sync = TriggerSynchronizer::new(
        Some(database.timer(timer)?),
        vec![database.scaler(scaler)?],
        dwell,
        config.timing.clone(),
        abort.clone(),
    );

    let flag = abort.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.set();
        }
    });
    let outcome = search
        .run(&axis, &sync, &abort, config.timing.poll_interval())
        .await;
    watcher.abort();

    println!("{}", serde_json::to_string_pretty(&outcome.context("peak search failed")?)?);
    Ok(())
}

fn statistics(snapshot: &AnalysisSnapshot) -> serde_json::Value {
    json!({
        "samples": snapshot.len(),
        "fwhm": snapshot.raw.fwhm,
        "com": snapshot.raw.com,
        "derivative": snapshot.derivative_stats,
        "fit": snapshot.fit.as_ref().and_then(|f| f.params),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamline_scan::hardware::{DeviceDefinition, SimulatedBeamline};
    use tracing_test::traced_test;

    fn line_scan() -> ScanParams {
        ScanParams::line("m1", 0.0, 2.0, 0.5)
            .with_timer("t1")
            .with_scalers(&["i0"])
            .with_dwell(0.001)
    }

    fn parse_scan(extra: &[&str]) -> Result<Cli, clap::Error> {
        let base = [
            "beamline-scan", "scan", "--device", "m1", "--start", "0", "--stop", "1",
            "--step", "0.5", "--scaler", "i0",
        ];
        Cli::try_parse_from(base.iter().chain(extra).copied())
    }

    #[test]
    fn test_partial_outer_axis_flags_are_rejected() {
        assert!(parse_scan(&["--device2", "m2", "--start2", "0"]).is_err());
        assert!(parse_scan(&["--step2", "0.5"]).is_err());
        assert!(parse_scan(&[
            "--device2", "m2", "--start2", "-1", "--stop2", "1", "--step2", "0.5",
        ])
        .is_ok());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_scan_still_shuts_down_worker() {
        let beamline = SimulatedBeamline::build(&DeviceDefinition::demo_beamline()).unwrap();
        beamline.scalers["i0"].set_failing(true);
        let provider = Arc::new(SimulatedProvider::with_beamline(beamline.clone()));

        let mut config = AppConfig::default();
        config.timing.poll_interval_ms = 1;
        config.supervisor.poll_period_ms = 1;
        config.supervisor.completion_timeout_ms = 200;

        let result = run_scan(
            config,
            provider,
            "",
            line_scan(),
            AnalysisOptions::default(),
            None,
        )
        .await;
        assert!(result.is_err());
        assert!(logs_contain("scan worker joined"));
        assert!(logs_contain("supervisor shut down"));
    }
}
