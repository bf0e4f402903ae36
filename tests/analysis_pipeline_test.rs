//! Live analysis fed from a scan log that is still being written.

use approx::assert_relative_eq;
use beamline_scan::analysis::{
    spawn_file_tail, write_results, AnalysisOptions, FitTarget, LiveAnalysis,
};
use beamline_scan::scan::{LogLayout, ScanLogWriter, ScanParams, ScanPoint};
use std::time::Duration;

const SIGMA: f64 = 0.2;

fn gaussian(x: f64) -> f64 {
    1000.0 * (-(x - 0.5).powi(2) / (2.0 * SIGMA * SIGMA)).exp()
}

#[tokio::test]
async fn test_tail_while_writing_then_export() {
    let dir = tempfile::tempdir().unwrap();
    let params = ScanParams::line("m1", -0.5, 1.5, 0.05)
        .with_timer("t1")
        .with_scalers(&["i0"]);
    let mut log = ScanLogWriter::create(dir.path(), &params).await.unwrap();

    let options = AnalysisOptions {
        fit_target: FitTarget::Raw,
        ..Default::default()
    };
    let ingestion = spawn_file_tail(
        log.path().to_path_buf(),
        LogLayout::for_params(&params),
        LiveAnalysis::new(options),
        Duration::from_millis(2),
        Duration::from_secs(2),
    );
    let mut updates = ingestion.subscribe();

    for i in 0..41 {
        let x = -0.5 + 0.05 * f64::from(i);
        let y = gaussian(x);
        log.append(&ScanPoint {
            index: i as usize,
            position: x,
            position2: None,
            intensity: y,
            raw: vec![y],
        })
        .await
        .unwrap();
        if i == 0 {
            updates.changed().await.unwrap();
            assert_eq!(updates.borrow().len(), 1);
        }
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    let outcome = ingestion.finish().await;
    assert!(outcome.error.is_none());
    assert_eq!(outcome.samples, 41);
    assert!(outcome.headers.iter().any(|h| h.starts_with("# scan_id: ")));

    let snapshot = outcome.analysis.snapshot();
    let fwhm = snapshot.raw.fwhm.expect("peak resolved");
    assert_relative_eq!(fwhm.width, 2.3548 * SIGMA, max_relative = 0.02);
    assert_relative_eq!(fwhm.center(), 0.5, epsilon = 0.01);
    assert_relative_eq!(snapshot.raw.com, 0.5, epsilon = 0.01);

    let fit = snapshot.fit.as_ref().and_then(|f| f.params).expect("fit converged");
    assert_relative_eq!(fit.center, 0.5, epsilon = 1e-3);
    assert_relative_eq!(fit.sigma.abs(), SIGMA, max_relative = 1e-3);

    let results = dir.path().join("results.csv");
    write_results(&results, &snapshot, &outcome.headers)
        .await
        .unwrap();
    let text = std::fs::read_to_string(&results).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("# scan_id: "));
    assert!(lines.iter().any(|l| l.starts_with("# FWHM center: ")));
    assert!(lines.iter().any(|l| l.starts_with("# Fit sigma: ")));
    let header = lines.iter().position(|l| *l == "x, y, derivative").unwrap();
    assert_eq!(lines.len() - header - 1, 41);
}

#[tokio::test]
async fn test_edge_scan_derivative_peak() {
    // A rising edge: the derivative peaks at the edge position.
    let mut live = LiveAnalysis::new(AnalysisOptions {
        fit_target: FitTarget::Derivative,
        ..Default::default()
    });
    for i in 0..61 {
        let x = f64::from(i) * 0.05;
        let y = 100.0 / (1.0 + (-(x - 1.5) / 0.1).exp());
        live.push_sample(beamline_scan::analysis::Sample::line(x, y));
    }
    let snapshot = live.snapshot();
    let stats = snapshot.derivative_stats.expect("derivative enabled");
    assert_relative_eq!(stats.fwhm.unwrap().center(), 1.5, epsilon = 0.02);
    let fit = snapshot.fit.unwrap().params.unwrap();
    assert_relative_eq!(fit.center, 1.5, epsilon = 0.01);

    // Inverting turns the edge into a trough; the derivative stats follow.
    live.set_invert_derivative(true);
    let inverted = live.snapshot();
    assert!(inverted.derivative.iter().all(|d| *d <= 1e-9));
}
