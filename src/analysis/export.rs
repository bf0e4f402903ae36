//! Saved results file
//!
//! Writes the scan log headers verbatim, a `#` preamble with the peak
//! statistics of the raw and derivative series, then one `", "`-separated row
//! per sample.

use crate::analysis::fit::{GaussianFit, FIT_EQUATION};
use crate::analysis::live::{AnalysisSnapshot, PeakStats};
use crate::error::{ScanError, ScanResult};
use std::io::Write;
use std::path::Path;

/// Render the results file
pub fn render_results(snapshot: &AnalysisSnapshot, headers: &[String]) -> ScanResult<String> {
    let mut out = Vec::new();
    for header in headers {
        writeln!(out, "{header}")?;
    }

    if !snapshot.is_map() {
        stats_block(&mut out, "", &snapshot.raw)?;
        if let Some(stats) = &snapshot.derivative_stats {
            stats_block(&mut out, "Derivative ", stats)?;
        }
        if let Some(fit) = &snapshot.fit {
            fit_block(&mut out, fit)?;
        }
    }

    let mut writer = csv::Writer::from_writer(out);
    if snapshot.is_map() {
        write_row(&mut writer, &["x", "y", "z"])?;
        for ((x, y), z) in snapshot.x.iter().zip(&snapshot.y).zip(&snapshot.z) {
            write_row(&mut writer, &[x.to_string(), y.to_string(), z.to_string()])?;
        }
    } else if snapshot.derivative.len() == snapshot.x.len() && !snapshot.x.is_empty() {
        write_row(&mut writer, &["x", "y", "derivative"])?;
        for ((x, y), d) in snapshot.x.iter().zip(&snapshot.y).zip(&snapshot.derivative) {
            write_row(&mut writer, &[x.to_string(), y.to_string(), d.to_string()])?;
        }
    } else {
        write_row(&mut writer, &["x", "y"])?;
        for (x, y) in snapshot.x.iter().zip(&snapshot.y) {
            write_row(&mut writer, &[x.to_string(), y.to_string()])?;
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ScanError::Storage(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ScanError::Storage(e.to_string()))
}

/// One row with `", "` between fields; the padding keeps the csv writer's
/// single-byte delimiter.
fn write_row<S: AsRef<str>>(
    writer: &mut csv::Writer<Vec<u8>>,
    fields: &[S],
) -> ScanResult<()> {
    let padded = fields.iter().enumerate().map(|(i, field)| {
        if i == 0 {
            field.as_ref().to_string()
        } else {
            format!(" {}", field.as_ref())
        }
    });
    writer
        .write_record(padded)
        .map_err(|e| ScanError::Storage(e.to_string()))
}

fn stats_block(out: &mut Vec<u8>, label: &str, stats: &PeakStats) -> ScanResult<()> {
    let fwhm = stats.fwhm.unwrap_or_default();
    writeln!(out, "# {label}FWHM: {}", fwhm.width)?;
    writeln!(out, "# {label}FWHM center: {}", fwhm.center())?;
    writeln!(out, "# {label}COM: {}", stats.com)?;
    Ok(())
}

fn fit_block(out: &mut Vec<u8>, fit: &GaussianFit) -> ScanResult<()> {
    if let Some(params) = &fit.params {
        writeln!(out, "# Fit equation: {FIT_EQUATION}")?;
        writeln!(out, "# Fit amplitude: {}", params.amplitude)?;
        writeln!(out, "# Fit center: {}", params.center)?;
        writeln!(out, "# Fit sigma: {}", params.sigma)?;
    }
    Ok(())
}

/// Write the results file to `path`
pub async fn write_results(
    path: &Path,
    snapshot: &AnalysisSnapshot,
    headers: &[String],
) -> ScanResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, render_results(snapshot, headers)?).await?;
    Ok(())
}
