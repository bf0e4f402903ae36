//! Scan log file
//!
//! In file-tail mode the worker writes every point to a growing text file and
//! the analysis side follows it. Lines starting with `#` are headers and are
//! echoed verbatim into saved results. Data lines are whitespace-separated:
//!
//! | Mode | Columns |
//! |---|---|
//! | 1D | `x y` |
//! | 1D ratio | `x y1 y2` |
//! | 2D | `x y z` |
//! | 2D ratio | `x y z1 z2` |
//!
//! For 2D, `x` is the inner axis and `y` the outer axis, matching the
//! acquisition order. Every line is flushed as soon as it is written so a
//! reader never sees a partial point for long.

use crate::analysis::live::Sample;
use crate::error::ScanResult;
use crate::scan::params::{ScanDim, ScanParams};
use crate::scan::protocol::ScanPoint;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

/// Column layout of a scan log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLayout {
    /// Dimensionality
    pub dim: ScanDim,
    /// Two scaler columns instead of one
    pub ratio: bool,
}

impl LogLayout {
    /// Layout for a scan request
    pub fn for_params(params: &ScanParams) -> Self {
        Self {
            dim: params.scan_dim,
            ratio: params.ratio,
        }
    }

    /// Layout matching a `# columns:` header value
    pub fn from_columns(columns: &str) -> Option<Self> {
        let names: Vec<&str> = columns.split_whitespace().collect();
        [ScanDim::OneD, ScanDim::TwoD]
            .into_iter()
            .flat_map(|dim| [false, true].map(|ratio| Self { dim, ratio }))
            .find(|layout| layout.columns() == names.as_slice())
    }

    /// Layout declared by a log's header lines
    pub fn from_headers<S: AsRef<str>>(headers: &[S]) -> Option<Self> {
        headers
            .iter()
            .find_map(|h| h.as_ref().strip_prefix("# columns:"))
            .and_then(Self::from_columns)
    }

    /// Column names in file order
    pub fn columns(&self) -> &'static [&'static str] {
        match (self.dim, self.ratio) {
            (ScanDim::OneD, false) => &["x", "y"],
            (ScanDim::OneD, true) => &["x", "y1", "y2"],
            (ScanDim::TwoD, false) => &["x", "y", "z"],
            (ScanDim::TwoD, true) => &["x", "y", "z1", "z2"],
        }
    }

    /// Data line for one point
    pub fn format_point(&self, point: &ScanPoint) -> String {
        let mut fields = vec![point.position];
        if self.dim == ScanDim::TwoD {
            fields.push(point.position2.unwrap_or(0.0));
        }
        if self.ratio {
            fields.extend(point.raw.iter().take(2));
        } else {
            fields.push(point.intensity);
        }
        fields
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parse one data line.
    ///
    /// Header, blank and malformed lines yield `None`. Ratio columns are
    /// divided, with a zero denominator giving 0.
    pub fn parse_line(&self, line: &str) -> Option<Sample> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let fields: Vec<f64> = line
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        if fields.len() != self.columns().len() {
            return None;
        }
        match (self.dim, self.ratio) {
            (ScanDim::OneD, false) => Some(Sample::line(fields[0], fields[1])),
            (ScanDim::OneD, true) => Some(Sample::line(fields[0], ratio(fields[1], fields[2]))),
            (ScanDim::TwoD, false) => Some(Sample::map(fields[0], fields[1], fields[2])),
            (ScanDim::TwoD, true) => Some(Sample::map(
                fields[0],
                fields[1],
                ratio(fields[2], fields[3]),
            )),
        }
    }
}

/// `numerator / denominator`, or 0 when the denominator is 0
pub fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Header lines describing one scan
pub fn header_lines(
    scan_id: &Uuid,
    started: &DateTime<Utc>,
    params: &ScanParams,
    layout: &LogLayout,
) -> Vec<String> {
    let mut lines = vec![
        format!("# scan_id: {scan_id}"),
        format!("# started: {}", started.to_rfc3339()),
        format!("# scan_dim: {}", params.scan_dim),
        format!(
            "# device: {} start={} stop={} step={}",
            params.device, params.start, params.stop, params.step
        ),
    ];
    if let Some((device2, start2, stop2, step2)) = params.outer() {
        lines.push(format!(
            "# device2: {device2} start={start2} stop={stop2} step={step2}"
        ));
    }
    lines.push(format!("# dwell_time: {}", params.dwell_time));
    lines.push(format!("# scalers: {}", params.scalers.join(" ")));
    if let Some(timer) = &params.timer {
        lines.push(format!("# timer: {timer}"));
    }
    if let Some(detector) = &params.detector {
        lines.push(format!("# detector: {detector}"));
    }
    lines.push(format!("# columns: {}", layout.columns().join(" ")));
    lines
}

/// Writer for one scan log
pub struct ScanLogWriter {
    path: PathBuf,
    layout: LogLayout,
    writer: BufWriter<File>,
    lines: usize,
}

impl ScanLogWriter {
    /// Create `directory/scan_<timestamp>_<id>.txt` and write the header.
    pub async fn create(directory: &Path, params: &ScanParams) -> ScanResult<Self> {
        tokio::fs::create_dir_all(directory).await?;
        let scan_id = Uuid::new_v4();
        let started = Utc::now();
        let short_id = scan_id.simple().to_string();
        let path = directory.join(format!(
            "scan_{}_{}.txt",
            started.format("%Y%m%d_%H%M%S"),
            &short_id[..8]
        ));
        let layout = LogLayout::for_params(params);

        let file = File::create(&path).await?;
        let mut log = Self {
            path,
            layout,
            writer: BufWriter::new(file),
            lines: 0,
        };
        for line in header_lines(&scan_id, &started, params, &layout) {
            log.write_line(&line).await?;
        }
        Ok(log)
    }

    /// Append one point
    pub async fn append(&mut self, point: &ScanPoint) -> ScanResult<()> {
        let line = self.layout.format_point(point);
        self.write_line(&line).await?;
        self.lines += 1;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> ScanResult<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Location of the log
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column layout
    pub fn layout(&self) -> LogLayout {
        self.layout
    }

    /// Number of points written
    pub fn points_written(&self) -> usize {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(position: f64, position2: Option<f64>, raw: Vec<f64>) -> ScanPoint {
        ScanPoint {
            index: 0,
            position,
            position2,
            intensity: raw[0],
            raw,
        }
    }

    #[test]
    fn test_line_layouts_round_trip() {
        let layout = LogLayout {
            dim: ScanDim::OneD,
            ratio: false,
        };
        let line = layout.format_point(&point(0.5, None, vec![12.0]));
        assert_eq!(line, "0.5 12");
        assert_eq!(layout.parse_line(&line), Some(Sample::line(0.5, 12.0)));

        let ratio = LogLayout {
            dim: ScanDim::TwoD,
            ratio: true,
        };
        let line = ratio.format_point(&point(1.0, Some(2.0), vec![10.0, 4.0]));
        assert_eq!(line, "1 2 10 4");
        assert_eq!(ratio.parse_line(&line), Some(Sample::map(1.0, 2.0, 2.5)));
    }

    #[test]
    fn test_ratio_with_zero_denominator() {
        let layout = LogLayout {
            dim: ScanDim::OneD,
            ratio: true,
        };
        assert_eq!(layout.parse_line("1 5 0"), Some(Sample::line(1.0, 0.0)));
    }

    #[test]
    fn test_headers_and_malformed_lines_are_skipped() {
        let layout = LogLayout {
            dim: ScanDim::OneD,
            ratio: false,
        };
        assert_eq!(layout.parse_line("# columns: x y"), None);
        assert_eq!(layout.parse_line(""), None);
        assert_eq!(layout.parse_line("1.0 abc"), None);
        assert_eq!(layout.parse_line("1.0 2.0 3.0"), None);
        assert_eq!(layout.parse_line("  1.0\t2.0  "), Some(Sample::line(1.0, 2.0)));
    }

    #[test]
    fn test_layout_from_headers() {
        let headers = ["# scan_dim: 2D", "# columns: x y z1 z2"];
        assert_eq!(
            LogLayout::from_headers(&headers),
            Some(LogLayout {
                dim: ScanDim::TwoD,
                ratio: true
            })
        );
        assert_eq!(LogLayout::from_columns("x q"), None);
        assert_eq!(LogLayout::from_headers::<&str>(&[]), None);
    }

    #[tokio::test]
    async fn test_writer_emits_header_then_points() {
        let dir = tempfile::tempdir().unwrap();
        let params = ScanParams::line("m1", 0.0, 1.0, 0.5)
            .with_outer("m2", 0.0, 1.0, 1.0)
            .with_timer("t1")
            .with_scalers(&["i0"]);
        let mut log = ScanLogWriter::create(dir.path(), &params).await.unwrap();
        log.append(&point(0.5, Some(1.0), vec![3.0])).await.unwrap();
        assert_eq!(log.points_written(), 1);

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# scan_id: "));
        assert!(lines.iter().any(|l| l.starts_with("# device2: m2")));
        assert!(lines.iter().any(|l| *l == "# columns: x y z"));
        assert_eq!(*lines.last().unwrap(), "0.5 1 3");
    }
}
