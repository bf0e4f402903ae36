//! Live analysis pipeline
//!
//! - [`spline`]: natural cubic spline and its real roots
//! - [`stats`]: gradient, FWHM and center of mass
//! - [`fit`]: Gaussian least-squares fit
//! - [`live`]: accumulated samples with derived statistics
//! - [`ingest`]: background tasks feeding a [`LiveAnalysis`] during a scan
//! - [`export`]: saved results file

pub mod export;
pub mod fit;
pub mod ingest;
pub mod live;
pub mod spline;
pub mod stats;

pub use export::{render_results, write_results};
pub use fit::{fit_gaussian, GaussianFit, GaussianParams, FIT_EQUATION};
pub use ingest::{follow, spawn_direct, spawn_file_tail, IngestOutcome, Ingestion};
pub use live::{AnalysisOptions, AnalysisSnapshot, FitTarget, LiveAnalysis, PeakStats, Sample};
pub use stats::{calc_com, calc_fwhm, gradient, Fwhm};
