//! # Beamline Scan Core Library
//!
//! This crate is the scan execution and live-analysis engine of a beamline
//! control application. It drives 1D and 2D motor sweeps synchronized with
//! scaler/timer counting and, optionally, externally triggered area-detector
//! exposures, while a concurrent pipeline ingests the growing result stream
//! and recomputes peak statistics for live display.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: Capability traits for axes, timers, scalers, detectors,
//!   pulse generators and binary outputs; the device database opened by
//!   `start_mxdb`; simulated devices.
//! - **`scan`**: Scan parameters, position sequencer, trigger synchronizer,
//!   the command-driven scan worker and the supervisor that owns it.
//! - **`analysis`**: Gradient, FWHM, center of mass and Gaussian fit over
//!   accumulated samples, plus direct and file-tail ingestion.
//! - **`feedback`**: Bounded intensity-feedback peak search.
//! - **`config`**: Layered configuration (TOML file + environment).
//! - **`logging`**: Tracing subscriber setup.
//! - **`error`**: The `ScanError` enum shared across the crate.
//!
//! ## Concurrency
//!
//! The scan worker owns every hardware handle and runs on its own OS thread
//! with a private runtime, so hardware polling never competes with the
//! supervisor or the analysis task. The supervisor and worker share exactly
//! two channels and one abort flag. A worker is single-use: it is torn down
//! and rebuilt after every scan.

pub mod analysis;
pub mod config;
pub mod error;
pub mod feedback;
pub mod hardware;
pub mod logging;
pub mod scan;
