//! Global subscriber installation.
//!
//! Kept in its own test binary: installing the global subscriber would
//! collide with `#[traced_test]` in the unit tests.

use beamline_scan::config::AppConfig;
use beamline_scan::logging::{self, LoggingConfig, OutputFormat};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    let config = LoggingConfig::new(Level::ERROR)
        .with_format(OutputFormat::Json)
        .with_span_events(true)
        .with_ansi(false);
    assert!(logging::init(config.clone()).is_ok());
    assert!(tracing::dispatcher::has_been_set());

    // A second install, from config or explicit options, is a no-op.
    assert!(logging::init(config).is_ok());
    assert!(logging::init_from_config(&AppConfig::default()).is_ok());
}
