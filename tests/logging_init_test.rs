//! Global logging initialization, kept in its own test binary so the
//! process-global subscriber it installs cannot interfere with
//! `traced_test` log capture in the library's unit tests.

use iv_sweep::logging::{init, LoggingConfig, OutputFormat};
use tracing::Level;

#[test]
fn init_is_idempotent() {
    let config = LoggingConfig::new(Level::WARN)
        .with_format(OutputFormat::Compact)
        .with_ansi(false);
    init(config.clone()).unwrap();
    init(config).unwrap();
}
