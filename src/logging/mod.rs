//! Structured logging for harness runs
//!
//! Harness events go through `tracing`. Output captured from the service
//! processes is re-emitted under the [`SUT_TARGET`] target so it can be
//! filtered independently (`RUST_LOG=reporter_harness::sut=debug`).

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Target used for lines forwarded from supervised service processes
pub const SUT_TARGET: &str = "reporter_harness::sut";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    pub level: String,
    /// Module-specific log levels
    pub module_levels: HashMap<String, String>,
    /// Include file and line in every event
    pub with_source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = HashMap::new();
        module_levels.insert("reporter_harness".to_string(), "info".to_string());
        module_levels.insert(SUT_TARGET.to_string(), "info".to_string());
        module_levels.insert("reqwest".to_string(), "warn".to_string());
        module_levels.insert("hyper".to_string(), "warn".to_string());

        Self {
            level: "warn".to_string(),
            module_levels,
            with_source_location: false,
        }
    }
}

impl LoggingConfig {
    fn build_filter(&self) -> Result<EnvFilter> {
        // RUST_LOG wins when present
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }

        let mut filter = EnvFilter::new(&self.level);
        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level)
                .parse()
                .map_err(|e| HarnessError::Config(format!("Invalid log directive: {}", e)))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

/// Install the global subscriber for the CLI.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = config.build_filter()?;
    Registry::default()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(config.with_source_location)
                .with_line_number(config.with_source_location),
        )
        .try_init()
        .map_err(|e| HarnessError::Config(format!("Failed to install subscriber: {}", e)))
}

/// Install a subscriber that writes through the test harness capture.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_for_tests() {
    let filter = LoggingConfig::default()
        .build_filter()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = Registry::default()
        .with(filter)
        .with(fmt::layer().with_test_writer().with_target(true))
        .try_init();
}

/// Which output stream a forwarded line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Re-emit one line of service output.
pub fn forward_line(service: &str, stream: StreamKind, line: &str) {
    match stream {
        StreamKind::Stdout => tracing::info!(target: "reporter_harness::sut", service, "{}", line),
        StreamKind::Stderr => tracing::warn!(target: "reporter_harness::sut", service, "{}", line),
    }
}
