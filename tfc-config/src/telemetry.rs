//! Observability configuration.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

/// Telemetry configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct TelemetryConfig {
    /// Default `tracing` filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_filter")]
    #[validate(length(min = 1))]
    pub log_filter: String,

    /// Include thread names in log lines.
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

fn default_log_filter() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            thread_names: default_true(),
        }
    }
}
