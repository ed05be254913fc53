//! ## tfc-telemetry::logging
//! **Structured logging with `tracing`**
//!
//! The emulator itself only emits `tracing` events; this module installs the
//! subscriber that renders them. `RUST_LOG` takes precedence over the
//! configured filter.

use tfc_config::TelemetryConfig;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone)]
pub struct TfcLogger;

impl TfcLogger {
    /// Installs the global subscriber.
    ///
    /// # Panics
    /// If a global subscriber was already installed.
    pub fn init(config: &TelemetryConfig) {
        Self::builder(config).init()
    }

    /// Installs the global subscriber unless one is already present.
    pub fn try_init(
        config: &TelemetryConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        Self::builder(config).try_init()
    }

    fn builder(
        config: &TelemetryConfig,
    ) -> fmt::SubscriberBuilder<fmt::format::DefaultFields, fmt::format::Format, EnvFilter> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
        fmt()
            .with_env_filter(filter)
            .with_thread_names(config.thread_names)
            .with_span_events(FmtSpan::NONE)
    }
}
