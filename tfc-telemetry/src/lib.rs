//! # TFC Telemetry
//!
//! Crate for logging setup and arbiter metrics.

pub mod logging;
pub mod metrics;

pub use logging::TfcLogger;
pub use metrics::MetricsRecorder;
