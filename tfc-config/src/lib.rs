//! # TFC Configuration System
//!
//! Hierarchical configuration for the time-flow-control emulator.
//!
//! ## Features
//! - **Unified Configuration**: Arbiter, traps, thread defaults and telemetry in one place
//! - **Validation**: Runtime validation of every loaded value
//! - **Environment Awareness**: Per-environment overrides and `TFC_*` variables

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod arbiter;
mod error;
mod telemetry;
mod thread;
pub mod validation;

pub use arbiter::ArbiterConfig;
pub use arbiter::ClockSeed;
pub use arbiter::FatalMode;
pub use arbiter::TrapConfig;
pub use error::ConfigError;
pub use telemetry::TelemetryConfig;
pub use thread::SchedPolicy;
pub use thread::ThreadConfig;

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone)]
pub struct TfcConfig {
    /// Arbiter behaviour, clock seeds and traps.
    #[validate(nested)]
    #[serde(default)]
    pub arbiter: ArbiterConfig,

    /// Defaults applied to managed threads started without an explicit config.
    #[validate(nested)]
    #[serde(default)]
    pub thread: ThreadConfig,

    /// Logging and metrics.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl TfcConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default Values
    /// 2. `config/tfc.yaml` - Base settings. If missing, defaults are used.
    /// 3. `config/<environment>.yaml` - Environment-specific overrides (`TFC_ENV`).
    /// 4. `TFC_*` environment variables, `__` separating nested keys.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(TfcConfig::default()));

        if Path::new("config/tfc.yaml").exists() {
            figment = figment.merge(Yaml::file("config/tfc.yaml"));
        }

        let env = std::env::var("TFC_ENV").unwrap_or_else(|_| "test".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::extract_validated(figment.merge(Env::prefixed("TFC_").ignore(&["ENV"]).split("__")))
    }

    /// Load configuration from a specific path for testing/validation.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        Self::extract_validated(
            Figment::from(Serialized::defaults(TfcConfig::default()))
                .merge(Yaml::file(path))
                .merge(Env::prefixed("TFC_").ignore(&["ENV"]).split("__")),
        )
    }

    fn extract_validated(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn full_config_validation() {
        let config = TfcConfig::default();
        config.validate().expect("Default config should validate");
        assert_eq!(config.arbiter.fatal_mode, FatalMode::Abort);
    }

    #[test]
    fn environment_override() {
        Jail::expect_with(|jail| {
            jail.set_env("TFC_ARBITER__FATAL_MODE", "panic");
            jail.set_env("TFC_ARBITER__TRAPS__SAME_DEADLINE", "true");
            let config = TfcConfig::load().expect("config should load");
            assert_eq!(config.arbiter.fatal_mode, FatalMode::Panic);
            assert!(config.arbiter.traps.same_deadline);
            assert!(!config.arbiter.traps.expired_deadline);
            Ok(())
        });
    }

    #[test]
    fn loads_yaml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "tfc.yaml",
                r#"
arbiter:
  fatal_mode: panic
  monotonic_seed:
    secs: 10
    nanos: 500
thread:
  stack_size: 65536
  policy: fifo
  priority: 20
"#,
            )?;
            let config = TfcConfig::load_from_path("tfc.yaml").expect("config should load");
            assert_eq!(
                config.arbiter.monotonic_seed,
                Some(ClockSeed { secs: 10, nanos: 500 })
            );
            assert_eq!(config.thread.policy, SchedPolicy::Fifo);
            assert_eq!(config.thread.stack_size, Some(65536));
            assert_eq!(config.telemetry.log_filter, "info");
            Ok(())
        });
    }

    #[test]
    fn rejects_invalid_seed() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bad.yaml",
                r#"
arbiter:
  realtime_seed:
    secs: 1
    nanos: 1000000000
"#,
            )?;
            assert!(matches!(
                TfcConfig::load_from_path("bad.yaml"),
                Err(ConfigError::Validation(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(matches!(
            TfcConfig::load_from_path("does/not/exist.yaml"),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
