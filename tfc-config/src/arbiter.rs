//! Arbiter configuration.
//!
//! Parameters for the process-wide time-flow arbiter:
//! - What happens on a protocol violation or deadlock
//! - Optional fixed seeds for the virtual clocks
//! - Initial state of the anomaly detectors ("traps")

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

/// Reaction to an unrecoverable protocol violation or a detected deadlock.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FatalMode {
    /// Log the diagnostic and abort the process.
    #[default]
    Abort,
    /// Log the diagnostic and panic the detecting thread. Meant for test harnesses.
    Panic,
}

/// A fixed `(secs, nanos)` starting point for one of the virtual clocks.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockSeed {
    pub secs: u64,
    #[validate(range(max = 999_999_999))]
    #[serde(default)]
    pub nanos: u32,
}

/// Arbiter configuration parameters.
#[derive(Default, Debug, Serialize, Deserialize, Validate, Clone)]
pub struct ArbiterConfig {
    /// Reaction to protocol violations and deadlocks.
    #[serde(default)]
    pub fatal_mode: FatalMode,

    /// Starting value of the realtime clock. Read from the host if absent.
    #[validate(nested)]
    #[serde(default)]
    pub realtime_seed: Option<ClockSeed>,

    /// Starting value of the monotonic clock. Read from the host if absent.
    #[validate(nested)]
    #[serde(default)]
    pub monotonic_seed: Option<ClockSeed>,

    /// Anomaly detectors enabled right after construction.
    #[validate(nested)]
    #[serde(default)]
    pub traps: TrapConfig,
}

impl ArbiterConfig {
    /// Configuration used by test harnesses: panics instead of aborting and
    /// starts both clocks at fixed values.
    pub fn for_tests() -> Self {
        Self {
            fatal_mode: FatalMode::Panic,
            realtime_seed: Some(ClockSeed {
                secs: 1_700_000_000,
                nanos: 0,
            }),
            monotonic_seed: Some(ClockSeed { secs: 1000, nanos: 0 }),
            traps: TrapConfig::default(),
        }
    }
}

/// Initial state of the three anomaly detectors.
#[derive(Default, Debug, Serialize, Deserialize, Validate, Clone, Copy)]
pub struct TrapConfig {
    /// Watch for blocking with a deadline that already passed.
    #[serde(default)]
    pub expired_deadline: bool,
    /// Watch for two or more threads blocking until the same deadline.
    #[serde(default)]
    pub same_deadline: bool,
    /// Watch for two or more threads resumed by the same clock advance.
    #[serde(default)]
    pub simultaneous_resume: bool,
}
