//! Managed thread configuration.
//!
//! Scheduling policy and priority are validated like on a real system but
//! otherwise have no effect: emulated threads run on infinitely many,
//! infinitely fast cores.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

/// Scheduling policy requested for a managed thread.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedPolicy {
    #[default]
    Other,
    Batch,
    Idle,
    Fifo,
    RoundRobin,
}

impl SchedPolicy {
    /// Inclusive priority range accepted for this policy.
    pub fn priority_range(self) -> (u8, u8) {
        match self {
            SchedPolicy::Other | SchedPolicy::Batch | SchedPolicy::Idle => (0, 0),
            SchedPolicy::Fifo | SchedPolicy::RoundRobin => (1, 99),
        }
    }
}

/// Parameters for starting a managed thread.
#[derive(Default, Debug, Serialize, Deserialize, Validate, Clone)]
#[validate(schema(function = validation::validate_thread_config))]
pub struct ThreadConfig {
    /// Stack size in bytes. Platform default if absent.
    #[serde(default)]
    pub stack_size: Option<usize>,

    #[serde(default)]
    pub policy: SchedPolicy,

    #[serde(default)]
    pub priority: u8,
}

impl ThreadConfig {
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn with_policy(mut self, policy: SchedPolicy, priority: u8) -> Self {
        self.policy = policy;
        self.priority = priority;
        self
    }
}
