//! Error taxonomy of the emulator.
//!
//! [`TfcError`] covers resource and arithmetic limits a caller may want to
//! handle. [`Violation`] covers broken protocol contracts and deadlocks;
//! those never reach a caller, they terminate the process through [`raise`].

use std::panic::Location;
use std::time::Duration;

use thiserror::Error;
use tracing::error;

use tfc_config::{ConfigError, FatalMode};

use crate::arbiter::Trap;

/// Recoverable failures returned to the immediate caller.
#[derive(Debug, Error)]
pub enum TfcError {
    #[error("virtual clock overflow: cannot advance by {0:?}")]
    ClockOverflow(Duration),

    #[error("managed thread count overflow")]
    ThreadCountOverflow,

    #[error("semaphore count would exceed its maximum of {max}")]
    SemaphoreOverflow { max: usize },

    /// A cancellation request was observed at a cancellation point.
    #[error("thread cancelled")]
    Cancelled,

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("invalid thread configuration: {0}")]
    InvalidThreadConfig(#[from] ConfigError),

    #[error("thread '{0}' panicked")]
    ThreadPanicked(String),
}

/// Protocol violations. Each one means the emulated program (or a managed
/// primitive) broke a contract, so timing results can no longer be trusted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("thread blocker signaled twice")]
    DoubleSignal,

    #[error("thread blocker timeout signaled twice")]
    DoubleTimeoutSignal,

    #[error("thread blocker blocked twice")]
    DoubleBlock,

    #[error("thread blocker dropped while a thread is still blocked on it")]
    BlockerDroppedWhileBlocked,

    #[error("wakeup revoked from a blocker that was not woken by a signal")]
    RevokeWithoutWakeup,

    #[error("wakeup restored on a blocker whose wakeup was not revoked")]
    RestoreWithoutRevoke,

    #[error("thread termination reported with {live} live thread(s) and {blocked} blocked")]
    TerminationUnderflow { live: usize, blocked: usize },

    #[error("blocked thread count {blocked} would exceed live thread count {live}")]
    BlockedExceedsLive { blocked: usize, live: usize },

    #[error("about-to-wake count {about_to_wake} would exceed blocked count {blocked}")]
    AboutToWakeExceedsBlocked { about_to_wake: usize, blocked: usize },

    #[error("about-to-wake count underflow")]
    AboutToWakeUnderflow,

    #[error("blocked-end reported with blocked={blocked}, about_to_wake={about_to_wake}")]
    BlockedEndMismatch { blocked: usize, about_to_wake: usize },

    #[error("pending cancellation count would exceed live thread count {live}")]
    CancellationOverflow { live: usize },

    #[error("pending cancellation count underflow")]
    CancellationUnderflow,

    #[error("deadlock: all {threads} thread(s) permanently blocked, no pending timeouts, no pending cancellations")]
    Deadlock { threads: usize },

    #[error("earliest pending deadline lies before the current virtual time")]
    DeadlineInPast,

    #[error("virtual clock advance failed: {0}")]
    ClockAdvanceFailed(String),

    #[error("trap {0:?} enabled twice")]
    TrapAlreadyEnabled(Trap),

    #[error("trap {0:?} disabled while not enabled")]
    TrapNotEnabled(Trap),

    #[error("primitive used with a big lock of a different arbiter")]
    ForeignArbiter,

    #[error("mutex locked recursively by its owner")]
    RecursiveLock,

    #[error("mutex unlocked by a thread that does not own it")]
    UnlockNotOwner,

    #[error("thread started while in state {0}")]
    ThreadNotStartable(&'static str),

    #[error("join called while in state {0}")]
    NothingToJoin(&'static str),

    #[error("thread tried to join itself")]
    SelfJoin,
}

/// Reports a protocol violation and terminates according to `mode`.
#[track_caller]
#[cold]
pub fn raise(mode: FatalMode, violation: Violation) -> ! {
    let location = Location::caller();
    error!(%violation, %location, "TFC protocol violation");
    match mode {
        FatalMode::Abort => {
            eprintln!("TFC protocol violation: {violation} (detected at {location})");
            std::process::abort()
        }
        FatalMode::Panic => panic!("TFC protocol violation: {violation} (detected at {location})"),
    }
}
