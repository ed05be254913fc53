//! ## tfc-core::arbiter
//! **Block/wake bookkeeping and virtual time advancement**
//!
//! The arbiter counts live threads, blocked threads, threads about to wake
//! up and pending cancellations. Whenever a thread reports itself blocked and
//! that makes every live thread blocked with none about to wake, the arbiter
//! resolves the full stop: it either proves a deadlock, or advances the
//! virtual clocks to the earliest pending deadline and times out every wait
//! due at that instant.
//!
//! All counters live behind the big lock. Managed primitives take it with
//! [`Arbiter::lock`] and report their transitions through the returned
//! [`BigLockGuard`].

mod timeouts;
mod traps;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use tfc_config::{ArbiterConfig, FatalMode, TfcConfig, ThreadConfig};
use tfc_telemetry::MetricsRecorder;

use crate::blocker::BlockerHandle;
use crate::error::{raise, TfcError, Violation};
use crate::time::{ClockId, Timespec, VirtualClock};

pub use timeouts::TimeoutKey;
pub use traps::Trap;

use timeouts::PendingTimeouts;
use traps::Traps;

static GLOBAL: Lazy<Arc<Arbiter>> = Lazy::new(|| {
    let config = TfcConfig::load().unwrap_or_else(|e| {
        warn!("falling back to default TFC configuration: {e}");
        TfcConfig::default()
    });
    Arbiter::from_config(&config)
});

/// Point-in-time copy of the arbiter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterSnapshot {
    pub live: usize,
    pub blocked: usize,
    pub about_to_wake: usize,
    pub cancellations_pending: usize,
    pub pending_timeouts: usize,
}

pub(crate) struct ArbiterState {
    live: usize,
    blocked: usize,
    about_to_wake: usize,
    cancellations: usize,
    timeouts: PendingTimeouts,
    traps: Traps,
}

/// The time-flow arbiter. One instance per emulated process.
pub struct Arbiter {
    big_lock: Mutex<ArbiterState>,
    clock: VirtualClock,
    fatal_mode: FatalMode,
    thread_defaults: ThreadConfig,
    metrics: MetricsRecorder,
}

impl fmt::Debug for Arbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arbiter")
            .field("fatal_mode", &self.fatal_mode)
            .field("monotonic", &self.clock.now(ClockId::Monotonic))
            .finish_non_exhaustive()
    }
}

impl Arbiter {
    /// Creates an arbiter with default configuration, clocks seeded from the host.
    pub fn new() -> Arc<Self> {
        Self::with_config(&ArbiterConfig::default())
    }

    pub fn with_config(config: &ArbiterConfig) -> Arc<Self> {
        Self::build(config, ThreadConfig::default())
    }

    /// Creates an arbiter from a full settings tree. Threads started without
    /// an explicit config use `settings.thread`.
    pub fn from_config(settings: &TfcConfig) -> Arc<Self> {
        Self::build(&settings.arbiter, settings.thread.clone())
    }

    fn build(config: &ArbiterConfig, thread_defaults: ThreadConfig) -> Arc<Self> {
        let clock = VirtualClock::seeded(config.realtime_seed, config.monotonic_seed);
        let mut traps = Traps::default();
        for trap in Trap::ALL {
            let wanted = match trap {
                Trap::ExpiredDeadline => config.traps.expired_deadline,
                Trap::SameDeadline => config.traps.same_deadline,
                Trap::SimultaneousResume => config.traps.simultaneous_resume,
            };
            if wanted {
                traps.enable(trap);
            }
        }

        info!(
            fatal_mode = ?config.fatal_mode,
            realtime = %clock.now(ClockId::Realtime),
            monotonic = %clock.now(ClockId::Monotonic),
            "TFC arbiter created"
        );

        Arc::new(Self {
            big_lock: Mutex::new(ArbiterState {
                // The thread creating the arbiter is the implicit main thread.
                live: 1,
                blocked: 0,
                about_to_wake: 0,
                cancellations: 0,
                timeouts: PendingTimeouts::default(),
                traps,
            }),
            clock,
            fatal_mode: config.fatal_mode,
            thread_defaults,
            metrics: MetricsRecorder::new(),
        })
    }

    pub fn thread_defaults(&self) -> &ThreadConfig {
        &self.thread_defaults
    }

    /// The process-wide arbiter, built from [`TfcConfig::load`] on first use.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Acquires the big lock.
    pub fn lock(&self) -> BigLockGuard<'_> {
        BigLockGuard {
            arbiter: self,
            state: self.big_lock.lock(),
        }
    }

    #[inline]
    pub fn now(&self, which: ClockId) -> Timespec {
        self.clock.now(which)
    }

    /// Monotonic deadline `timeout` from now.
    pub fn deadline_after(&self, timeout: Duration) -> Result<Timespec, TfcError> {
        self.clock.deadline_after(timeout)
    }

    /// Checks that the clocks can be advanced up to an absolute monotonic `deadline`.
    pub fn check_deadline(&self, deadline: Timespec) -> Result<(), TfcError> {
        self.clock.check_reachable(deadline)
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        self.lock().snapshot()
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn fatal_mode(&self) -> FatalMode {
        self.fatal_mode
    }

    /// Reports a protocol violation. Never returns.
    #[track_caller]
    pub fn fatal(&self, violation: Violation) -> ! {
        raise(self.fatal_mode, violation)
    }

    /// Starts watching for `trap`. Enabling an enabled trap is a protocol violation.
    #[track_caller]
    pub fn enable_trap(&self, trap: Trap) {
        if !self.lock().state.traps.enable(trap) {
            self.fatal(Violation::TrapAlreadyEnabled(trap));
        }
    }

    /// Stops watching for `trap`. Disabling a disabled trap is a protocol violation.
    #[track_caller]
    pub fn disable_trap(&self, trap: Trap) {
        if !self.lock().state.traps.disable(trap) {
            self.fatal(Violation::TrapNotEnabled(trap));
        }
    }

    pub fn is_trap_enabled(&self, trap: Trap) -> bool {
        self.lock().state.traps.is_enabled(trap)
    }

    /// Returns whether `trap` fired since the last query and resets it.
    pub fn take_trap(&self, trap: Trap) -> bool {
        self.lock().state.traps.take(trap)
    }
}

/// Proof that the big lock is held. Every report operation goes through it.
pub struct BigLockGuard<'a> {
    arbiter: &'a Arbiter,
    pub(crate) state: MutexGuard<'a, ArbiterState>,
}

impl<'a> BigLockGuard<'a> {
    pub fn arbiter(&self) -> &'a Arbiter {
        self.arbiter
    }

    /// Fails with [`Violation::ForeignArbiter`] unless this guard belongs to `arbiter`.
    #[track_caller]
    pub fn assert_owned_by(&self, arbiter: &Arbiter) {
        if !std::ptr::eq(self.arbiter, arbiter) {
            self.fatal(Violation::ForeignArbiter);
        }
    }

    #[track_caller]
    pub fn fatal(&self, violation: Violation) -> ! {
        self.arbiter.fatal(violation)
    }

    #[inline]
    pub fn now(&self, which: ClockId) -> Timespec {
        self.arbiter.clock.now(which)
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        ArbiterSnapshot {
            live: self.state.live,
            blocked: self.state.blocked,
            about_to_wake: self.state.about_to_wake,
            cancellations_pending: self.state.cancellations,
            pending_timeouts: self.state.timeouts.len(),
        }
    }

    /// Registers a thread about to be spawned.
    pub fn report_new_thread(&mut self) -> Result<(), TfcError> {
        self.state.live = self
            .state
            .live
            .checked_add(1)
            .ok_or(TfcError::ThreadCountOverflow)?;
        self.arbiter.metrics.threads_started.inc();
        trace!(live = self.state.live, "thread registered");
        Ok(())
    }

    /// Removes a joined (or never spawned) thread.
    #[track_caller]
    pub fn report_thread_termination(&mut self) {
        let (live, blocked) = (self.state.live, self.state.blocked);
        if live <= 1 || blocked > live - 1 {
            self.fatal(Violation::TerminationUnderflow { live, blocked });
        }
        self.state.live -= 1;
        trace!(live = self.state.live, "thread unregistered");
    }

    /// The calling thread is about to wait until signaled, or until the
    /// deadline of `timeout` if given.
    ///
    /// A deadline that already passed is timed out immediately; the thread
    /// still counts as blocked until it reports the end of its wait.
    #[track_caller]
    pub fn report_blocked_begin(&mut self, timeout: Option<&BlockerHandle>) {
        if self.state.blocked >= self.state.live {
            let (blocked, live) = (self.state.blocked + 1, self.state.live);
            self.fatal(Violation::BlockedExceedsLive { blocked, live });
        }
        self.state.blocked += 1;
        trace!(
            blocked = self.state.blocked,
            live = self.state.live,
            "thread blocked"
        );

        if let Some((blocker, deadline)) = timeout.and_then(|b| b.deadline().map(|d| (b, d))) {
            let now = self.now(ClockId::Monotonic);
            if deadline <= now {
                self.trip(Trap::ExpiredDeadline, deadline);
                blocker.signal_timeout(self);
            } else {
                if self.state.timeouts.contains_deadline(deadline) {
                    self.trip(Trap::SameDeadline, deadline);
                }
                let key = self.state.timeouts.insert(deadline, blocker.clone());
                blocker.set_timeout_key(Some(key));
            }
        }

        if self.state.blocked == self.state.live && self.state.about_to_wake == 0 {
            self.resolve_quiescence();
        }
    }

    /// A blocked thread was signaled and will resume shortly.
    #[track_caller]
    pub fn report_about_to_wake(&mut self) {
        if self.state.about_to_wake >= self.state.blocked {
            let (about_to_wake, blocked) = (self.state.about_to_wake + 1, self.state.blocked);
            self.fatal(Violation::AboutToWakeExceedsBlocked {
                about_to_wake,
                blocked,
            });
        }
        self.state.about_to_wake += 1;
    }

    /// Takes back a wakeup that another thread stole before the woken thread resumed.
    #[track_caller]
    pub fn undo_report_about_to_wake(&mut self) {
        if self.state.about_to_wake == 0 {
            self.fatal(Violation::AboutToWakeUnderflow);
        }
        self.state.about_to_wake -= 1;
    }

    /// A woken thread resumed. Removes its pending timeout, if still queued.
    #[track_caller]
    pub fn report_blocked_end(&mut self, timeout: Option<&BlockerHandle>) {
        let (blocked, about_to_wake) = (self.state.blocked, self.state.about_to_wake);
        if blocked == 0 || about_to_wake == 0 || blocked < about_to_wake {
            self.fatal(Violation::BlockedEndMismatch {
                blocked,
                about_to_wake,
            });
        }
        self.state.blocked -= 1;
        self.state.about_to_wake -= 1;

        if let Some(key) = timeout.and_then(BlockerHandle::take_timeout_key) {
            self.state.timeouts.remove(&key);
        }
        trace!(blocked = self.state.blocked, "thread resumed");
    }

    #[track_caller]
    pub fn report_cancellation_requested(&mut self) {
        if self.state.cancellations >= self.state.live {
            let live = self.state.live;
            self.fatal(Violation::CancellationOverflow { live });
        }
        self.state.cancellations += 1;
    }

    #[track_caller]
    pub fn report_cancellation_done(&mut self) {
        if self.state.cancellations == 0 {
            self.fatal(Violation::CancellationUnderflow);
        }
        self.state.cancellations -= 1;
    }

    pub(crate) fn metrics(&self) -> &MetricsRecorder {
        &self.arbiter.metrics
    }

    fn trip(&mut self, trap: Trap, deadline: Timespec) {
        if self.state.traps.trip(trap) {
            warn!(?trap, %deadline, "TFC trap fired");
        }
    }

    /// Every live thread is blocked and none is about to wake.
    #[track_caller]
    fn resolve_quiescence(&mut self) {
        self.arbiter.metrics.quiescence.inc();

        let Some((key, earliest)) = self.state.timeouts.pop_first() else {
            if self.state.cancellations == 0 {
                let threads = self.state.live;
                self.fatal(Violation::Deadlock { threads });
            }
            debug!(
                cancellations = self.state.cancellations,
                "all threads blocked, waiting for cancellation to make progress"
            );
            return;
        };
        earliest.set_timeout_key(None);

        let now = self.now(ClockId::Monotonic);
        let Some(delta) = key.deadline.nanos_since(now) else {
            self.fatal(Violation::DeadlineInPast);
        };
        if let Err(e) = self.arbiter.clock.advance_by(delta) {
            self.fatal(Violation::ClockAdvanceFailed(e.to_string()));
        }
        self.arbiter.metrics.record_advance(delta);
        debug!(delta_ns = delta, now = %key.deadline, "virtual clock advanced");

        earliest.signal_timeout(self);
        let mut resumed = 1usize;
        while let Some(next) = self.state.timeouts.pop_due_at(key.deadline) {
            next.set_timeout_key(None);
            next.signal_timeout(self);
            resumed += 1;
        }
        if resumed > 1 {
            self.arbiter.metrics.simultaneous_resumes.inc();
            self.trip(Trap::SimultaneousResume, key.deadline);
            debug!(resumed, "clock advance resumed several threads");
        }
    }
}
