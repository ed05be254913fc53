//! ## tfc-core::blocker
//! **One thread waiting in one place**
//!
//! A [`ThreadBlocker`] represents a single wait of a single thread. The
//! waiting thread calls `block`, any other thread ends the wait with
//! `signal`; a [`TimeoutThreadBlocker`] may additionally be ended by the
//! arbiter when the virtual clock reaches its deadline.
//!
//! The first terminal event wins the wakeup. Later events are still latched
//! (and still checked for duplicates) but wake nobody.
//!
//! The wait itself happens on a condition variable bound to the big lock,
//! so signaling (always done under the big lock) can never race with the
//! decision to wait.

use std::fmt;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use tfc_config::FatalMode;

use crate::arbiter::{BigLockGuard, TimeoutKey};
use crate::context::ThreadContext;
use crate::error::{raise, TfcError, Violation};
use crate::time::Timespec;

/// The event that ended a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signaled,
    TimedOut,
    Cancelled,
}

/// Whether a pending cancellation request may end a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPoint {
    Cancellable,
    NotCancellable,
}

/// A lock released for the duration of a wait and re-acquired afterwards,
/// like the mutex handed to a condition variable wait.
///
/// Both calls happen under the big lock. `relock_after_wait` runs on every
/// exit from a wait that got as far as `unlock_for_wait`, including a
/// cancelled one, and may itself block.
pub trait BlockingUnlock {
    fn unlock_for_wait(&self, guard: &mut BigLockGuard<'_>);
    fn relock_after_wait(&self, guard: &mut BigLockGuard<'_>);
}

#[derive(Default)]
struct Flags {
    blocked: bool,
    signaled: bool,
    timed_out: bool,
    cancelled: bool,
    first: Option<Wake>,
    revoked: bool,
    timeout_key: Option<TimeoutKey>,
    fatal_mode: FatalMode,
}

struct BlockerCell {
    flags: Mutex<Flags>,
    wake: Condvar,
    deadline: Option<Timespec>,
}

/// Shared reference to a blocker, held by whoever may end the wait:
/// a primitive's waiter list, the pending-timeout set, a thread context.
#[derive(Clone)]
pub struct BlockerHandle(Arc<BlockerCell>);

impl fmt::Debug for BlockerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.0.flags.lock();
        f.debug_struct("BlockerHandle")
            .field("deadline", &self.0.deadline)
            .field("blocked", &flags.blocked)
            .field("first", &flags.first)
            .field("revoked", &flags.revoked)
            .finish()
    }
}

impl BlockerHandle {
    fn new(deadline: Option<Timespec>) -> Self {
        Self(Arc::new(BlockerCell {
            flags: Mutex::new(Flags::default()),
            wake: Condvar::new(),
            deadline,
        }))
    }

    /// Whether both handles refer to the same blocker.
    pub fn same_as(&self, other: &BlockerHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn deadline(&self) -> Option<Timespec> {
        self.0.deadline
    }

    pub fn is_blocked(&self) -> bool {
        self.0.flags.lock().blocked
    }

    pub fn is_signaled(&self) -> bool {
        self.0.flags.lock().signaled
    }

    pub fn is_timed_out(&self) -> bool {
        self.0.flags.lock().timed_out
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.flags.lock().cancelled
    }

    /// The event that won the wakeup, if any.
    pub fn first_wake(&self) -> Option<Wake> {
        self.0.flags.lock().first
    }

    /// Ends the wait. Signaling twice is a protocol violation.
    #[track_caller]
    pub fn signal(&self, guard: &mut BigLockGuard<'_>) {
        let mut flags = self.0.flags.lock();
        if flags.signaled {
            drop(flags);
            guard.fatal(Violation::DoubleSignal);
        }
        flags.signaled = true;
        self.latch(flags, guard, Wake::Signaled);
    }

    /// Ends the wait because its deadline was reached.
    #[track_caller]
    pub fn signal_timeout(&self, guard: &mut BigLockGuard<'_>) {
        let mut flags = self.0.flags.lock();
        if flags.timed_out {
            drop(flags);
            guard.fatal(Violation::DoubleTimeoutSignal);
        }
        flags.timed_out = true;
        guard.metrics().timeouts_fired.inc();
        self.latch(flags, guard, Wake::TimedOut);
    }

    /// Ends the wait because the waiting thread is being cancelled.
    /// Cancelling an already cancelled blocker does nothing.
    pub fn cancel(&self, guard: &mut BigLockGuard<'_>) {
        let mut flags = self.0.flags.lock();
        if flags.cancelled {
            return;
        }
        flags.cancelled = true;
        self.latch(flags, guard, Wake::Cancelled);
    }

    fn latch(
        &self,
        mut flags: parking_lot::MutexGuard<'_, Flags>,
        guard: &mut BigLockGuard<'_>,
        wake: Wake,
    ) {
        if flags.first.is_some() {
            return;
        }
        flags.first = Some(wake);
        let blocked = flags.blocked;
        drop(flags);
        if blocked {
            guard.report_about_to_wake();
        }
        self.0.wake.notify_one();
    }

    /// Withdraws the about-to-wake status of a signaled, still blocked
    /// waiter whose prize was taken by another thread. The waiter still
    /// resumes, but counts as blocked until it re-reports.
    #[track_caller]
    pub fn revoke_wakeup(&self, guard: &mut BigLockGuard<'_>) {
        let mut flags = self.0.flags.lock();
        if !flags.blocked || flags.first != Some(Wake::Signaled) || flags.revoked {
            drop(flags);
            guard.fatal(Violation::RevokeWithoutWakeup);
        }
        flags.revoked = true;
        drop(flags);
        guard.undo_report_about_to_wake();
    }

    /// Gives a revoked waiter its wakeup back.
    #[track_caller]
    pub fn restore_wakeup(&self, guard: &mut BigLockGuard<'_>) {
        let mut flags = self.0.flags.lock();
        if !flags.revoked {
            drop(flags);
            guard.fatal(Violation::RestoreWithoutRevoke);
        }
        flags.revoked = false;
        drop(flags);
        guard.report_about_to_wake();
    }

    pub(crate) fn set_timeout_key(&self, key: Option<TimeoutKey>) {
        self.0.flags.lock().timeout_key = key;
    }

    pub(crate) fn take_timeout_key(&self) -> Option<TimeoutKey> {
        self.0.flags.lock().timeout_key.take()
    }

    #[track_caller]
    fn block_on(
        &self,
        guard: &mut BigLockGuard<'_>,
        unlock: Option<&dyn BlockingUnlock>,
        point: CancelPoint,
    ) -> Result<Wake, TfcError> {
        let ctx = match point {
            CancelPoint::Cancellable => ThreadContext::current(),
            CancelPoint::NotCancellable => None,
        };

        {
            let mut flags = self.0.flags.lock();
            if flags.blocked {
                drop(flags);
                guard.fatal(Violation::DoubleBlock);
            }
            match flags.first {
                Some(Wake::Cancelled) => return Err(TfcError::Cancelled),
                Some(wake) => return Ok(wake),
                None => {}
            }
            if ctx.as_ref().is_some_and(|ctx| ctx.is_cancel_requested()) {
                return Err(TfcError::Cancelled);
            }
            flags.blocked = true;
            flags.fatal_mode = guard.arbiter().fatal_mode();
        }

        if let Some(unlock) = unlock {
            unlock.unlock_for_wait(guard);
        }
        if let Some(ctx) = &ctx {
            ctx.park(self.clone());
        }

        let timeout = self.0.deadline.is_some().then_some(self);
        guard.report_blocked_begin(timeout);
        let wake = self.wait_for_wake(guard);

        if let Some(ctx) = &ctx {
            ctx.unpark();
        }
        let revoked = std::mem::take(&mut self.0.flags.lock().revoked);
        if revoked {
            guard.report_about_to_wake();
        }
        guard.report_blocked_end(timeout);
        self.0.flags.lock().blocked = false;

        if let Some(unlock) = unlock {
            unlock.relock_after_wait(guard);
        }
        match wake {
            Wake::Cancelled => Err(TfcError::Cancelled),
            wake => Ok(wake),
        }
    }

    fn wait_for_wake(&self, guard: &mut BigLockGuard<'_>) -> Wake {
        loop {
            if let Some(wake) = self.0.flags.lock().first {
                return wake;
            }
            self.0.wake.wait(&mut guard.state);
        }
    }
}

fn check_not_blocked(handle: &BlockerHandle) {
    let flags = handle.0.flags.lock();
    // A fatal error unwinding through `block` leaves the flag set.
    if flags.blocked && !thread::panicking() {
        let mode = flags.fatal_mode;
        drop(flags);
        raise(mode, Violation::BlockerDroppedWhileBlocked);
    }
}

/// A wait that only ends by signal (or cancellation).
#[derive(Debug)]
pub struct ThreadBlocker {
    handle: BlockerHandle,
}

impl Default for ThreadBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadBlocker {
    pub fn new() -> Self {
        Self {
            handle: BlockerHandle::new(None),
        }
    }

    pub fn handle(&self) -> BlockerHandle {
        self.handle.clone()
    }

    #[track_caller]
    pub fn signal(&self, guard: &mut BigLockGuard<'_>) {
        self.handle.signal(guard);
    }

    /// Waits until signaled. Returns at once if already signaled.
    ///
    /// `unlock` is released after the thread is marked blocked and
    /// re-acquired after the wait ends.
    #[track_caller]
    pub fn block(
        &self,
        guard: &mut BigLockGuard<'_>,
        unlock: Option<&dyn BlockingUnlock>,
        point: CancelPoint,
    ) -> Result<(), TfcError> {
        self.handle.block_on(guard, unlock, point).map(|_| ())
    }
}

impl Drop for ThreadBlocker {
    fn drop(&mut self) {
        check_not_blocked(&self.handle);
    }
}

/// A wait that also ends when the virtual monotonic clock reaches `deadline`.
#[derive(Debug)]
pub struct TimeoutThreadBlocker {
    handle: BlockerHandle,
}

impl TimeoutThreadBlocker {
    pub fn new(deadline: Timespec) -> Self {
        Self {
            handle: BlockerHandle::new(Some(deadline)),
        }
    }

    pub fn handle(&self) -> BlockerHandle {
        self.handle.clone()
    }

    pub fn deadline(&self) -> Timespec {
        // Always set for this blocker kind.
        self.handle.deadline().unwrap_or_default()
    }

    #[track_caller]
    pub fn signal(&self, guard: &mut BigLockGuard<'_>) {
        self.handle.signal(guard);
    }

    /// Waits until signaled or timed out. Returns `true` if the timeout won.
    #[track_caller]
    pub fn block(
        &self,
        guard: &mut BigLockGuard<'_>,
        unlock: Option<&dyn BlockingUnlock>,
        point: CancelPoint,
    ) -> Result<bool, TfcError> {
        self.handle
            .block_on(guard, unlock, point)
            .map(|wake| wake == Wake::TimedOut)
    }
}

impl Drop for TimeoutThreadBlocker {
    fn drop(&mut self) {
        check_not_blocked(&self.handle);
    }
}
