//! Managed mutex.
//!
//! Waiters queue FIFO. `unlock` hands the lock to the front waiter by
//! signaling it; until that waiter resumes it is about to wake and the
//! handoff is pending. Any thread that claims the free mutex in that window,
//! by `lock` or `try_lock`, steals it: the pending waiter's wakeup is revoked
//! and the waiter re-blocks at the front of the queue when it resumes. When
//! the stealer unlocks, the wakeup is restored instead of waking someone new.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::trace;

use tfc_core::blocker::{BlockerHandle, BlockingUnlock, CancelPoint, ThreadBlocker};
use tfc_core::{Arbiter, BigLockGuard, Violation};

struct Handoff {
    waiter: BlockerHandle,
    revoked: bool,
}

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    waiters: VecDeque<BlockerHandle>,
    handoff: Option<Handoff>,
}

/// A mutual exclusion lock whose waits are accounted by the arbiter.
///
/// Locking is not a cancellation point.
pub struct Mutex<T: ?Sized> {
    arbiter: Arc<Arbiter>,
    state: parking_lot::Mutex<LockState>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the lock protocol below; the
// value moves between threads with the lock, hence `T: Send`.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a mutex on the process-wide arbiter.
    pub fn new(value: T) -> Self {
        Self::with_arbiter(&Arbiter::global(), value)
    }

    pub fn with_arbiter(arbiter: &Arc<Arbiter>, value: T) -> Self {
        Self {
            arbiter: Arc::clone(arbiter),
            state: parking_lot::Mutex::new(LockState::default()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn arbiter(&self) -> &Arc<Arbiter> {
        &self.arbiter
    }

    /// Acquires the mutex, blocking the calling thread until it is free.
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut big = self.arbiter.lock();
        self.lock_locked(&mut big);
        drop(big);
        MutexGuard::new(self)
    }

    /// Acquires the mutex if it is free, stealing a pending handoff.
    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut big = self.arbiter.lock();
        let acquired = self.try_lock_locked(&mut big);
        drop(big);
        acquired.then(|| MutexGuard::new(self))
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    #[track_caller]
    pub(crate) fn lock_locked(&self, big: &mut BigLockGuard<'_>) {
        big.assert_owned_by(&self.arbiter);
        let me = thread::current().id();
        let mut requeue_front = false;
        loop {
            let blocker = {
                let mut state = self.state.lock();
                if state.owner == Some(me) {
                    drop(state);
                    big.fatal(Violation::RecursiveLock);
                }
                if state.owner.is_none() {
                    self.claim(&mut state, big, me);
                    return;
                }
                let blocker = ThreadBlocker::new();
                if requeue_front {
                    state.waiters.push_front(blocker.handle());
                } else {
                    state.waiters.push_back(blocker.handle());
                }
                blocker
            };

            // Not a cancellation point, so only a signal ends the wait.
            let _ = blocker.block(big, None, CancelPoint::NotCancellable);

            let mut state = self.state.lock();
            if state
                .handoff
                .as_ref()
                .is_some_and(|handoff| handoff.waiter.same_as(&blocker.handle()))
            {
                state.handoff = None;
            }
            // A stolen handoff keeps this thread first in line.
            requeue_front = true;
        }
    }

    #[track_caller]
    pub(crate) fn try_lock_locked(&self, big: &mut BigLockGuard<'_>) -> bool {
        big.assert_owned_by(&self.arbiter);
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner.is_some() {
            return false;
        }
        self.claim(&mut state, big, me);
        true
    }

    #[track_caller]
    pub(crate) fn unlock_locked(&self, big: &mut BigLockGuard<'_>) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            drop(state);
            big.fatal(Violation::UnlockNotOwner);
        }
        state.owner = None;

        if let Some(handoff) = state.handoff.as_mut() {
            // A woken waiter has not resumed yet. Unless this thread stole the
            // handoff there is nothing to do; the waiter claims on resume.
            if handoff.revoked {
                handoff.revoked = false;
                let waiter = handoff.waiter.clone();
                drop(state);
                trace!("returning stolen handoff");
                waiter.restore_wakeup(big);
            }
            return;
        }
        if let Some(next) = state.waiters.pop_front() {
            state.handoff = Some(Handoff {
                waiter: next.clone(),
                revoked: false,
            });
            drop(state);
            next.signal(big);
        }
    }

    fn claim(&self, state: &mut LockState, big: &mut BigLockGuard<'_>, me: ThreadId) {
        state.owner = Some(me);
        if let Some(handoff) = state.handoff.as_mut().filter(|handoff| !handoff.revoked) {
            handoff.revoked = true;
            trace!("mutex handoff stolen");
            handoff.waiter.revoke_wakeup(big);
        }
    }
}

impl<T: ?Sized> BlockingUnlock for Mutex<T> {
    fn unlock_for_wait(&self, guard: &mut BigLockGuard<'_>) {
        self.unlock_locked(guard);
    }

    fn relock_after_wait(&self, guard: &mut BigLockGuard<'_>) {
        self.lock_locked(guard);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mutex")
            .field("locked", &state.owner.is_some())
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII lock ownership. Unlocks on drop.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    // Ownership is tied to the locking thread.
    _not_send: PhantomData<*const ()>,
}

// SAFETY: a shared guard only hands out `&T`.
unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while this thread owns the mutex.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` rules out aliasing through the guard.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let mut big = self.mutex.arbiter.lock();
        self.mutex.unlock_locked(&mut big);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
