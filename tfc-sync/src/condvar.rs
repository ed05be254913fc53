//! Managed condition variable.
//!
//! Every wait registers a fresh blocker. `signal` wakes the most recently
//! registered waiter that is still waiting; `broadcast` wakes all of them.

use std::sync::Arc;
use std::time::Duration;

use tfc_core::blocker::{BlockerHandle, CancelPoint, ThreadBlocker, TimeoutThreadBlocker};
use tfc_core::time::Timespec;
use tfc_core::{Arbiter, BigLockGuard, TfcError};

use crate::mutex::MutexGuard;

#[derive(Debug)]
pub struct ConditionVariable {
    arbiter: Arc<Arbiter>,
    waiters: parking_lot::Mutex<Vec<BlockerHandle>>,
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionVariable {
    /// Creates a condition variable on the process-wide arbiter.
    pub fn new() -> Self {
        Self::with_arbiter(&Arbiter::global())
    }

    pub fn with_arbiter(arbiter: &Arc<Arbiter>) -> Self {
        Self {
            arbiter: Arc::clone(arbiter),
            waiters: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Wakes the most recent waiter, if any.
    pub fn signal(&self) {
        let mut big = self.arbiter.lock();
        let mut waiters = self.waiters.lock();
        while let Some(waiter) = waiters.pop() {
            // Skip waits already ended by timeout or cancellation.
            if waiter.first_wake().is_none() {
                waiter.signal(&mut big);
                return;
            }
        }
    }

    pub fn broadcast(&self) {
        let mut big = self.arbiter.lock();
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters.iter().rev() {
            if waiter.first_wake().is_none() {
                waiter.signal(&mut big);
            }
        }
    }

    /// Releases the guard's mutex, waits for a signal and re-locks.
    ///
    /// A cancellation point. The mutex is held again on every return.
    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) -> Result<(), TfcError> {
        let mutex = guard.mutex();
        let mut big = self.lock_for(mutex.arbiter());
        let blocker = ThreadBlocker::new();
        self.waiters.lock().push(blocker.handle());

        let result = blocker.block(&mut big, Some(mutex), CancelPoint::Cancellable);
        if result.is_err() {
            self.forget(&blocker.handle());
        }
        result
    }

    /// Like [`wait`](Self::wait), giving up after `timeout` of virtual time.
    /// Returns `true` if the wait timed out.
    pub fn wait_for<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> Result<bool, TfcError> {
        let deadline = self.arbiter.deadline_after(timeout)?;
        self.wait_until(guard, deadline)
    }

    /// Like [`wait`](Self::wait), giving up when the virtual monotonic clock
    /// reaches `deadline`. Returns `true` if the wait timed out.
    pub fn wait_until<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Timespec,
    ) -> Result<bool, TfcError> {
        self.arbiter.check_deadline(deadline)?;
        let mutex = guard.mutex();
        let mut big = self.lock_for(mutex.arbiter());
        let blocker = TimeoutThreadBlocker::new(deadline);
        self.waiters.lock().push(blocker.handle());

        let result = blocker.block(&mut big, Some(mutex), CancelPoint::Cancellable);
        if !matches!(result, Ok(false)) {
            self.forget(&blocker.handle());
        }
        result
    }

    fn lock_for(&self, mutex_arbiter: &Arbiter) -> BigLockGuard<'_> {
        let big = self.arbiter.lock();
        big.assert_owned_by(mutex_arbiter);
        big
    }

    fn forget(&self, blocker: &BlockerHandle) {
        self.waiters
            .lock()
            .retain(|waiter| !waiter.same_as(blocker));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JoinAdvice, Mutex, Thread};
    use std::thread;
    use tfc_config::ArbiterConfig;
    use tfc_core::time::ClockId;

    fn test_arbiter() -> Arc<Arbiter> {
        Arbiter::with_config(&ArbiterConfig::for_tests())
    }

    #[test]
    fn timed_wait_advances_clock_and_relocks() {
        let arbiter = test_arbiter();
        let mutex = Mutex::with_arbiter(&arbiter, 0);
        let cond = ConditionVariable::with_arbiter(&arbiter);
        let start = arbiter.now(ClockId::Monotonic);

        let mut guard = mutex.lock();
        let timed_out = cond
            .wait_for(&mut guard, Duration::from_millis(40))
            .unwrap();
        assert!(timed_out);
        assert!(mutex.is_locked());
        *guard += 1;
        drop(guard);

        assert_eq!(
            arbiter.now(ClockId::Monotonic).nanos_since(start),
            Some(40_000_000)
        );
        assert!(cond.waiters.lock().is_empty());
    }

    #[test]
    fn signal_wakes_latest_waiter() {
        let arbiter = test_arbiter();
        let mutex = Arc::new(Mutex::with_arbiter(&arbiter, Vec::new()));
        let cond = Arc::new(ConditionVariable::with_arbiter(&arbiter));

        let mut workers = Vec::new();
        for name in ["first", "second"] {
            arbiter.lock().report_new_thread().unwrap();
            let worker_mutex = Arc::clone(&mutex);
            let worker_cond = Arc::clone(&cond);
            workers.push(thread::spawn(move || {
                let mut guard = worker_mutex.lock();
                worker_cond.wait(&mut guard).unwrap();
                guard.push(name);
            }));
            // Register the waiters in a known order.
            while cond.waiters.lock().len() < workers.len() {
                thread::yield_now();
            }
        }
        while arbiter.snapshot().blocked < 2 {
            thread::yield_now();
        }

        cond.signal();
        while mutex.lock().is_empty() {
            thread::yield_now();
        }
        assert_eq!(*mutex.lock(), vec!["second"]);

        cond.broadcast();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*mutex.lock(), vec!["second", "first"]);

        let mut big = arbiter.lock();
        big.report_thread_termination();
        big.report_thread_termination();
    }

    #[test]
    fn cancelled_wait_relocks_and_restores_counters() {
        let arbiter = test_arbiter();
        let mutex = Arc::new(Mutex::with_arbiter(&arbiter, 0));
        let cond = Arc::new(ConditionVariable::with_arbiter(&arbiter));

        let mut worker = Thread::with_arbiter(&arbiter, "waiter");
        let worker_mutex = Arc::clone(&mutex);
        let worker_cond = Arc::clone(&cond);
        worker
            .start(move || {
                let mut guard = worker_mutex.lock();
                let cancelled = matches!(worker_cond.wait(&mut guard), Err(TfcError::Cancelled));
                let relocked = worker_mutex.is_locked();
                *guard += 1;
                (cancelled, relocked)
            })
            .unwrap();
        while arbiter.snapshot().blocked < 1 {
            thread::yield_now();
        }

        assert!(worker.cancel());
        assert_eq!(worker.join(JoinAdvice::MayBlock).unwrap(), (true, true));
        assert_eq!(*mutex.lock(), 1);
        assert!(cond.waiters.lock().is_empty());

        let snapshot = arbiter.snapshot();
        assert_eq!(
            (
                snapshot.live,
                snapshot.blocked,
                snapshot.about_to_wake,
                snapshot.cancellations_pending
            ),
            (1, 0, 0, 0)
        );
    }

    #[test]
    #[should_panic(expected = "different arbiter")]
    fn mixing_arbiters_is_fatal() {
        let arbiter = test_arbiter();
        let other = test_arbiter();
        let mutex = Mutex::with_arbiter(&arbiter, ());
        let cond = ConditionVariable::with_arbiter(&other);
        let mut guard = mutex.lock();
        let _ = cond.wait(&mut guard);
    }
}
