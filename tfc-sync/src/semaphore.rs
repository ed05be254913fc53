//! Managed counting semaphore.
//!
//! A `post` with waiters present does not touch the count. It hands a
//! release token to the waiters instead, and exactly one waiter is in flight
//! (signaled, not yet resumed) at any time. Each resuming waiter consumes a
//! token and, if tokens remain, releases the next waiter. Tokens left over
//! after waiters were cancelled go back to the count, which never exceeds
//! the maximum.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{trace, warn};

use tfc_core::blocker::{BlockerHandle, CancelPoint, ThreadBlocker};
use tfc_core::{Arbiter, BigLockGuard, TfcError};

#[derive(Default)]
struct SemState {
    count: usize,
    waiters: VecDeque<BlockerHandle>,
    in_flight: Option<BlockerHandle>,
    to_be_released: usize,
}

impl SemState {
    /// Waiters that will still consume a token. Queued waiters whose wait
    /// already ended are on their way out and do not count.
    fn demand(&self) -> usize {
        let queued = self
            .waiters
            .iter()
            .filter(|waiter| waiter.first_wake().is_none())
            .count();
        queued + usize::from(self.in_flight.is_some())
    }

    fn is_in_flight(&self, blocker: &BlockerHandle) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.same_as(blocker))
    }
}

#[derive(Debug)]
pub struct Semaphore {
    arbiter: Arc<Arbiter>,
    state: parking_lot::Mutex<SemState>,
    max: usize,
}

impl std::fmt::Debug for SemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemState")
            .field("count", &self.count)
            .field("waiters", &self.waiters.len())
            .field("to_be_released", &self.to_be_released)
            .finish()
    }
}

impl Semaphore {
    /// Creates a semaphore on the process-wide arbiter.
    pub fn new(initial: usize) -> Self {
        Self::with_arbiter(&Arbiter::global(), initial)
    }

    pub fn with_arbiter(arbiter: &Arc<Arbiter>, initial: usize) -> Self {
        Self {
            arbiter: Arc::clone(arbiter),
            state: parking_lot::Mutex::new(SemState {
                count: initial,
                ..SemState::default()
            }),
            max: usize::MAX,
        }
    }

    /// Creates a semaphore whose count may never exceed `max`.
    pub fn with_max(arbiter: &Arc<Arbiter>, initial: usize, max: usize) -> Result<Self, TfcError> {
        if initial > max {
            return Err(TfcError::SemaphoreOverflow { max });
        }
        Ok(Self {
            max,
            ..Self::with_arbiter(arbiter, initial)
        })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Current count, not including tokens already promised to waiters.
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Increments the semaphore, releasing one waiter if any waits.
    pub fn post(&self) -> Result<(), TfcError> {
        let mut big = self.arbiter.lock();
        let mut state = self.state.lock();
        self.settle(&mut state, &mut big);
        if state.to_be_released < state.demand() {
            state.to_be_released += 1;
            trace!(to_be_released = state.to_be_released, "semaphore token queued");
            if state.in_flight.is_none() {
                Self::release_next(&mut state, &mut big);
            }
            return Ok(());
        }
        if state.count >= self.max {
            return Err(TfcError::SemaphoreOverflow { max: self.max });
        }
        state.count += 1;
        Ok(())
    }

    /// Decrements the semaphore, blocking while it is zero.
    ///
    /// A cancellation point.
    pub fn wait(&self) -> Result<(), TfcError> {
        let mut big = self.arbiter.lock();
        let blocker = {
            let mut state = self.state.lock();
            if state.count > 0 {
                state.count -= 1;
                return Ok(());
            }
            let blocker = ThreadBlocker::new();
            state.waiters.push_back(blocker.handle());
            blocker
        };

        let result = blocker.block(&mut big, None, CancelPoint::Cancellable);
        self.resume(&mut big, &blocker.handle(), result.is_ok());
        result
    }

    /// Bookkeeping for a waiter leaving `wait`, woken by a token or not.
    fn resume(&self, big: &mut BigLockGuard<'_>, handle: &BlockerHandle, got_token: bool) {
        let mut state = self.state.lock();
        if got_token {
            // Only `release_next` signals, and it makes the waiter in flight.
            state.in_flight = None;
            state.to_be_released -= 1;
        } else {
            state.waiters.retain(|waiter| !waiter.same_as(handle));
            if state.is_in_flight(handle) {
                state.in_flight = None;
            }
        }
        self.settle(&mut state, big);
    }

    /// Decrements the semaphore if that does not require blocking.
    pub fn try_wait(&self) -> bool {
        let _big = self.arbiter.lock();
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    fn release_next(state: &mut SemState, big: &mut BigLockGuard<'_>) {
        while let Some(next) = state.waiters.pop_front() {
            // Cancelled waiters still in the queue remove themselves later.
            if next.first_wake().is_some() {
                continue;
            }
            next.signal(big);
            state.in_flight = Some(next);
            return;
        }
    }

    fn settle(&self, state: &mut SemState, big: &mut BigLockGuard<'_>) {
        let excess = state.to_be_released.saturating_sub(state.demand());
        if excess > 0 {
            state.to_be_released -= excess;
            let room = self.max - state.count;
            if excess > room {
                warn!(
                    dropped = excess - room,
                    max = self.max,
                    "semaphore tokens of cancelled waiters exceed the maximum"
                );
            }
            state.count += excess.min(room);
        }
        if state.in_flight.is_none() && state.to_be_released > 0 {
            Self::release_next(state, big);
        }
    }
}
