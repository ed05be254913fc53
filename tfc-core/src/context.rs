//! Per-thread state of managed threads: name and deferred cancellation.
//!
//! Cancellation is cooperative. A request is latched on the target's
//! context and ends the wait the target is parked in, if that wait is a
//! cancellation point. Otherwise it is observed at the next cancellation
//! point, or by an explicit [`testcancel`].

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arbiter::BigLockGuard;
use crate::blocker::BlockerHandle;
use crate::error::TfcError;

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadContext>>> = const { RefCell::new(None) };
}

#[derive(Default)]
struct CancelState {
    requested: bool,
    finished: bool,
    parked: Option<BlockerHandle>,
}

pub struct ThreadContext {
    name: String,
    cancel: Mutex<CancelState>,
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("name", &self.name)
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}

impl ThreadContext {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            cancel: Mutex::new(CancelState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context of the calling thread. `None` on threads not started as
    /// managed threads, the main thread included.
    pub fn current() -> Option<Arc<Self>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Makes `self` the calling thread's context until the returned guard drops.
    pub fn enter(self: &Arc<Self>) -> EnteredContext {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(Arc::clone(self)));
        EnteredContext { previous }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.lock().requested
    }

    /// Latches a cancellation request and interrupts a cancellable wait in
    /// progress. Returns `false` if a request was already pending or the
    /// thread already finished.
    pub fn request_cancellation(&self, guard: &mut BigLockGuard<'_>) -> bool {
        let parked = {
            let mut state = self.cancel.lock();
            if state.requested || state.finished {
                return false;
            }
            state.requested = true;
            state.parked.clone()
        };
        guard.report_cancellation_requested();
        if let Some(blocker) = parked {
            blocker.cancel(guard);
        }
        true
    }

    /// Called once, when the thread terminates. Settles a pending request.
    pub fn finish_cancellation(&self, guard: &mut BigLockGuard<'_>) {
        let requested = {
            let mut state = self.cancel.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            state.parked = None;
            state.requested
        };
        if requested {
            guard.report_cancellation_done();
        }
    }

    pub(crate) fn park(&self, blocker: BlockerHandle) {
        self.cancel.lock().parked = Some(blocker);
    }

    pub(crate) fn unpark(&self) {
        self.cancel.lock().parked = None;
    }
}

/// Restores the previous thread context on drop.
#[must_use = "the context is left as soon as the guard drops"]
pub struct EnteredContext {
    previous: Option<Arc<ThreadContext>>,
}

impl Drop for EnteredContext {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Explicit cancellation point: fails with [`TfcError::Cancelled`] if the
/// calling managed thread has a cancellation request pending.
pub fn testcancel() -> Result<(), TfcError> {
    match ThreadContext::current() {
        Some(ctx) if ctx.is_cancel_requested() => Err(TfcError::Cancelled),
        _ => Ok(()),
    }
}
