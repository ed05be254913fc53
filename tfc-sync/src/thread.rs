//! Managed threads.
//!
//! A managed thread is registered with the arbiter before the OS thread
//! exists, so the arbiter can never see a full stop while a thread is still
//! being spawned. When the thread's function returns (or panics) the thread
//! reports itself blocked: waiting to be joined is an indefinite wait like
//! any other. Joining ends that wait and unregisters the thread.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};
use validator::Validate;

use tfc_config::{ConfigError, ThreadConfig};
use tfc_core::blocker::{BlockerHandle, CancelPoint, ThreadBlocker};
use tfc_core::context::ThreadContext;
use tfc_core::{Arbiter, TfcError, Violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    NoThreadOrJoined,
    Starting,
    Running,
    Terminated,
}

impl ThreadState {
    fn as_str(self) -> &'static str {
        match self {
            ThreadState::NoThreadOrJoined => "no thread or joined",
            ThreadState::Starting => "starting",
            ThreadState::Running => "running",
            ThreadState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the joining thread knows about the thread it joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinAdvice {
    /// The target may still need virtual time to pass before it finishes.
    #[default]
    MayBlock,
    /// The target has finished, or will finish without any clock advance.
    WillNotBlockPermanently,
}

struct Lifecycle {
    state: ThreadState,
    join_waiter: Option<BlockerHandle>,
}

type Outcome<T> = Result<T, Box<dyn Any + Send + 'static>>;

/// A reusable managed thread object: start, join, start again.
pub struct Thread<T> {
    arbiter: Arc<Arbiter>,
    name: String,
    lifecycle: Arc<parking_lot::Mutex<Lifecycle>>,
    context: Option<Arc<ThreadContext>>,
    handle: Option<JoinHandle<Outcome<T>>>,
}

impl<T> fmt::Debug for Thread<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Thread<T> {
    /// Creates a thread object on the process-wide arbiter.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_arbiter(&Arbiter::global(), name)
    }

    pub fn with_arbiter(arbiter: &Arc<Arbiter>, name: impl Into<String>) -> Self {
        Self {
            arbiter: Arc::clone(arbiter),
            name: name.into(),
            lifecycle: Arc::new(parking_lot::Mutex::new(Lifecycle {
                state: ThreadState::NoThreadOrJoined,
                join_waiter: None,
            })),
            context: None,
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.lifecycle.lock().state
    }
}

impl<T: Send + 'static> Thread<T> {
    /// Starts `f` on a new OS thread with the arbiter's default thread
    /// configuration.
    #[track_caller]
    pub fn start<F>(&mut self, f: F) -> Result<(), TfcError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let defaults = self.arbiter.thread_defaults().clone();
        self.start_with(f, &defaults)
    }

    /// Starts `f` on a new OS thread.
    ///
    /// Starting a thread object that has a thread which was not joined yet
    /// is a protocol violation.
    #[track_caller]
    pub fn start_with<F>(&mut self, f: F, config: &ThreadConfig) -> Result<(), TfcError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        config.validate().map_err(ConfigError::from)?;

        let mut big = self.arbiter.lock();
        let state = self.state();
        if state != ThreadState::NoThreadOrJoined {
            big.fatal(Violation::ThreadNotStartable(state.as_str()));
        }
        big.report_new_thread()?;
        self.lifecycle.lock().state = ThreadState::Starting;

        let context = ThreadContext::new(self.name.clone());
        let trampoline = {
            let arbiter = Arc::clone(&self.arbiter);
            let lifecycle = Arc::clone(&self.lifecycle);
            let context = Arc::clone(&context);
            move || run_managed(&arbiter, &lifecycle, &context, f)
        };

        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }
        match builder.spawn(trampoline) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.context = Some(context);
                info!(thread = %self.name, policy = ?config.policy, "managed thread started");
                Ok(())
            }
            Err(e) => {
                big.report_thread_termination();
                self.lifecycle.lock().state = ThreadState::NoThreadOrJoined;
                warn!(thread = %self.name, error = %e, "managed thread spawn failed");
                Err(TfcError::Spawn(e))
            }
        }
    }

    /// Waits for the thread to terminate and collects its result.
    ///
    /// With [`JoinAdvice::MayBlock`] the wait is a cancellation point and
    /// counts as blocked for the arbiter. A panic of the thread is reported
    /// as [`TfcError::ThreadPanicked`].
    #[track_caller]
    pub fn join(&mut self, advice: JoinAdvice) -> Result<T, TfcError> {
        let mut big = self.arbiter.lock();
        let state = self.state();
        if state == ThreadState::NoThreadOrJoined {
            big.fatal(Violation::NothingToJoin(state.as_str()));
        }
        let target = self.handle.as_ref().map(|handle| handle.thread().id());
        if target == Some(thread::current().id()) {
            big.fatal(Violation::SelfJoin);
        }

        if advice == JoinAdvice::MayBlock && state != ThreadState::Terminated {
            let blocker = ThreadBlocker::new();
            self.lifecycle.lock().join_waiter = Some(blocker.handle());
            if let Err(e) = blocker.block(&mut big, None, CancelPoint::Cancellable) {
                self.lifecycle.lock().join_waiter = None;
                return Err(e);
            }
        }
        drop(big);

        let outcome = match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(Err),
            None => Err(Box::new("missing join handle") as Box<dyn Any + Send>),
        };

        let mut big = self.arbiter.lock();
        // The terminated thread counted itself blocked; this join ends that wait.
        big.report_about_to_wake();
        big.report_blocked_end(None);
        big.report_thread_termination();
        self.lifecycle.lock().state = ThreadState::NoThreadOrJoined;
        self.context = None;
        drop(big);

        info!(thread = %self.name, "managed thread joined");
        outcome.map_err(|_| TfcError::ThreadPanicked(self.name.clone()))
    }

    /// Requests deferred cancellation. Returns `false` if a request is
    /// already pending or the thread already finished.
    pub fn cancel(&self) -> bool {
        let mut big = self.arbiter.lock();
        match &self.context {
            Some(context) => context.request_cancellation(&mut big),
            None => false,
        }
    }
}

impl<T> Drop for Thread<T> {
    fn drop(&mut self) {
        if self.handle.is_some() && !thread::panicking() {
            warn!(
                thread = %self.name,
                "managed thread dropped without join; it stays counted as live"
            );
        }
    }
}

fn run_managed<T, F>(
    arbiter: &Arbiter,
    lifecycle: &parking_lot::Mutex<Lifecycle>,
    context: &Arc<ThreadContext>,
    f: F,
) -> Outcome<T>
where
    F: FnOnce() -> T,
{
    let _entered = context.enter();
    {
        let _big = arbiter.lock();
        lifecycle.lock().state = ThreadState::Running;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    if outcome.is_err() {
        warn!(thread = %context.name(), "managed thread panicked");
    }

    let mut big = arbiter.lock();
    let join_waiter = {
        let mut lifecycle = lifecycle.lock();
        lifecycle.state = ThreadState::Terminated;
        lifecycle.join_waiter.take()
    };
    context.finish_cancellation(&mut big);
    if let Some(waiter) = join_waiter {
        waiter.signal(&mut big);
    }
    big.report_blocked_begin(None);
    outcome
}
