//! # tfc-core
//!
//! Time-flow control: run threaded code against virtual clocks that only
//! move when every managed thread is blocked.
//!
//! ### Guarantees:
//! - No clock advance while any managed thread can still make progress
//! - No lost wakeups: signal and wait are serialized by one big lock
//! - A full stop with no pending timeout and no pending cancellation is a deadlock
//!
//! ### Key Submodules:
//! - `time`: Virtual realtime/monotonic clock pair
//! - `arbiter`: Thread accounting, quiescence resolution, traps
//! - `blocker`: Single waits ended by signal, timeout or cancellation
//! - `context`: Per-thread deferred cancellation

pub mod arbiter;
pub mod blocker;
pub mod context;
pub mod error;
pub mod time;

pub mod prelude {
    pub use crate::arbiter::{Arbiter, ArbiterSnapshot, BigLockGuard, Trap};
    pub use crate::blocker::{
        BlockerHandle, BlockingUnlock, CancelPoint, ThreadBlocker, TimeoutThreadBlocker, Wake,
    };
    pub use crate::context::{testcancel, ThreadContext};
    pub use crate::error::{TfcError, Violation};
    pub use crate::time::{ClockId, Timespec, VirtualClock};
}

pub use arbiter::{Arbiter, ArbiterSnapshot, BigLockGuard, Trap};
pub use error::{TfcError, Violation};
