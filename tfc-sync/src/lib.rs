//! # tfc-sync
//!
//! Blocking primitives that report every wait to the time-flow arbiter.
//! Code written against these instead of `std::sync` runs on virtual time:
//! a sleep of an hour finishes as soon as every other managed thread is
//! blocked too.
//!
//! Each primitive binds to one [`Arbiter`](tfc_core::Arbiter), either the
//! process-wide one (`new`) or an explicit one (`with_arbiter`).

mod condvar;
mod mutex;
mod semaphore;
mod sleep;
mod thread;

#[cfg(test)]
mod scenarios;

pub use condvar::ConditionVariable;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use sleep::{sleep_for, sleep_until};
pub use thread::{JoinAdvice, Thread, ThreadState};

pub use tfc_core::context::testcancel;
pub use tfc_core::{Arbiter, TfcError};
