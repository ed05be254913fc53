//! Virtual sleep. Both functions are cancellation points.

use std::time::Duration;

use tfc_core::blocker::{CancelPoint, TimeoutThreadBlocker};
use tfc_core::context::testcancel;
use tfc_core::time::Timespec;
use tfc_core::{Arbiter, TfcError};

/// Sleeps for `duration` of virtual monotonic time.
pub fn sleep_for(arbiter: &Arbiter, duration: Duration) -> Result<(), TfcError> {
    if duration.is_zero() {
        return testcancel();
    }
    let deadline = arbiter.deadline_after(duration)?;
    sleep_until(arbiter, deadline)
}

/// Sleeps until the virtual monotonic clock reaches `deadline`.
/// A deadline already reached returns at once.
pub fn sleep_until(arbiter: &Arbiter, deadline: Timespec) -> Result<(), TfcError> {
    arbiter.check_deadline(deadline)?;
    let blocker = TimeoutThreadBlocker::new(deadline);
    let mut big = arbiter.lock();
    blocker
        .block(&mut big, None, CancelPoint::Cancellable)
        .map(|_| ())
}
