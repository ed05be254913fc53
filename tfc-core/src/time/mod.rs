//! ## tfc-core::time
//! **Virtual realtime and monotonic clocks**
//!
//! Both clocks are seeded once, from the host or from configured seeds, and
//! afterwards move only when the arbiter advances them. They always advance
//! by the same delta, so the offset between them is fixed for the lifetime
//! of an arbiter.
//!
//! Reading a clock goes through the clock's own lock, never through the big
//! lock, so pure readers do not contend with blocking primitives.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use tfc_config::ClockSeed;

use crate::error::TfcError;

pub const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Selects one of the two virtual clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockId {
    Realtime,
    Monotonic,
}

/// A `(seconds, nanoseconds)` point in time with `nanos < 1e9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timespec {
    secs: u64,
    nanos: u32,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { secs: 0, nanos: 0 };

    /// Returns `None` unless `nanos` is below one second.
    pub const fn new(secs: u64, nanos: u32) -> Option<Self> {
        if nanos < NANOS_PER_SEC {
            Some(Self { secs, nanos })
        } else {
            None
        }
    }

    pub const fn secs(&self) -> u64 {
        self.secs
    }

    pub const fn nanos(&self) -> u32 {
        self.nanos
    }

    /// Adds `delta` nanoseconds, carrying into the seconds field.
    pub fn checked_add_nanos(self, delta: u64) -> Option<Self> {
        let carry_secs = delta / u64::from(NANOS_PER_SEC);
        let mut nanos = self.nanos + (delta % u64::from(NANOS_PER_SEC)) as u32;
        let mut secs = self.secs.checked_add(carry_secs)?;
        if nanos >= NANOS_PER_SEC {
            nanos -= NANOS_PER_SEC;
            secs = secs.checked_add(1)?;
        }
        Some(Self { secs, nanos })
    }

    pub fn checked_add_duration(self, delta: Duration) -> Option<Self> {
        let delta = u64::try_from(delta.as_nanos()).ok()?;
        self.checked_add_nanos(delta)
    }

    /// Nanoseconds from `earlier` to `self`, `None` if `earlier` is later or
    /// the distance does not fit into 64 bits.
    pub fn nanos_since(self, earlier: Timespec) -> Option<u64> {
        let delta = self.total_nanos().checked_sub(earlier.total_nanos())?;
        u64::try_from(delta).ok()
    }

    fn total_nanos(self) -> u128 {
        u128::from(self.secs) * u128::from(NANOS_PER_SEC) + u128::from(self.nanos)
    }
}

impl From<ClockSeed> for Timespec {
    fn from(seed: ClockSeed) -> Self {
        // ClockSeed validation keeps nanos in range; clamp anyway for unvalidated seeds.
        Self {
            secs: seed.secs,
            nanos: seed.nanos.min(NANOS_PER_SEC - 1),
        }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

struct Clocks {
    realtime: Timespec,
    monotonic: Timespec,
}

/// The emulated realtime/monotonic clock pair.
pub struct VirtualClock {
    clocks: Mutex<Clocks>,
}

impl VirtualClock {
    pub fn new(realtime: Timespec, monotonic: Timespec) -> Self {
        Self {
            clocks: Mutex::new(Clocks {
                realtime,
                monotonic,
            }),
        }
    }

    /// Seeds both clocks from the host, falling back to the given seeds.
    pub fn seeded(realtime: Option<ClockSeed>, monotonic: Option<ClockSeed>) -> Self {
        Self::new(
            realtime.map_or_else(host_realtime, Timespec::from),
            monotonic.map_or_else(host_monotonic, Timespec::from),
        )
    }

    /// Current value of the requested clock.
    #[inline]
    pub fn now(&self, which: ClockId) -> Timespec {
        let clocks = self.clocks.lock();
        match which {
            ClockId::Realtime => clocks.realtime,
            ClockId::Monotonic => clocks.monotonic,
        }
    }

    /// Monotonic deadline `timeout` from now. Fails if either clock could not
    /// be advanced that far.
    pub fn deadline_after(&self, timeout: Duration) -> Result<Timespec, TfcError> {
        let clocks = self.clocks.lock();
        let overflow = || TfcError::ClockOverflow(timeout);
        clocks
            .realtime
            .checked_add_duration(timeout)
            .ok_or_else(overflow)?;
        clocks
            .monotonic
            .checked_add_duration(timeout)
            .ok_or_else(overflow)
    }

    /// Checks that advancing the monotonic clock up to `deadline` keeps both
    /// clocks representable. Deadlines already reached always pass.
    pub fn check_reachable(&self, deadline: Timespec) -> Result<(), TfcError> {
        let clocks = self.clocks.lock();
        let Some(delta) = deadline.nanos_since(clocks.monotonic) else {
            return if deadline <= clocks.monotonic {
                Ok(())
            } else {
                Err(TfcError::ClockOverflow(Duration::MAX))
            };
        };
        match clocks.realtime.checked_add_nanos(delta) {
            Some(_) => Ok(()),
            None => Err(TfcError::ClockOverflow(Duration::from_nanos(delta))),
        }
    }

    /// Moves both clocks forward by `delta` nanoseconds. Either both clocks
    /// move or neither does.
    pub(crate) fn advance_by(&self, delta: u64) -> Result<(), TfcError> {
        let mut clocks = self.clocks.lock();
        let overflow = || TfcError::ClockOverflow(Duration::from_nanos(delta));
        let realtime = clocks.realtime.checked_add_nanos(delta).ok_or_else(overflow)?;
        let monotonic = clocks
            .monotonic
            .checked_add_nanos(delta)
            .ok_or_else(overflow)?;
        clocks.realtime = realtime;
        clocks.monotonic = monotonic;
        Ok(())
    }
}

fn host_realtime() -> Timespec {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timespec {
        secs: since_epoch.as_secs(),
        nanos: since_epoch.subsec_nanos(),
    }
}

#[cfg(unix)]
fn host_monotonic() -> Timespec {
    let mut ts = std::mem::MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: clock_gettime only writes into the provided timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) };
    if rc != 0 {
        return Timespec::ZERO;
    }
    // SAFETY: initialised by the successful call above.
    let ts = unsafe { ts.assume_init() };
    Timespec {
        secs: ts.tv_sec.max(0) as u64,
        nanos: (ts.tv_nsec.max(0) as u32).min(NANOS_PER_SEC - 1),
    }
}

#[cfg(not(unix))]
fn host_monotonic() -> Timespec {
    Timespec::ZERO
}
