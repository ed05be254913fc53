//! Anomaly detectors for reproducibility hazards.
//!
//! A trap only records that its anomaly happened; tests query and reset it
//! with [`Arbiter::take_trap`](crate::Arbiter::take_trap).

/// The three detectable anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trap {
    /// A thread blocked with a deadline that had already passed.
    ExpiredDeadline,
    /// Two or more threads blocked until exactly the same deadline.
    SameDeadline,
    /// One clock advance resumed two or more threads.
    SimultaneousResume,
}

impl Trap {
    pub const ALL: [Trap; 3] = [
        Trap::ExpiredDeadline,
        Trap::SameDeadline,
        Trap::SimultaneousResume,
    ];

    fn index(self) -> usize {
        match self {
            Trap::ExpiredDeadline => 0,
            Trap::SameDeadline => 1,
            Trap::SimultaneousResume => 2,
        }
    }
}

#[derive(Default, Clone, Copy)]
struct Detector {
    enabled: bool,
    tripped: bool,
}

#[derive(Default)]
pub(crate) struct Traps {
    detectors: [Detector; 3],
}

impl Traps {
    pub(crate) fn is_enabled(&self, trap: Trap) -> bool {
        self.detectors[trap.index()].enabled
    }

    /// Returns `false` if the trap was already enabled.
    pub(crate) fn enable(&mut self, trap: Trap) -> bool {
        let detector = &mut self.detectors[trap.index()];
        if detector.enabled {
            return false;
        }
        *detector = Detector {
            enabled: true,
            tripped: false,
        };
        true
    }

    /// Returns `false` if the trap was not enabled.
    pub(crate) fn disable(&mut self, trap: Trap) -> bool {
        let detector = &mut self.detectors[trap.index()];
        if !detector.enabled {
            return false;
        }
        detector.enabled = false;
        true
    }

    /// Records an occurrence. Returns whether the trap is watching.
    pub(crate) fn trip(&mut self, trap: Trap) -> bool {
        let detector = &mut self.detectors[trap.index()];
        if detector.enabled {
            detector.tripped = true;
        }
        detector.enabled
    }

    pub(crate) fn take(&mut self, trap: Trap) -> bool {
        std::mem::take(&mut self.detectors[trap.index()].tripped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_trap_records_nothing() {
        let mut traps = Traps::default();
        assert!(!traps.trip(Trap::SameDeadline));
        assert!(!traps.take(Trap::SameDeadline));
    }

    #[test]
    fn take_resets() {
        let mut traps = Traps::default();
        assert!(traps.enable(Trap::ExpiredDeadline));
        assert!(!traps.enable(Trap::ExpiredDeadline));
        traps.trip(Trap::ExpiredDeadline);
        assert!(traps.take(Trap::ExpiredDeadline));
        assert!(!traps.take(Trap::ExpiredDeadline));
        assert!(traps.disable(Trap::ExpiredDeadline));
        assert!(!traps.disable(Trap::ExpiredDeadline));
    }
}
