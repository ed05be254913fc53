//! Deadline-ordered set of blocked timed waits.
//!
//! Entries are keyed by `(deadline, insertion sequence)`, so a new entry
//! whose deadline equals existing ones lands after them: ties resolve FIFO.

use std::collections::BTreeMap;

use crate::blocker::BlockerHandle;
use crate::time::Timespec;

/// Identity of one entry in [`PendingTimeouts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeoutKey {
    pub deadline: Timespec,
    seq: u64,
}

#[derive(Default)]
pub(crate) struct PendingTimeouts {
    entries: BTreeMap<TimeoutKey, BlockerHandle>,
    next_seq: u64,
}

impl PendingTimeouts {
    pub(crate) fn insert(&mut self, deadline: Timespec, blocker: BlockerHandle) -> TimeoutKey {
        let key = TimeoutKey {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.insert(key, blocker);
        key
    }

    pub(crate) fn remove(&mut self, key: &TimeoutKey) -> Option<BlockerHandle> {
        self.entries.remove(key)
    }

    pub(crate) fn contains_deadline(&self, deadline: Timespec) -> bool {
        let from = TimeoutKey { deadline, seq: 0 };
        self.entries
            .range(from..)
            .next()
            .is_some_and(|(key, _)| key.deadline == deadline)
    }

    pub(crate) fn pop_first(&mut self) -> Option<(TimeoutKey, BlockerHandle)> {
        self.entries.pop_first()
    }

    /// Removes the earliest entry if its deadline is exactly `deadline`.
    pub(crate) fn pop_due_at(&mut self, deadline: Timespec) -> Option<BlockerHandle> {
        let first = self.entries.first_key_value().map(|(key, _)| *key)?;
        if first.deadline == deadline {
            self.entries.remove(&first)
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocker::TimeoutThreadBlocker;

    fn at(secs: u64) -> Timespec {
        Timespec::new(secs, 0).unwrap()
    }

    fn entry(secs: u64) -> (Timespec, TimeoutThreadBlocker) {
        (at(secs), TimeoutThreadBlocker::new(at(secs)))
    }

    #[test]
    fn orders_by_deadline_then_insertion() {
        let mut pending = PendingTimeouts::default();
        let (d3, b3) = entry(3);
        let (d1, b1) = entry(1);
        let (d1_late, b1_late) = entry(1);
        pending.insert(d3, b3.handle());
        pending.insert(d1, b1.handle());
        pending.insert(d1_late, b1_late.handle());

        let (_, first) = pending.pop_first().unwrap();
        assert!(first.same_as(&b1.handle()));
        assert!(pending.pop_due_at(at(1)).unwrap().same_as(&b1_late.handle()));
        assert!(pending.pop_due_at(at(1)).is_none());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn finds_equal_deadlines() {
        let mut pending = PendingTimeouts::default();
        let (d2, b2) = entry(2);
        let key = pending.insert(d2, b2.handle());
        assert!(pending.contains_deadline(at(2)));
        assert!(!pending.contains_deadline(at(1)));
        assert!(!pending.contains_deadline(at(3)));
        assert!(pending.remove(&key).is_some());
        assert_eq!(pending.len(), 0);
    }
}
