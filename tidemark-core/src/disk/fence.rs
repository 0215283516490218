//! Serialization of structural operations
//!
//! `Fence` admits one structural task at a time and queues the rest in
//! submission order. `IoTracker` counts ordinary reads and writes in flight
//! per slot so a structural step can wait until the slots it claims are idle.
//! Both live inside the piece manager's mutex.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::torrent::SlotIndex;

/// FIFO gate admitting one structural task at a time.
#[derive(Debug)]
pub struct Fence<J> {
    raised: bool,
    queue: VecDeque<J>,
}

impl<J> Default for Fence<J> {
    fn default() -> Self {
        Self {
            raised: false,
            queue: VecDeque::new(),
        }
    }
}

impl<J> Fence<J> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_raised(&self) -> bool {
        self.raised
    }

    /// Number of tasks waiting behind the running one.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Raises the fence and hands `job` back to run now, or queues it.
    pub fn raise_or_queue(&mut self, job: J) -> Option<J> {
        if self.raised {
            self.queue.push_back(job);
            None
        } else {
            self.raised = true;
            Some(job)
        }
    }

    /// Signals that the running task finished.
    ///
    /// Returns the next queued task, which now holds the fence; the fence
    /// drops only when nothing is queued.
    ///
    /// # Panics
    ///
    /// Panics if the fence is not raised. A task finishing twice, or without
    /// having been admitted, leaves the slot table unprotected.
    pub fn lower(&mut self) -> Option<J> {
        assert!(self.raised, "fence lowered while not raised");
        let next = self.queue.pop_front();
        self.raised = next.is_some();
        next
    }

    /// Removes every queued task; the running one keeps the fence.
    pub fn drain(&mut self) -> Vec<J> {
        self.queue.drain(..).collect()
    }
}

/// Slots a structural step needs exclusive access to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Every slot, and the file set itself
    Exclusive,
    Slots(BTreeSet<SlotIndex>),
}

impl Claim {
    pub fn slots(slots: impl IntoIterator<Item = SlotIndex>) -> Self {
        Claim::Slots(slots.into_iter().collect())
    }

    pub fn covers(&self, slot: SlotIndex) -> bool {
        match self {
            Claim::Exclusive => true,
            Claim::Slots(slots) => slots.contains(&slot),
        }
    }
}

/// In-flight ordinary I/O per slot plus the active structural claim.
#[derive(Debug, Default)]
pub struct IoTracker {
    in_flight: BTreeMap<SlotIndex, u32>,
    claim: Option<Claim>,
}

impl IoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_io(&mut self, slot: SlotIndex) {
        *self.in_flight.entry(slot).or_insert(0) += 1;
    }

    pub fn end_io(&mut self, slot: SlotIndex) {
        if let Some(count) = self.in_flight.get_mut(&slot) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&slot);
            }
        }
    }

    /// Total operations in flight.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.values().sum()
    }

    /// Whether new I/O on `slot` has to wait for the active claim.
    pub fn is_claimed(&self, slot: SlotIndex) -> bool {
        self.claim.as_ref().is_some_and(|claim| claim.covers(slot))
    }

    pub fn has_claim(&self) -> bool {
        self.claim.is_some()
    }

    pub fn set_claim(&mut self, claim: Claim) {
        self.claim = Some(claim);
    }

    pub fn release_claim(&mut self) {
        self.claim = None;
    }

    /// True when no I/O is in flight on any claimed slot.
    pub fn claim_is_idle(&self) -> bool {
        match &self.claim {
            None => true,
            Some(Claim::Exclusive) => self.in_flight.is_empty(),
            Some(Claim::Slots(slots)) => slots.iter().all(|slot| !self.in_flight.contains_key(slot)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_runs_queued_jobs_in_order() {
        let mut fence = Fence::new();

        assert_eq!(fence.raise_or_queue("rename"), Some("rename"));
        assert_eq!(fence.raise_or_queue("move"), None);
        assert_eq!(fence.raise_or_queue("delete"), None);
        assert_eq!(fence.queued(), 2);

        assert_eq!(fence.lower(), Some("move"));
        assert!(fence.is_raised());
        assert_eq!(fence.lower(), Some("delete"));
        assert_eq!(fence.lower(), None);
        assert!(!fence.is_raised());
    }

    #[test]
    #[should_panic(expected = "fence lowered while not raised")]
    fn test_lowering_unraised_fence_panics() {
        let mut fence: Fence<()> = Fence::new();
        fence.lower();
    }

    #[test]
    fn test_drain_keeps_running_task() {
        let mut fence = Fence::new();
        fence.raise_or_queue(1);
        fence.raise_or_queue(2);
        fence.raise_or_queue(3);

        assert_eq!(fence.drain(), vec![2, 3]);
        assert!(fence.is_raised());
        assert_eq!(fence.lower(), None);
    }

    #[test]
    fn test_claim_waits_for_in_flight_io() {
        let mut tracker = IoTracker::new();
        tracker.begin_io(SlotIndex::new(1));
        tracker.begin_io(SlotIndex::new(4));

        tracker.set_claim(Claim::slots([SlotIndex::new(2), SlotIndex::new(4)]));
        assert!(tracker.is_claimed(SlotIndex::new(4)));
        assert!(!tracker.is_claimed(SlotIndex::new(1)));
        assert!(!tracker.claim_is_idle());

        tracker.end_io(SlotIndex::new(4));
        assert!(tracker.claim_is_idle());

        tracker.set_claim(Claim::Exclusive);
        assert!(!tracker.claim_is_idle());
        tracker.end_io(SlotIndex::new(1));
        assert!(tracker.claim_is_idle());
        assert_eq!(tracker.in_flight(), 0);

        tracker.release_claim();
        assert!(!tracker.has_claim());
    }
}
