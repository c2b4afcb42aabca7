use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::models::Priority;

/// An entry in the ready heap, ordered by `(-priority, seq)` (spec §4.2).
/// Only entries whose `ready_time <= now` live here; see [`super::Scheduler`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadyEntry {
    pub execution_id: String,
    pub priority: Priority,
    pub seq: u64,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority must compare greater;
        // within equal priority, the *smaller* seq (inserted first) must
        // compare greater so FIFO pops happen first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An entry in the delay queue, ordered by `ready_time` ascending (min-heap
/// behavior realized by reversing the natural `Ord`).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DelayEntry {
    pub execution_id: String,
    pub priority: Priority,
    pub seq: u64,
    pub ready_time: DateTime<Utc>,
}

impl Ord for DelayEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_time
            .cmp(&self.ready_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DelayEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
