//! Scheduler (C7) state: the ready heap / delay queue split described in
//! spec §4.2.1, plus the wake-up primitive used to avoid busy-waiting.
//!
//! The dispatch algorithm itself (promote-then-dispatch, dependency checks,
//! worker hand-off) lives in `crate::engine`, which owns both this struct
//! and the Execution Registry it needs to consult.

mod heap;

pub use heap::{DelayEntry, ReadyEntry};

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::models::Priority;
use crate::ports::CancelHandle;

/// Per-execution bookkeeping the scheduler needs while a worker is running.
pub struct RunningEntry {
    pub join_handle: JoinHandle<()>,
    pub cancel: CancelHandle,
    pub started_at: DateTime<Utc>,
    pub timeout_seconds: u64,
}

/// Scheduler-private state: ready heap, delay queue, running set, and the
/// worker-pool capacity semaphore. External mutation (`ScheduleTask`,
/// `CancelExecution`) goes through `enqueue`/notification, never direct
/// manipulation (spec §5 shared-resource policy).
pub struct Scheduler {
    ready: Mutex<BinaryHeap<ReadyEntry>>,
    delayed: Mutex<BinaryHeap<DelayEntry>>,
    running: Mutex<HashMap<String, RunningEntry>>,
    seq: AtomicU64,
    pub semaphore: Arc<Semaphore>,
    pub notify: Arc<Notify>,
    pub shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(max_concurrent_executions: usize) -> Self {
        Scheduler {
            ready: Mutex::new(BinaryHeap::new()),
            delayed: Mutex::new(BinaryHeap::new()),
            running: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            semaphore: Arc::new(Semaphore::new(max_concurrent_executions)),
            notify: Arc::new(Notify::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueues an execution, routing it to the ready heap or the delay
    /// queue depending on whether `ready_time` has already passed.
    pub fn enqueue(&self, execution_id: String, priority: Priority, ready_time: DateTime<Utc>, now: DateTime<Utc>) {
        let seq = self.next_seq();
        if ready_time <= now {
            self.ready.lock().unwrap().push(ReadyEntry { execution_id, priority, seq });
        } else {
            self.delayed.lock().unwrap().push(DelayEntry { execution_id, priority, seq, ready_time });
        }
        self.notify.notify_waiters();
    }

    /// Re-enqueues to the ready heap directly (used when a dependency just
    /// completed or a dependency check needs to retry shortly).
    pub fn push_ready(&self, execution_id: String, priority: Priority) {
        let seq = self.next_seq();
        self.ready.lock().unwrap().push(ReadyEntry { execution_id, priority, seq });
    }

    pub fn push_delayed(&self, execution_id: String, priority: Priority, ready_time: DateTime<Utc>) {
        let seq = self.next_seq();
        self.delayed.lock().unwrap().push(DelayEntry { execution_id, priority, seq, ready_time });
    }

    /// Moves every delay-queue entry whose `ready_time <= now` into the
    /// ready heap.
    pub fn promote_ready(&self, now: DateTime<Utc>) {
        let mut delayed = self.delayed.lock().unwrap();
        let mut ready = self.ready.lock().unwrap();
        while let Some(top) = delayed.peek() {
            if top.ready_time > now {
                break;
            }
            let entry = delayed.pop().unwrap();
            ready.push(ReadyEntry { execution_id: entry.execution_id, priority: entry.priority, seq: entry.seq });
        }
    }

    pub fn pop_ready(&self) -> Option<ReadyEntry> {
        self.ready.lock().unwrap().pop()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    pub fn has_capacity(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    pub fn insert_running(&self, execution_id: String, entry: RunningEntry) {
        self.running.lock().unwrap().insert(execution_id, entry);
    }

    pub fn remove_running(&self, execution_id: &str) -> Option<RunningEntry> {
        self.running.lock().unwrap().remove(execution_id)
    }

    pub fn is_running(&self, execution_id: &str) -> bool {
        self.running.lock().unwrap().contains_key(execution_id)
    }

    /// Returns the ids of executions whose `started_at + timeout < now`.
    pub fn timed_out(&self, now: DateTime<Utc>) -> Vec<String> {
        self.running
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| {
                let elapsed = now.signed_duration_since(entry.started_at).num_seconds();
                elapsed >= 0 && elapsed as u64 > entry.timeout_seconds
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn cancel_handle_of(&self, execution_id: &str) -> Option<CancelHandle> {
        self.running.lock().unwrap().get(execution_id).map(|e| e.cancel.clone())
    }

    pub fn running_ids(&self) -> HashSet<String> {
        self.running.lock().unwrap().keys().cloned().collect()
    }
}
