//! Pending-request table.
//!
//! An open-addressing hash table keyed by request id: linear probing,
//! tombstones on removal, growth by doubling past a 0.75 load factor.
//! One mutex guards the table; each entry carries its own condition
//! variable so the receive thread wakes exactly the caller blocked on that
//! id. A response for an id in the timed-out state is discarded silently;
//! the caller already gave up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;

/// Initial slot count.
const INITIAL_CAPACITY: usize = 16;

/// Grow when `(live + tombstones) / capacity` exceeds this.
const MAX_LOAD: f64 = 0.75;

/// Terminal outcome delivered by the receive thread.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The server answered with a result.
    Success(Value),
    /// The server answered with an error.
    Failure {
        /// JSON-RPC error code.
        code: i32,
        /// Error message.
        message: String,
    },
}

/// What a blocked caller observes.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitResult {
    /// Result delivered.
    Completed(Value),
    /// Error delivered.
    Error {
        /// JSON-RPC error code.
        code: i32,
        /// Error message.
        message: String,
    },
    /// The timeout elapsed first; a late response will be discarded.
    TimedOut,
    /// The id is not registered.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Waiting,
    Completed,
    Error,
    TimedOut,
}

struct Entry {
    id: u64,
    status: Status,
    outcome: Option<Outcome>,
    signal: Arc<Condvar>,
}

enum Slot {
    Empty,
    Tombstone,
    Occupied(Entry),
}

struct TableInner {
    slots: Vec<Slot>,
    live: usize,
    tombstones: usize,
}

impl TableInner {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Empty).collect(),
            live: 0,
            tombstones: 0,
        }
    }

    fn find(&self, id: u64) -> Option<usize> {
        let capacity = self.slots.len();
        let start = (id as usize) % capacity;
        for probe in 0..capacity {
            let index = (start + probe) % capacity;
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(entry) if entry.id == id => return Some(index),
                Slot::Occupied(_) => {}
            }
        }
        None
    }

    /// First insertable slot for `id`, or `None` when the id exists.
    fn find_insert_slot(&self, id: u64) -> Option<usize> {
        let capacity = self.slots.len();
        let start = (id as usize) % capacity;
        let mut reusable: Option<usize> = None;
        for probe in 0..capacity {
            let index = (start + probe) % capacity;
            match &self.slots[index] {
                Slot::Empty => return Some(reusable.unwrap_or(index)),
                Slot::Tombstone => {
                    if reusable.is_none() {
                        reusable = Some(index);
                    }
                }
                Slot::Occupied(entry) if entry.id == id => return None,
                Slot::Occupied(_) => {}
            }
        }
        reusable
    }

    fn grow(&mut self) {
        let mut bigger = TableInner::with_capacity(self.slots.len() * 2);
        for slot in self.slots.drain(..) {
            if let Slot::Occupied(entry) = slot {
                let index = bigger
                    .find_insert_slot(entry.id)
                    .expect("grown table has room");
                bigger.slots[index] = Slot::Occupied(entry);
                bigger.live += 1;
            }
        }
        *self = bigger;
    }

    fn load(&self) -> f64 {
        (self.live + self.tombstones) as f64 / self.slots.len() as f64
    }
}

/// Thread-safe pending-request table.
pub struct PendingTable {
    inner: Mutex<TableInner>,
}

impl PendingTable {
    /// Empty table with the initial capacity.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner::with_capacity(INITIAL_CAPACITY)),
        }
    }

    /// Insert a fresh waiting entry.
    ///
    /// Returns `false` when the id is already registered; ids are
    /// monotonic so a duplicate means a caller bug.
    pub fn register(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.load() > MAX_LOAD {
            inner.grow();
        }
        let Some(index) = inner.find_insert_slot(id) else {
            return false;
        };
        if matches!(inner.slots[index], Slot::Tombstone) {
            inner.tombstones -= 1;
        }
        inner.slots[index] = Slot::Occupied(Entry {
            id,
            status: Status::Waiting,
            outcome: None,
            signal: Arc::new(Condvar::new()),
        });
        inner.live += 1;
        true
    }

    /// Route one response to its waiter. Unknown ids and entries already
    /// timed out are discarded.
    pub fn deliver(&self, id: u64, outcome: Outcome) {
        let mut inner = self.inner.lock();
        let Some(index) = inner.find(id) else {
            return;
        };
        let Slot::Occupied(entry) = &mut inner.slots[index] else {
            return;
        };
        if entry.status != Status::Waiting {
            return;
        }
        entry.status = match &outcome {
            Outcome::Success(_) => Status::Completed,
            Outcome::Failure { .. } => Status::Error,
        };
        entry.outcome = Some(outcome);
        entry.signal.notify_all();
    }

    /// Block until the entry leaves the waiting state or the timeout
    /// elapses, then claim the outcome.
    pub fn wait(&self, id: u64, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            let Some(index) = inner.find(id) else {
                return WaitResult::Unknown;
            };
            let Slot::Occupied(entry) = &mut inner.slots[index] else {
                return WaitResult::Unknown;
            };
            match entry.status {
                Status::Waiting => {
                    let signal = Arc::clone(&entry.signal);
                    if signal.wait_until(&mut inner, deadline).timed_out() {
                        // Mark it so a late delivery is dropped silently.
                        if let Some(index) = inner.find(id)
                            && let Slot::Occupied(entry) = &mut inner.slots[index]
                            && entry.status == Status::Waiting
                        {
                            entry.status = Status::TimedOut;
                            return WaitResult::TimedOut;
                        }
                        // Delivery won the race against the timeout.
                    }
                }
                Status::Completed | Status::Error => {
                    let outcome = entry.outcome.take();
                    return match outcome {
                        Some(Outcome::Success(value)) => WaitResult::Completed(value),
                        Some(Outcome::Failure { code, message }) => {
                            WaitResult::Error { code, message }
                        }
                        None => WaitResult::Unknown,
                    };
                }
                Status::TimedOut => return WaitResult::TimedOut,
            }
        }
    }

    /// Free the slot, leaving a tombstone for the probe chain.
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.find(id) {
            inner.slots[index] = Slot::Tombstone;
            inner.live -= 1;
            inner.tombstones += 1;
        }
    }

    /// Transition every waiting entry to an error and wake its caller.
    /// Used when the transport disconnects.
    pub fn fail_all(&self, code: i32, message: &str) {
        let mut inner = self.inner.lock();
        for slot in &mut inner.slots {
            if let Slot::Occupied(entry) = slot
                && entry.status == Status::Waiting
            {
                entry.status = Status::Error;
                entry.outcome = Some(Outcome::Failure {
                    code,
                    message: message.to_owned(),
                });
                entry.signal.notify_all();
            }
        }
    }

    /// Live (non-tombstone) entries.
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    /// Whether no entries are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot count, for tests.
    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
