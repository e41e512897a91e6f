// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! A bounded, ordered FIFO queue with poison-value shutdown, shared by
//! the IMU, Apogee Predictor, and Logger pipelines.
//!
//! This generalizes the worker-thread shape used elsewhere in this
//! codebase's lineage (a background thread spawned once, synchronizing
//! with the caller through a `Mutex`-guarded shared state) from a single
//! "latest value" slot into a true ordered queue with blocking
//! backpressure and an explicit poison value, per the concurrency model
//! in SPEC_FULL.md section 5.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

enum Slot<T> {
    Item(T),
    Poison,
}

struct Inner<T> {
    items: VecDeque<Slot<T>>,
    capacity: usize,
}

/// A multi-producer, multi-consumer bounded queue. `push` blocks (up to a
/// timeout) while the queue is full; `get_many` blocks (up to a timeout)
/// while the queue is empty, then drains everything available without
/// blocking further.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            inner: Mutex::new(Inner { items: VecDeque::new(), capacity }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Number of items (excluding any poison value) currently queued.
    pub fn len(&self) -> usize {
        let locked = self.inner.lock().unwrap();
        locked.items.iter().filter(|s| matches!(s, Slot::Item(_))).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes a single item, blocking up to `timeout` for room. Returns
    /// `false` if the timeout elapsed with the queue still full.
    pub fn push(&self, item: T, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut locked = self.inner.lock().unwrap();
        while locked.items.len() >= locked.capacity {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) =
                self.not_full.wait_timeout(locked, deadline - now).unwrap();
            locked = guard;
            if result.timed_out() && locked.items.len() >= locked.capacity {
                return false;
            }
        }
        locked.items.push_back(Slot::Item(item));
        self.not_empty.notify_one();
        true
    }

    /// Pushes every item in `items`, bypassing the capacity bound. Used
    /// to flush a ring buffer into the queue without itself blocking, and
    /// to drain-then-enqueue before a `push_poison`.
    pub fn push_many_unbounded(&self, items: impl IntoIterator<Item = T>) {
        let mut locked = self.inner.lock().unwrap();
        for item in items {
            locked.items.push_back(Slot::Item(item));
        }
        self.not_empty.notify_all();
    }

    /// Pushes the poison value, bypassing the capacity bound so shutdown
    /// is never blocked by a full queue.
    pub fn push_poison(&self) {
        let mut locked = self.inner.lock().unwrap();
        locked.items.push_back(Slot::Poison);
        self.not_empty.notify_all();
    }

    /// Blocks up to `timeout` for at least one item, then drains up to
    /// `max` items without blocking further. Returns the drained items
    /// and whether a poison value was seen (and consumed) in the batch.
    /// An empty, non-poisoned result means the wait timed out.
    pub fn get_many(&self, max: usize, timeout: Duration) -> (Vec<T>, bool) {
        let mut locked = self.inner.lock().unwrap();
        if locked.items.is_empty() {
            let (guard, _) = self.not_empty.wait_timeout(locked, timeout).unwrap();
            locked = guard;
        }
        let mut drained = Vec::new();
        let mut saw_poison = false;
        while drained.len() < max {
            match locked.items.pop_front() {
                Some(Slot::Item(item)) => drained.push(item),
                Some(Slot::Poison) => {
                    saw_poison = true;
                    break;
                }
                None => break,
            }
        }
        self.not_full.notify_all();
        (drained, saw_poison)
    }
}
