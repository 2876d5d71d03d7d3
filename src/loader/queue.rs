//! Bounded FIFO admission for load work.
//!
//! At most `capacity` tasks hold a slot at once; everybody else waits in
//! submission order (tokio's semaphore is fair). The queue never cancels a
//! task it has admitted.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    pending: AtomicUsize,
    peak_active: AtomicUsize,
    admitted: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct RequestQueue {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

/// A held queue slot. Releasing it (drop) admits the next waiter.
#[derive(Debug)]
pub struct QueueSlot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keeps `pending` honest if a waiter is dropped before it is admitted.
struct PendingGuard<'a>(&'a Counters);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RequestQueue {
    /// Create a queue admitting up to `capacity` concurrent tasks (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks currently holding a slot.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::Acquire)
    }

    /// Tasks waiting for a slot.
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::Acquire)
    }

    /// Highest `active` value observed since creation.
    pub fn peak_active(&self) -> usize {
        self.counters.peak_active.load(Ordering::Acquire)
    }

    /// Total number of slots handed out since creation.
    pub fn admitted(&self) -> usize {
        self.counters.admitted.load(Ordering::Acquire)
    }

    /// Wait for a slot in FIFO order.
    pub async fn admit(&self) -> QueueSlot {
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        let permit = {
            let _pending = PendingGuard(&self.counters);
            self.semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("request queue semaphore is never closed")
        };

        let active = self.counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak_active.fetch_max(active, Ordering::AcqRel);
        self.counters.admitted.fetch_add(1, Ordering::AcqRel);

        QueueSlot {
            _permit: permit,
            counters: self.counters.clone(),
        }
    }

    /// Run `task` once a slot is free, releasing the slot when it completes.
    pub async fn submit<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _slot = self.admit().await;
        task().await
    }
}
