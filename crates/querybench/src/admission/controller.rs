//! Bounded admission semaphore with RAII permits.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Notify, mpsc};

use super::completion::{CompletionSender, Reconciler};
use crate::metrics::MetricsSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("admission capacity must be greater than zero")]
    ZeroCapacity,
}

/// Point-in-time view of the admission counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
    pub inflight: usize,
    pub capacity: usize,
    pub acquired: u64,
    pub released: u64,
}

#[derive(Debug, Default)]
struct Counters {
    inflight: usize,
    acquired: u64,
    released: u64,
}

struct AdmissionState {
    counters: Mutex<Counters>,
    capacity: usize,
    /// Signalled whenever a release leaves `inflight < capacity`.
    not_full: Notify,
    /// Signalled on every release.
    released: Notify,
}

impl AdmissionState {
    fn lock(&self) -> MutexGuard<'_, Counters> {
        // Counters are plain integers updated in one step, so a poisoned
        // guard still holds consistent values.
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_increment(&self) -> bool {
        let mut counters = self.lock();
        if counters.inflight < self.capacity {
            counters.inflight += 1;
            counters.acquired += 1;
            true
        } else {
            false
        }
    }

    fn release(&self) {
        let inflight = {
            let mut counters = self.lock();
            debug_assert!(counters.inflight > 0, "release without matching acquire");
            counters.inflight = counters.inflight.saturating_sub(1);
            counters.released += 1;
            counters.inflight
        };

        if inflight < self.capacity {
            self.not_full.notify_waiters();
        }
        self.released.notify_waiters();
    }

    fn snapshot(&self) -> AdmissionSnapshot {
        let counters = self.lock();
        AdmissionSnapshot {
            inflight: counters.inflight,
            capacity: self.capacity,
            acquired: counters.acquired,
            released: counters.released,
        }
    }
}

/// Caps the number of batches in flight.
///
/// Shared by `Arc` between the workers (which acquire) and the reconciler
/// (which releases). Release may happen on any thread.
pub struct AdmissionController {
    state: Arc<AdmissionState>,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Result<Self, AdmissionError> {
        if capacity == 0 {
            return Err(AdmissionError::ZeroCapacity);
        }
        Ok(Self {
            state: Arc::new(AdmissionState {
                counters: Mutex::new(Counters::default()),
                capacity,
                not_full: Notify::new(),
                released: Notify::new(),
            }),
        })
    }

    /// Wait until `inflight < capacity`, then take a slot.
    ///
    /// The condition is re-checked after every wakeup; a wakeup only means a
    /// slot was freed, another waiter may already have taken it.
    pub async fn acquire(&self) -> AdmissionPermit {
        loop {
            // Register interest before checking so a release between the
            // check and the await is not lost.
            let not_full = self.state.not_full.notified();
            if self.state.try_increment() {
                return self.permit();
            }
            not_full.await;
        }
    }

    /// Take a slot if one is free right now, without waiting.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        self.state.try_increment().then(|| self.permit())
    }

    fn permit(&self) -> AdmissionPermit {
        AdmissionPermit {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Maximum concurrent permits.
    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Permits currently held.
    pub fn inflight(&self) -> usize {
        self.state.lock().inflight
    }

    /// Slots free at this instant. May be stale by the time it is used.
    pub fn available(&self) -> usize {
        self.state.capacity - self.inflight()
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        self.state.snapshot()
    }

    /// Resolve once no batch is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let released = self.state.released.notified();
            if self.inflight() == 0 {
                return;
            }
            released.await;
        }
    }

    /// Resolve once at least `count` permits have been released in total.
    pub async fn wait_released(&self, count: u64) {
        loop {
            let released = self.state.released.notified();
            if self.state.lock().released >= count {
                return;
            }
            released.await;
        }
    }

    /// Create the completion channel for this controller.
    ///
    /// Batch continuations post through the returned sender; the reconciler
    /// is the single consumer and the only place completed permits are
    /// released.
    pub fn completion_channel(
        &self,
        sink: Arc<dyn MetricsSink>,
    ) -> (CompletionSender, Reconciler) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CompletionSender::new(tx), Reconciler::new(rx, sink))
    }
}

/// One admitted batch. Frees its slot when released or dropped.
#[must_use = "dropping the permit releases the admission slot immediately"]
pub struct AdmissionPermit {
    state: Option<Arc<AdmissionState>>,
}

impl AdmissionPermit {
    pub fn release(mut self) {
        if let Some(state) = self.state.take() {
            state.release();
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::warn!("Admission permit dropped without release - releasing slot");
            state.release();
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("held", &self.state.is_some())
            .finish()
    }
}
