//! Batch completion routing.
//!
//! A batch's aggregate completion may fire on any runtime thread. Instead of
//! touching admission state there, the continuation posts a `BatchCompletion`
//! onto an unbounded channel. The `Reconciler` is the channel's only reader:
//! it records batch metrics first, then releases the permit.
//!
//! The channel never holds more than `capacity` entries, one per admitted batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::controller::AdmissionPermit;
use crate::metrics::MetricsSink;

/// Outcome of one batch, carrying the permit that admitted it.
#[derive(Debug)]
pub struct BatchCompletion {
    pub permit: AdmissionPermit,
    pub queries: usize,
    pub failed: usize,
    pub dispatched_at: Instant,
    /// When the last call of the batch finished.
    pub completed_at: Instant,
}

impl BatchCompletion {
    /// Dispatch to aggregate completion. Time queued for the reconciler is
    /// not included.
    pub fn latency(&self) -> Duration {
        self.completed_at.saturating_duration_since(self.dispatched_at)
    }
}

#[derive(Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<BatchCompletion>,
}

impl CompletionSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<BatchCompletion>) -> Self {
        Self { tx }
    }

    /// Hand a completion to the reconciler.
    ///
    /// If the reconciler is gone the permit is released here so the slot
    /// still comes back.
    pub fn post(&self, completion: BatchCompletion) {
        if let Err(mpsc::error::SendError(completion)) = self.tx.send(completion) {
            tracing::error!(
                queries = completion.queries,
                "Reconciler not running - releasing permit directly"
            );
            completion.permit.release();
        }
    }
}

/// Single consumer of batch completions.
pub struct Reconciler {
    rx: mpsc::UnboundedReceiver<BatchCompletion>,
    sink: Arc<dyn MetricsSink>,
}

impl Reconciler {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<BatchCompletion>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { rx, sink }
    }

    /// Drain completions until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(completion) = self.rx.recv().await {
            self.reconcile(completion);
        }
        tracing::debug!("Reconciler exiting");
    }

    fn reconcile(&self, completion: BatchCompletion) {
        let latency = completion.latency();
        self.sink
            .record_batch(latency, completion.queries, completion.failed);
        if completion.failed > 0 {
            tracing::debug!(
                queries = completion.queries,
                failed = completion.failed,
                latency_ms = latency.as_millis() as u64,
                "Batch completed with failures"
            );
        }
        completion.permit.release();
    }
}
