//! Rate-limited feeder: replays the batch store into the work queue forever.

use std::sync::Arc;
use std::time::Duration;

use crate::batch::{Batch, BatchStore};
use crate::queue::WorkQueue;

/// Idle sleep per pass when there is nothing to enqueue and no pacing.
const EMPTY_STORE_BACKOFF: Duration = Duration::from_secs(1);

pub struct Feeder {
    store: Arc<BatchStore>,
    queue: Arc<WorkQueue<Batch>>,
    pacing: Option<Duration>,
}

impl Feeder {
    /// `pacing` is the sleep after every enqueue (`1s / rate`); `None` is unpaced.
    pub fn new(
        store: Arc<BatchStore>,
        queue: Arc<WorkQueue<Batch>>,
        pacing: Option<Duration>,
    ) -> Self {
        Self {
            store,
            queue,
            pacing,
        }
    }

    /// Enqueue every batch once, in store order. Returns how many went in.
    ///
    /// Blocks while the queue is full. Enqueue errors are logged and skipped.
    pub async fn run_pass(&self) -> usize {
        let mut enqueued = 0;
        for batch in self.store.iter() {
            match self.queue.put(batch.clone()).await {
                Ok(()) => enqueued += 1,
                Err(e) => tracing::error!(error = %e, "Failed to enqueue batch"),
            }
            if let Some(pacing) = self.pacing {
                tokio::time::sleep(pacing).await;
            }
        }
        enqueued
    }

    /// Replay the store forever. Never returns.
    pub async fn run(self) {
        tracing::info!(
            batches = self.store.len(),
            pacing_ms = self.pacing.map(|p| p.as_secs_f64() * 1000.0),
            "Feeder started"
        );

        let mut passes: u64 = 0;
        loop {
            let enqueued = self.run_pass().await;
            passes += 1;
            tracing::debug!(pass = passes, batches = enqueued, "Feeder pass complete");

            if enqueued == 0 {
                tokio::time::sleep(self.pacing.unwrap_or(EMPTY_STORE_BACKOFF)).await;
            }
        }
    }
}
