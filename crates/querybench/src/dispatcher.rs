//! Worker pool: takes batches off the queue, gates them through admission and
//! fans each one out into transport calls.
//!
//! Per batch:
//! 1. `take` from the work queue
//! 2. `acquire` an admission permit
//! 3. submit one call per query; each call records its own latency
//! 4. spawn a task joining all calls, which posts a `BatchCompletion`
//! 5. loop back without waiting for 4
//!
//! The reconciler records the batch and releases the permit. If the
//! transport rejects a query while building the calls, the permit is
//! released right away and the worker moves on.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::admission::{
    AdmissionController, AdmissionError, AdmissionPermit, BatchCompletion, CompletionSender,
    Reconciler,
};
use crate::batch::{Batch, BatchStore};
use crate::config::{ConfigError, HarnessConfig};
use crate::feeder::Feeder;
use crate::metrics::MetricsSink;
use crate::queue::{QueueError, WorkQueue};
use crate::transport::{Transport, TransportError};

/// Pause before retrying after a failed `take`.
const TAKE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    taken: AtomicU64,
    dispatched_batches: AtomicU64,
    issued_calls: AtomicU64,
    dispatch_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    pub taken: u64,
    pub dispatched_batches: u64,
    pub issued_calls: u64,
    pub dispatch_failures: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            taken: self.taken.load(Ordering::Relaxed),
            dispatched_batches: self.dispatched_batches.load(Ordering::Relaxed),
            issued_calls: self.issued_calls.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every worker task.
struct WorkerContext {
    queue: Arc<WorkQueue<Batch>>,
    admission: Arc<AdmissionController>,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn MetricsSink>,
    completions: CompletionSender,
    stats: Arc<DispatchStats>,
}

impl WorkerContext {
    async fn run(&self, id: usize) {
        tracing::debug!(worker = id, "Worker started");
        loop {
            let batch = match self.queue.take().await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(worker = id, error = %e, "Failed to take batch");
                    tokio::time::sleep(TAKE_RETRY_DELAY).await;
                    continue;
                }
            };
            self.stats.taken.fetch_add(1, Ordering::Relaxed);

            let permit = self.admission.acquire().await;
            if let Err(e) = self.dispatch(&batch, permit) {
                self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    worker = id,
                    queries = batch.len(),
                    error = %e,
                    "Batch dispatch failed"
                );
            }
        }
    }

    /// Issue every call of `batch` and hand the aggregate to a completion task.
    ///
    /// On error nothing is spawned and the permit has already been released.
    fn dispatch(&self, batch: &Batch, permit: AdmissionPermit) -> Result<(), TransportError> {
        let dispatched_at = Instant::now();
        let calls = match self.build_calls(batch) {
            Ok(calls) => calls,
            Err(e) => {
                permit.release();
                return Err(e);
            }
        };

        let queries = calls.len();
        self.stats
            .issued_calls
            .fetch_add(queries as u64, Ordering::Relaxed);
        self.stats.dispatched_batches.fetch_add(1, Ordering::Relaxed);

        let completions = self.completions.clone();
        tokio::spawn(async move {
            // join_all waits for every call; a failure does not cancel siblings.
            let outcomes = futures::future::join_all(calls).await;
            let completed_at = Instant::now();
            let failed = outcomes.iter().filter(|ok| !**ok).count();
            completions.post(BatchCompletion {
                permit,
                queries,
                failed,
                dispatched_at,
                completed_at,
            });
        });
        Ok(())
    }

    fn build_calls(
        &self,
        batch: &Batch,
    ) -> Result<Vec<impl Future<Output = bool> + Send + 'static>, TransportError> {
        batch
            .queries()
            .iter()
            .map(|query| {
                let call = self.transport.submit(Arc::clone(query))?;
                let metrics = Arc::clone(&self.metrics);
                let submitted_at = Instant::now();
                Ok::<_, TransportError>(async move {
                    let result = call.await;
                    metrics.record_call(submitted_at.elapsed(), result.is_ok());
                    match result {
                        Ok(_) => true,
                        Err(e) => {
                            tracing::debug!(error = %e, "Call failed");
                            false
                        }
                    }
                })
            })
            .collect()
    }
}

/// Owns the queue, admission controller, transport and completion channel of
/// one run.
pub struct Dispatcher {
    threads: usize,
    store: Arc<BatchStore>,
    pacing: Option<Duration>,
    context: Arc<WorkerContext>,
    reconciler: Reconciler,
}

impl Dispatcher {
    pub fn new(
        config: &HarnessConfig,
        store: BatchStore,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, DispatchError> {
        if config.threads == 0 {
            return Err(ConfigError::ZeroThreads.into());
        }
        let queue = Arc::new(WorkQueue::new(config.queue_capacity())?);
        let admission = Arc::new(AdmissionController::new(config.inflight)?);
        let (completions, reconciler) = admission.completion_channel(Arc::clone(&metrics));

        Ok(Self {
            threads: config.threads,
            store: Arc::new(store),
            pacing: config.pacing(),
            context: Arc::new(WorkerContext {
                queue,
                admission,
                transport,
                metrics,
                completions,
                stats: Arc::new(DispatchStats::default()),
            }),
            reconciler,
        })
    }

    /// A feeder bound to this dispatcher's store and queue.
    pub fn feeder(&self) -> Feeder {
        Feeder::new(
            Arc::clone(&self.store),
            Arc::clone(&self.context.queue),
            self.pacing,
        )
    }

    pub fn queue(&self) -> &Arc<WorkQueue<Batch>> {
        &self.context.queue
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.context.admission
    }

    /// Spawn the reconciler and the workers. Nothing feeds the queue.
    pub fn spawn(self) -> DispatcherHandle {
        let mut tasks = Vec::with_capacity(self.threads + 2);
        tasks.push(tokio::spawn(self.reconciler.run()));

        for id in 0..self.threads {
            let context = Arc::clone(&self.context);
            tasks.push(tokio::spawn(
                async move { context.run(id).await }
                    .instrument(tracing::debug_span!("worker", id)),
            ));
        }

        tracing::info!(
            threads = self.threads,
            inflight = self.context.admission.capacity(),
            queue_capacity = self.context.queue.capacity(),
            "Dispatcher started"
        );

        DispatcherHandle {
            admission: Arc::clone(&self.context.admission),
            stats: Arc::clone(&self.context.stats),
            tasks,
        }
    }

    /// `spawn` plus the feeder replaying the store forever.
    pub fn start(self) -> DispatcherHandle {
        let feeder = self.feeder();
        let mut handle = self.spawn();
        handle.tasks.push(tokio::spawn(feeder.run()));
        handle
    }
}

pub struct DispatcherHandle {
    admission: Arc<AdmissionController>,
    stats: Arc<DispatchStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    /// Resolve once no batch is in flight.
    pub async fn wait_idle(&self) {
        self.admission.wait_idle().await;
    }

    /// Wait on every task. Workers and the feeder loop forever, so this only
    /// returns if one of them panics.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Dispatcher task ended");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::transport::{CallError, CallFuture, QueryResult};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        submitted: Vec<(String, Instant)>,
        finished: Vec<(String, Instant)>,
    }

    /// Transport answering every query after a fixed delay.
    struct StubTransport {
        latency: Duration,
        fail: bool,
        /// Queries with this text are rejected synchronously.
        reject: Option<&'static str>,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl StubTransport {
        fn new(latency_ms: u64) -> Self {
            Self {
                latency: Duration::from_millis(latency_ms),
                fail: false,
                reject: None,
                recorded: Arc::default(),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn rejecting(mut self, query: &'static str) -> Self {
            self.reject = Some(query);
            self
        }
    }

    impl Transport for StubTransport {
        fn submit(&self, query: Arc<str>) -> Result<CallFuture, TransportError> {
            if self.reject == Some(&*query) {
                return Err(TransportError::BlankQuery);
            }
            self.recorded
                .lock()
                .unwrap()
                .submitted
                .push((query.to_string(), Instant::now()));

            let latency = self.latency;
            let fail = self.fail;
            let recorded = Arc::clone(&self.recorded);
            Ok(Box::pin(async move {
                tokio::time::sleep(latency).await;
                recorded
                    .lock()
                    .unwrap()
                    .finished
                    .push((query.to_string(), Instant::now()));
                if fail {
                    Err(CallError::Status {
                        endpoint: "stub".to_string(),
                        status: 500,
                    })
                } else {
                    Ok(QueryResult {
                        endpoint: "stub".to_string(),
                        bytes: query.len(),
                    })
                }
            }))
        }
    }

    fn config(threads: usize, inflight: usize) -> HarnessConfig {
        HarnessConfig::default()
            .with_threads(threads)
            .with_inflight(inflight)
    }

    /// Batch `i` holds queries `b{i}-0`, `b{i}-1`, ...
    fn store(sizes: &[usize]) -> BatchStore {
        BatchStore::new(
            sizes
                .iter()
                .enumerate()
                .map(|(i, &n)| Batch::new((0..n).map(|j| format!("b{i}-{j}"))))
                .collect(),
        )
    }

    fn batch_of(query: &str) -> String {
        query.split('-').next().unwrap_or_default().to_string()
    }

    async fn wait_released(handle: &DispatcherHandle, count: u64) {
        tokio::time::timeout(
            Duration::from_secs(5),
            handle.admission().wait_released(count),
        )
        .await
        .expect("batches should complete");
    }

    #[test]
    fn zero_threads_rejected() {
        let result = Dispatcher::new(
            &config(0, 1),
            store(&[1]),
            Arc::new(StubTransport::new(1)),
            Arc::new(Metrics::new()),
        );
        assert!(matches!(
            result,
            Err(DispatchError::Config(ConfigError::ZeroThreads))
        ));
    }

    #[test]
    fn zero_inflight_rejected() {
        let result = Dispatcher::new(
            &config(1, 0),
            store(&[1]),
            Arc::new(StubTransport::new(1)),
            Arc::new(Metrics::new()),
        );
        assert!(matches!(
            result,
            Err(DispatchError::Admission(AdmissionError::ZeroCapacity))
        ));
    }

    #[tokio::test]
    async fn third_batch_waits_for_a_completion() {
        let transport = StubTransport::new(10);
        let recorded = Arc::clone(&transport.recorded);
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(
            &config(2, 2),
            store(&[2, 1, 3]),
            Arc::new(transport),
            metrics.clone(),
        )
        .unwrap();
        assert_eq!(dispatcher.queue().capacity(), 4);

        assert_eq!(dispatcher.feeder().run_pass().await, 3);
        let handle = dispatcher.spawn();
        wait_released(&handle, 3).await;

        assert_eq!(handle.admission().inflight(), 0);
        assert_eq!(handle.admission().snapshot().acquired, 3);
        assert_eq!(
            handle.stats(),
            DispatchSnapshot {
                taken: 3,
                dispatched_batches: 3,
                issued_calls: 6,
                dispatch_failures: 0,
            }
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls_completed, 6);
        assert_eq!(snapshot.batches_completed, 3);

        // Per batch: first submit and last call completion.
        let recorded = recorded.lock().unwrap();
        let mut first_submit: HashMap<String, Instant> = HashMap::new();
        for (query, at) in &recorded.submitted {
            let entry = first_submit.entry(batch_of(query)).or_insert(*at);
            *entry = (*entry).min(*at);
        }
        let mut done: HashMap<String, Instant> = HashMap::new();
        for (query, at) in &recorded.finished {
            let entry = done.entry(batch_of(query)).or_insert(*at);
            *entry = (*entry).max(*at);
        }
        assert_eq!(first_submit.len(), 3);

        let mut order: Vec<_> = first_submit.into_iter().collect();
        order.sort_by_key(|(_, at)| *at);
        let (third, third_start) = &order[2];
        let earliest_done = order[..2]
            .iter()
            .map(|(batch, _)| done[batch])
            .min()
            .unwrap();
        assert!(
            *third_start >= earliest_done,
            "batch {third} started before any admitted batch completed"
        );
    }

    #[tokio::test]
    async fn failing_calls_still_release_admission() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(
            &config(2, 2),
            store(&[1, 2, 3, 1]),
            Arc::new(StubTransport::new(2).failing()),
            metrics.clone(),
        )
        .unwrap();

        dispatcher.feeder().run_pass().await;
        let handle = dispatcher.spawn();
        wait_released(&handle, 4).await;

        assert_eq!(handle.admission().inflight(), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_completed, 4);
        assert_eq!(snapshot.calls_completed, 7);
        assert_eq!(snapshot.calls_failed, 7);
    }

    #[tokio::test]
    async fn rejected_query_releases_slot_and_worker_continues() {
        let metrics = Arc::new(Metrics::new());
        let store = BatchStore::new(vec![Batch::new(["ok", "bad"]), Batch::new(["ok"])]);
        let dispatcher = Dispatcher::new(
            &config(1, 1),
            store,
            Arc::new(StubTransport::new(1).rejecting("bad")),
            metrics.clone(),
        )
        .unwrap();

        dispatcher.feeder().run_pass().await;
        let handle = dispatcher.spawn();
        wait_released(&handle, 2).await;

        assert_eq!(handle.admission().inflight(), 0);
        assert_eq!(
            handle.stats(),
            DispatchSnapshot {
                taken: 2,
                dispatched_batches: 1,
                issued_calls: 1,
                dispatch_failures: 1,
            }
        );
        assert_eq!(metrics.snapshot().batches_completed, 1);
    }

    #[tokio::test]
    async fn empty_batch_completes() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(
            &config(1, 1),
            store(&[0, 1]),
            Arc::new(StubTransport::new(1)),
            metrics.clone(),
        )
        .unwrap();

        dispatcher.feeder().run_pass().await;
        let handle = dispatcher.spawn();
        wait_released(&handle, 2).await;

        assert_eq!(metrics.snapshot().batches_completed, 2);
        assert_eq!(handle.stats().issued_calls, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sustained_load_keeps_flowing() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(
            &config(3, 1),
            store(&[1, 2, 1]),
            Arc::new(StubTransport::new(1)),
            metrics.clone(),
        )
        .unwrap();

        let handle = dispatcher.start();
        wait_released(&handle, 30).await;

        let admission = handle.admission().snapshot();
        assert!(admission.inflight <= 1);
        assert!(admission.released >= 30);
        assert!(metrics.snapshot().batches_completed >= 30);
    }
}
