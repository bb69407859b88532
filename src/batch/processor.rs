//! Supervised background loop that drains the pending queue on a fixed
//! cadence and hands chunks to the executors.

use super::executor::ExecutorRegistry;
use super::metrics::MetricsCollector;
use super::queue::{PendingQueue, QueuedRequest};
use super::types::{BatchError, BatchResult};
use crate::config::BatchConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RESTART_PAUSE: Duration = Duration::from_millis(500);

pub struct BatchProcessor {
    queue: PendingQueue,
    executors: Arc<ExecutorRegistry>,
    metrics: Arc<MetricsCollector>,
    config: BatchConfig,
}

/// Handle to the running processor task. Dropping it does NOT stop the
/// task; call [`stop`](ProcessorHandle::stop).
pub struct ProcessorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Signal shutdown and wait for the final drain, up to the
    /// configured grace period.
    pub async fn stop(self, grace: Duration) {
        let _ = self.stop_tx.send(true);
        if tokio::time::timeout(grace, self.task).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "processor did not stop within grace period");
        }
    }
}

impl BatchProcessor {
    pub fn new(
        queue: PendingQueue,
        executors: Arc<ExecutorRegistry>,
        metrics: Arc<MetricsCollector>,
        config: BatchConfig,
    ) -> Self {
        Self {
            queue,
            executors,
            metrics,
            config,
        }
    }

    /// Spawn the supervised processing task. The supervisor respawns
    /// the worker after a panic, after a short pause, until stopped.
    pub fn spawn(self) -> ProcessorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                let worker = tokio::spawn(run_loop(
                    self.queue.clone(),
                    Arc::clone(&self.executors),
                    Arc::clone(&self.metrics),
                    self.config.clone(),
                    stop_rx.clone(),
                ));
                match worker.await {
                    Ok(()) => break,
                    Err(join_error) => {
                        error!(error = %join_error, "batch processor worker died, restarting");
                        tokio::time::sleep(RESTART_PAUSE).await;
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        ProcessorHandle { stop_tx, task }
    }
}

async fn run_loop(
    queue: PendingQueue,
    executors: Arc<ExecutorRegistry>,
    metrics: Arc<MetricsCollector>,
    config: BatchConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!(
        window_ms = config.accumulation_window.as_millis() as u64,
        batch_size = config.batch_size,
        "batch processor started"
    );
    let mut ticker = tokio::time::interval(config.accumulation_window);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so the first real window
    // gets a full accumulation period.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                process_pending(&queue, &executors, &metrics, &config).await;
            }
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Final drain so nothing queued at shutdown is dropped.
    if tokio::time::timeout(
        config.shutdown_grace,
        process_pending(&queue, &executors, &metrics, &config),
    )
    .await
    .is_err()
    {
        warn!("final drain exceeded shutdown grace, pending results abandoned");
    }
    info!("batch processor stopped");
}

async fn process_pending(
    queue: &PendingQueue,
    executors: &ExecutorRegistry,
    metrics: &Arc<MetricsCollector>,
    config: &BatchConfig,
) {
    let buckets = queue.drain().await;
    if buckets.is_empty() {
        return;
    }

    // All chunks of all kinds run concurrently; the limiter is the only
    // throttle. A panicking chunk task is contained at its JoinHandle,
    // so sibling chunks still complete.
    let mut tasks = Vec::new();
    for (kind, entries) in buckets {
        debug!(%kind, pending = entries.len(), "processing bucket");
        let Some(executor) = executors.get(kind) else {
            warn!(%kind, "no executor registered for drained bucket");
            let results: Vec<BatchResult> = entries
                .iter()
                .map(|entry| {
                    BatchResult::err(
                        entry.request.id,
                        BatchError::UnsupportedOperation(kind),
                        Duration::ZERO,
                    )
                })
                .collect();
            metrics.record_batch(&results);
            for (entry, result) in entries.into_iter().zip(results) {
                resolve(entry, &result);
            }
            continue;
        };

        for chunk in into_chunks(entries, config.batch_size) {
            let executor = Arc::clone(&executor);
            let metrics = Arc::clone(metrics);
            tasks.push(tokio::spawn(execute_chunk(chunk, executor, metrics)));
        }
    }

    for task in tasks {
        if let Err(join_error) = task.await {
            // Dropped senders resolve the affected handles as closed.
            error!(error = %join_error, "chunk task panicked");
        }
    }
}

async fn execute_chunk(
    entries: Vec<QueuedRequest>,
    executor: Arc<dyn super::executor::ChunkExecutor>,
    metrics: Arc<MetricsCollector>,
) {
    let requests: Vec<_> = entries.iter().map(|e| e.request.clone()).collect();
    let mut results = executor.execute(&requests).await;

    // Every queued request resolves exactly once, even if an executor
    // misbehaves on cardinality.
    if results.len() != requests.len() {
        warn!(
            expected = requests.len(),
            got = results.len(),
            "executor returned wrong number of results"
        );
        results.truncate(requests.len());
        while results.len() < requests.len() {
            let request = &requests[results.len()];
            results.push(BatchResult::err(
                request.id,
                BatchError::ResponseMapping {
                    expected: requests.len(),
                    got: results.len(),
                },
                Duration::ZERO,
            ));
        }
    }

    metrics.record_batch(&results);
    for (entry, result) in entries.into_iter().zip(results) {
        resolve(entry, &result);
    }
}

/// Fan a result out to every subscriber of a queued request. Each
/// deduplicated subscriber sees its own request id on the result.
fn resolve(entry: QueuedRequest, result: &BatchResult) {
    for (request_id, tx) in entry.subscribers {
        let mut copy = result.clone();
        copy.request_id = request_id;
        let _ = tx.send(copy);
    }
}

/// Split a vec into owned chunks of at most `size` elements.
fn into_chunks<T>(mut items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    while items.len() > size {
        let rest = items.split_off(size);
        chunks.push(std::mem::replace(&mut items, rest));
    }
    if !items.is_empty() {
        chunks.push(items);
    }
    chunks
}
