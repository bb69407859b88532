//! Pending-request accumulator with atomic drain.
//!
//! Requests wait here, grouped by operation kind, until the processor
//! drains them. Draining swaps the whole bucket map out under one lock
//! acquisition, so new submissions never land in a batch that is
//! already executing.

use super::dedup::DedupIndex;
use super::types::{BatchRequest, BatchResult, OperationKind, RequestId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};

/// A queued request plus everyone waiting on its outcome. The first
/// subscriber is the submitter; later ones are deduplicated submissions
/// coalesced onto this entry.
pub struct QueuedRequest {
    pub request: BatchRequest,
    pub subscribers: Vec<(RequestId, oneshot::Sender<BatchResult>)>,
}

#[derive(Default)]
struct QueueState {
    buckets: HashMap<OperationKind, Vec<QueuedRequest>>,
    index: DedupIndex,
    depth: usize,
}

/// Outcome of an enqueue attempt.
pub enum Enqueued {
    /// New entry, will execute in the next drained batch.
    Queued,
    /// Coalesced onto an earlier identical request.
    Deduplicated { primary: RequestId },
    /// Rejected, queue at capacity. The sender is returned so the
    /// caller can resolve it immediately.
    Rejected { tx: oneshot::Sender<BatchResult>, depth: usize },
}

/// Shared pending queue. Cloning is cheap; all clones see one state.
#[derive(Clone)]
pub struct PendingQueue {
    state: Arc<Mutex<QueueState>>,
    max_pending: usize,
    dedup_window: Duration,
}

impl PendingQueue {
    pub fn new(max_pending: usize, dedup_window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            max_pending,
            dedup_window,
        }
    }

    /// Queue `request`, attaching `tx` as a completion subscriber.
    pub async fn enqueue(
        &self,
        request: BatchRequest,
        tx: oneshot::Sender<BatchResult>,
    ) -> Enqueued {
        let mut state = self.state.lock().await;

        if let Some(primary) = state.index.duplicate_of(&request, self.dedup_window) {
            // Attach to the earlier request's subscriber list.
            for entries in state.buckets.values_mut() {
                if let Some(entry) = entries.iter_mut().find(|e| e.request.id == primary) {
                    entry.subscribers.push((request.id, tx));
                    return Enqueued::Deduplicated { primary };
                }
            }
            // Stale index entry; fall through and queue normally.
        }

        if state.depth >= self.max_pending {
            return Enqueued::Rejected {
                tx,
                depth: state.depth,
            };
        }

        // Past the capacity gate: the key may now point at this request.
        state.index.register(&request);

        let id = request.id;
        state.depth += 1;
        state
            .buckets
            .entry(request.kind)
            .or_default()
            .push(QueuedRequest {
                request,
                subscribers: vec![(id, tx)],
            });
        Enqueued::Queued
    }

    /// Atomically take everything pending, leaving the queue empty.
    pub async fn drain(&self) -> HashMap<OperationKind, Vec<QueuedRequest>> {
        let mut state = self.state.lock().await;
        state.depth = 0;
        state.index.clear();
        std::mem::take(&mut state.buckets)
    }

    pub async fn depth(&self) -> usize {
        self.state.lock().await.depth
    }

    #[cfg(test)]
    pub(crate) async fn dedup_entries(&self) -> usize {
        self.state.lock().await.index.len()
    }
}
