//! Public entry point for the batching pipeline.

use super::executor::ExecutorRegistry;
use super::metrics::{MetricsCollector, MetricsSnapshot};
use super::processor::{BatchProcessor, ProcessorHandle};
use super::queue::{Enqueued, PendingQueue};
use super::rate_limiter::SlidingWindowLimiter;
use super::types::{BatchError, BatchRequest, BatchResult, OperationKind, RequestId, RequestPayload};
use crate::config::LeadflowConfig;
use crate::crm::transport::{CrmTransport, HttpTransport};
use crate::crm::types::{
    ContactFields, ContactPayload, ContactUpdate, CrmError, HealthStatus, TagEntry,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{info, warn};

/// Awaitable outcome of one submitted request. Resolves exactly once.
pub struct PendingHandle {
    request_id: RequestId,
    deduplicated: bool,
    rx: oneshot::Receiver<BatchResult>,
    default_wait: Duration,
}

impl PendingHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// True when this submission was coalesced onto an earlier
    /// identical request.
    pub fn deduplicated(&self) -> bool {
        self.deduplicated
    }

    /// Wait for the result with the default deadline (two accumulation
    /// windows plus slack).
    pub async fn wait(self) -> BatchResult {
        let deadline = self.default_wait;
        self.wait_for(deadline).await
    }

    /// Wait for the result with an explicit deadline.
    pub async fn wait_for(self, deadline: Duration) -> BatchResult {
        match tokio::time::timeout(deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => BatchResult::err(self.request_id, BatchError::ChannelClosed, deadline),
            Err(_) => BatchResult::err(
                self.request_id,
                BatchError::TimeoutWaitingForBatch(deadline),
                deadline,
            ),
        }
    }
}

/// One lead-level change for [`BatchClient::sync_lead_batch`].
#[derive(Debug, Clone)]
pub enum LeadUpdate {
    Contact(ContactPayload),
    ContactFields { id: String, fields: ContactFields },
    Tags { id: String, tags: Vec<String> },
}

/// Aggregate outcome of one `sync_lead_batch` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadSyncSummary {
    pub tenant_id: String,
    pub total_requests: usize,
    pub synchronized_count: usize,
    pub failed_count: usize,
    pub elapsed_ms: u64,
    pub success_rate_percent: f64,
}

struct CachedSummary {
    summary: LeadSyncSummary,
    cached_at: Instant,
}

/// Batching client over one CRM tenant. Clone-free by design; share it
/// behind an `Arc`.
pub struct BatchClient {
    config: LeadflowConfig,
    queue: PendingQueue,
    metrics: Arc<MetricsCollector>,
    limiter: SlidingWindowLimiter,
    transport: Arc<dyn CrmTransport>,
    processor: Mutex<Option<ProcessorHandle>>,
    summaries: DashMap<String, CachedSummary>,
}

impl BatchClient {
    /// Build a client with a real HTTP transport and start the
    /// background processor.
    pub fn new(config: LeadflowConfig) -> Result<Self, CrmError> {
        let transport = Arc::new(HttpTransport::new(&config.crm)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Build a client over any transport. Used by tests to inject a
    /// mock.
    pub fn with_transport(config: LeadflowConfig, transport: Arc<dyn CrmTransport>) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let limiter = SlidingWindowLimiter::new(config.rate_limit.clone());
        let queue = PendingQueue::new(config.batch.max_pending, config.batch.dedup_window);
        let executors = Arc::new(ExecutorRegistry::standard(
            Arc::clone(&transport),
            limiter.clone(),
            Arc::clone(&metrics),
            config.crm.location_id.clone(),
        ));
        let handle = BatchProcessor::new(
            queue.clone(),
            executors,
            Arc::clone(&metrics),
            config.batch.clone(),
        )
        .spawn();

        Self {
            config,
            queue,
            metrics,
            limiter,
            transport,
            processor: Mutex::new(Some(handle)),
            summaries: DashMap::new(),
        }
    }

    /// Queue requests for the next accumulation window. Returns one
    /// handle per request, in order; rejected or deduplicated
    /// submissions still get a handle that resolves.
    pub async fn submit(&self, requests: Vec<BatchRequest>) -> Vec<PendingHandle> {
        let default_wait = self.config.batch.result_wait();
        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            self.metrics.record_submitted();
            let request_id = request.id;
            let (tx, rx) = oneshot::channel();
            let deduplicated = match self.queue.enqueue(request, tx).await {
                Enqueued::Queued => false,
                Enqueued::Deduplicated { primary } => {
                    self.metrics.record_deduplicated();
                    info!(%request_id, %primary, "request coalesced onto in-flight duplicate");
                    true
                }
                Enqueued::Rejected { tx, depth } => {
                    self.metrics.record_rejection();
                    warn!(depth, "pending queue full, rejecting request");
                    let _ = tx.send(BatchResult::err(
                        request_id,
                        BatchError::QueueFull { depth },
                        Duration::ZERO,
                    ));
                    false
                }
            };
            handles.push(PendingHandle {
                request_id,
                deduplicated,
                rx,
                default_wait,
            });
        }
        handles
    }

    /// Queue one request and wait for its result.
    pub async fn submit_one(&self, request: BatchRequest) -> BatchResult {
        let mut handles = self.submit(vec![request]).await;
        match handles.pop() {
            Some(handle) => handle.wait().await,
            None => unreachable!("submit returns one handle per request"),
        }
    }

    /// Batch-create contacts via the bulk upsert endpoint.
    pub async fn create_contacts_batch(
        &self,
        contacts: Vec<ContactPayload>,
    ) -> Result<Vec<BatchResult>, BatchError> {
        let requests = contacts
            .into_iter()
            .map(|contact| {
                BatchRequest::new(
                    OperationKind::ContactCreate,
                    None,
                    RequestPayload::Contact(contact),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.submit_and_wait(requests).await)
    }

    /// Batch-update existing contacts, one request per update.
    pub async fn update_contacts_batch(
        &self,
        updates: Vec<ContactUpdate>,
    ) -> Result<Vec<BatchResult>, BatchError> {
        let requests = updates
            .into_iter()
            .map(|update| {
                BatchRequest::new(
                    OperationKind::ContactUpdate,
                    Some(update.id),
                    RequestPayload::ContactFields(update.fields),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.submit_and_wait(requests).await)
    }

    /// Batch-add tags to existing contacts.
    pub async fn add_tags_batch(
        &self,
        entries: Vec<TagEntry>,
    ) -> Result<Vec<BatchResult>, BatchError> {
        let requests = entries
            .into_iter()
            .map(|entry| {
                BatchRequest::new(
                    OperationKind::TagAdd,
                    Some(entry.id),
                    RequestPayload::Tags(entry.tags),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.submit_and_wait(requests).await)
    }

    /// Push a mixed set of lead changes through the batcher and report
    /// the aggregate outcome. The summary is cached per tenant for the
    /// configured TTL.
    pub async fn sync_lead_batch(
        &self,
        tenant_id: &str,
        updates: Vec<LeadUpdate>,
    ) -> LeadSyncSummary {
        let started = Instant::now();
        let total_requests = updates.len();

        let mut requests = Vec::with_capacity(updates.len());
        let mut invalid = 0usize;
        for update in updates {
            let built = match update {
                LeadUpdate::Contact(contact) => BatchRequest::new(
                    OperationKind::ContactCreate,
                    None,
                    RequestPayload::Contact(contact),
                ),
                LeadUpdate::ContactFields { id, fields } => BatchRequest::new(
                    OperationKind::ContactUpdate,
                    Some(id),
                    RequestPayload::ContactFields(fields),
                ),
                LeadUpdate::Tags { id, tags } => BatchRequest::new(
                    OperationKind::TagAdd,
                    Some(id),
                    RequestPayload::Tags(tags),
                ),
            };
            match built {
                Ok(request) => requests.push(request),
                Err(error) => {
                    warn!(%tenant_id, %error, "skipping invalid lead update");
                    invalid += 1;
                }
            }
        }

        let results = self.submit_and_wait(requests).await;
        let synchronized_count = results.iter().filter(|r| r.success).count();
        let failed_count = results.len() - synchronized_count + invalid;

        let summary = LeadSyncSummary {
            tenant_id: tenant_id.to_string(),
            total_requests,
            synchronized_count,
            failed_count,
            elapsed_ms: started.elapsed().as_millis() as u64,
            success_rate_percent: if total_requests > 0 {
                synchronized_count as f64 / total_requests as f64 * 100.0
            } else {
                100.0
            },
        };
        info!(
            %tenant_id,
            total = summary.total_requests,
            synchronized = summary.synchronized_count,
            elapsed_ms = summary.elapsed_ms,
            "lead batch synchronized"
        );
        self.summaries.insert(
            tenant_id.to_string(),
            CachedSummary {
                summary: summary.clone(),
                cached_at: Instant::now(),
            },
        );
        summary
    }

    /// Most recent sync summary for a tenant, if still within the
    /// cache TTL.
    pub fn last_sync_summary(&self, tenant_id: &str) -> Option<LeadSyncSummary> {
        let entry = self.summaries.get(tenant_id)?;
        if entry.cached_at.elapsed() > self.config.batch.summary_cache_ttl {
            drop(entry);
            self.summaries.remove(tenant_id);
            return None;
        }
        Some(entry.summary.clone())
    }

    /// Probe the provider without going through the rate limiter or
    /// the queue.
    pub async fn health_check(&self) -> Result<HealthStatus, CrmError> {
        let path = format!("/locations/{}", self.config.crm.location_id);
        match self.transport.request(Method::GET, &path, None).await {
            Ok(response) => Ok(HealthStatus {
                healthy: true,
                api_accessible: true,
                location_name: response
                    .pointer("/location/name")
                    .or_else(|| response.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                error: None,
                rate_limit_remaining: self.limiter.available().await,
                checked_at: Utc::now(),
            }),
            Err(CrmError::Provider { status, message }) => Ok(HealthStatus {
                healthy: false,
                api_accessible: true,
                location_name: None,
                error: Some(format!("{}: {}", status, message)),
                rate_limit_remaining: self.limiter.available().await,
                checked_at: Utc::now(),
            }),
            Err(error) => Err(error),
        }
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Stop the background processor after a final drain. Idempotent.
    pub async fn shutdown(&self) {
        let handle = self.processor.lock().await.take();
        if let Some(handle) = handle {
            handle.stop(self.config.batch.shutdown_grace).await;
        }
    }

    async fn submit_and_wait(&self, requests: Vec<BatchRequest>) -> Vec<BatchResult> {
        let handles = self.submit(requests).await;
        join_all(handles.into_iter().map(PendingHandle::wait)).await
    }
}
