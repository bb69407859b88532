//! Chunk executors: how a drained chunk of requests turns into CRM
//! traffic.
//!
//! Contact creates go through the provider's bulk upsert endpoint, one
//! call per chunk, with results mapped back positionally. Every other
//! operation has no bulk endpoint, so its executor fires the item
//! calls concurrently and isolates failures per item.

use super::metrics::MetricsCollector;
use super::rate_limiter::SlidingWindowLimiter;
use super::types::{BatchError, BatchRequest, BatchResult, OperationKind, RequestPayload};
use crate::crm::transport::CrmTransport;
use crate::crm::types::custom_fields_wire;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Method;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Executes one homogeneous chunk of requests. Implementations must
/// return exactly one result per input, in input order.
#[async_trait]
pub trait ChunkExecutor: Send + Sync {
    async fn execute(&self, chunk: &[BatchRequest]) -> Vec<BatchResult>;
}

/// Maps each operation kind to its executor.
pub struct ExecutorRegistry {
    executors: HashMap<OperationKind, Arc<dyn ChunkExecutor>>,
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// The stock wiring: bulk upsert for contact creates, per-item
    /// dispatch for everything else.
    pub fn standard(
        transport: Arc<dyn CrmTransport>,
        limiter: SlidingWindowLimiter,
        metrics: Arc<MetricsCollector>,
        location_id: String,
    ) -> Self {
        let bulk: Arc<dyn ChunkExecutor> = Arc::new(BulkExecutor {
            transport: Arc::clone(&transport),
            limiter: limiter.clone(),
            metrics: Arc::clone(&metrics),
            location_id: location_id.clone(),
        });
        let per_item: Arc<dyn ChunkExecutor> = Arc::new(PerItemExecutor {
            transport,
            limiter,
            metrics,
            location_id,
        });

        let mut registry = Self::empty();
        registry.register(OperationKind::ContactCreate, bulk);
        for kind in [
            OperationKind::ContactUpdate,
            OperationKind::TagAdd,
            OperationKind::TagRemove,
            OperationKind::OpportunityCreate,
            OperationKind::OpportunityUpdate,
            OperationKind::CustomFieldUpdate,
        ] {
            registry.register(kind, Arc::clone(&per_item));
        }
        registry
    }

    pub fn register(&mut self, kind: OperationKind, executor: Arc<dyn ChunkExecutor>) {
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: OperationKind) -> Option<Arc<dyn ChunkExecutor>> {
        self.executors.get(&kind).map(Arc::clone)
    }
}

/// One bulk-upsert call per chunk of contact creates.
pub struct BulkExecutor {
    transport: Arc<dyn CrmTransport>,
    limiter: SlidingWindowLimiter,
    metrics: Arc<MetricsCollector>,
    location_id: String,
}

#[async_trait]
impl ChunkExecutor for BulkExecutor {
    async fn execute(&self, chunk: &[BatchRequest]) -> Vec<BatchResult> {
        let contacts: Vec<Value> = chunk
            .iter()
            .map(|request| match &request.payload {
                RequestPayload::Contact(contact) => contact.to_wire(&self.location_id),
                // Validation keeps other variants out of this bucket.
                _ => json!({}),
            })
            .collect();
        let body = json!({
            "locationId": self.location_id,
            "contacts": contacts,
        });

        let waited = self.limiter.acquire().await;
        self.metrics.record_rate_limit_wait(waited);

        // Latency covers the provider call only; throttle waits are
        // already counted as rate_limit_violations.
        let started = Instant::now();
        let outcome = self
            .transport
            .request(Method::POST, "/contacts/bulk-upsert", Some(&body))
            .await;
        let latency = started.elapsed();

        match outcome {
            Ok(response) => {
                let mapped = response
                    .get("contacts")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if mapped.len() != chunk.len() {
                    warn!(
                        expected = chunk.len(),
                        got = mapped.len(),
                        "bulk upsert returned wrong cardinality"
                    );
                    let error = BatchError::ResponseMapping {
                        expected: chunk.len(),
                        got: mapped.len(),
                    };
                    // Positional mapping is unreliable; pair what we can
                    // and fail the remainder.
                    return chunk
                        .iter()
                        .enumerate()
                        .map(|(i, request)| match mapped.get(i) {
                            Some(item) => BatchResult::ok(request.id, item.clone(), latency),
                            None => BatchResult::err(request.id, error.clone(), latency),
                        })
                        .collect();
                }
                chunk
                    .iter()
                    .zip(mapped)
                    .map(|(request, item)| BatchResult::ok(request.id, item, latency))
                    .collect()
            }
            Err(error) => chunk
                .iter()
                .map(|request| BatchResult::err(request.id, error.clone().into(), latency))
                .collect(),
        }
    }
}

/// Concurrent per-item dispatch for operations without a bulk endpoint.
pub struct PerItemExecutor {
    transport: Arc<dyn CrmTransport>,
    limiter: SlidingWindowLimiter,
    metrics: Arc<MetricsCollector>,
    location_id: String,
}

impl PerItemExecutor {
    fn route(&self, request: &BatchRequest) -> Result<(Method, String, Value), BatchError> {
        let target = request.target_id.clone().unwrap_or_default();
        match (&request.kind, &request.payload) {
            (OperationKind::ContactUpdate, RequestPayload::ContactFields(fields)) => Ok((
                Method::PUT,
                format!("/contacts/{}", target),
                fields.to_wire(),
            )),
            (OperationKind::TagAdd, RequestPayload::Tags(tags)) => Ok((
                Method::POST,
                format!("/contacts/{}/tags", target),
                json!({ "tags": tags }),
            )),
            (OperationKind::TagRemove, RequestPayload::Tags(tags)) => Ok((
                Method::DELETE,
                format!("/contacts/{}/tags", target),
                json!({ "tags": tags }),
            )),
            (OperationKind::OpportunityCreate, RequestPayload::Opportunity(opportunity)) => Ok((
                Method::POST,
                "/opportunities".to_string(),
                opportunity.to_wire(&self.location_id),
            )),
            (OperationKind::OpportunityUpdate, RequestPayload::Opportunity(opportunity)) => Ok((
                Method::PUT,
                format!("/opportunities/{}", target),
                opportunity.to_wire(&self.location_id),
            )),
            (OperationKind::CustomFieldUpdate, RequestPayload::CustomFields(fields)) => Ok((
                Method::PUT,
                format!("/contacts/{}", target),
                json!({ "customFields": custom_fields_wire(fields) }),
            )),
            (kind, _) => Err(BatchError::UnsupportedOperation(*kind)),
        }
    }

    async fn execute_one(&self, request: &BatchRequest) -> BatchResult {
        let (method, path, body) = match self.route(request) {
            Ok(route) => route,
            Err(error) => return BatchResult::err(request.id, error, Duration::ZERO),
        };

        let waited = self.limiter.acquire().await;
        self.metrics.record_rate_limit_wait(waited);

        // Latency covers the provider call only; throttle waits are
        // already counted as rate_limit_violations.
        let started = Instant::now();
        match self.transport.request(method, &path, Some(&body)).await {
            Ok(response) => BatchResult::ok(request.id, response, started.elapsed()),
            Err(error) => BatchResult::err(request.id, error.into(), started.elapsed()),
        }
    }
}

#[async_trait]
impl ChunkExecutor for PerItemExecutor {
    async fn execute(&self, chunk: &[BatchRequest]) -> Vec<BatchResult> {
        join_all(chunk.iter().map(|request| self.execute_one(request))).await
    }
}
