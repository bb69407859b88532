use crate::crm::types::{ContactFields, ContactPayload, CrmError, OpportunityPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Time-ordered unique id for a submitted request (UUID v7).
pub type RequestId = Uuid;

/// The CRM operations the batcher knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    ContactCreate,
    ContactUpdate,
    TagAdd,
    TagRemove,
    OpportunityCreate,
    OpportunityUpdate,
    CustomFieldUpdate,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::ContactCreate => "contact-create",
            OperationKind::ContactUpdate => "contact-update",
            OperationKind::TagAdd => "tag-add",
            OperationKind::TagRemove => "tag-remove",
            OperationKind::OpportunityCreate => "opportunity-create",
            OperationKind::OpportunityUpdate => "opportunity-update",
            OperationKind::CustomFieldUpdate => "custom-field-update",
        };
        write!(f, "{}", name)
    }
}

/// Typed payload, one variant per operation family. Validated when the
/// [`BatchRequest`] is constructed, not at the network boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RequestPayload {
    Contact(ContactPayload),
    ContactFields(ContactFields),
    Tags(Vec<String>),
    Opportunity(OpportunityPayload),
    CustomFields(BTreeMap<String, Value>),
}

impl RequestPayload {
    /// Check that this payload shape fits the operation and target.
    pub fn validate(&self, kind: OperationKind, target_id: Option<&str>) -> Result<(), BatchError> {
        let needs_target = !matches!(kind, OperationKind::ContactCreate | OperationKind::OpportunityCreate);
        if needs_target && target_id.map_or(true, str::is_empty) {
            return Err(BatchError::InvalidPayload(format!(
                "{} requires a target id",
                kind
            )));
        }

        match (kind, self) {
            (OperationKind::ContactCreate, RequestPayload::Contact(contact)) => {
                if !contact.has_contact_info() {
                    return Err(BatchError::InvalidPayload(
                        "contact-create requires an email or phone".to_string(),
                    ));
                }
                Ok(())
            }
            (OperationKind::ContactUpdate, RequestPayload::ContactFields(fields)) => {
                if fields.is_empty() {
                    return Err(BatchError::InvalidPayload(
                        "contact-update requires at least one field".to_string(),
                    ));
                }
                Ok(())
            }
            (OperationKind::TagAdd | OperationKind::TagRemove, RequestPayload::Tags(tags)) => {
                if tags.is_empty() {
                    return Err(BatchError::InvalidPayload("tag list is empty".to_string()));
                }
                Ok(())
            }
            (
                OperationKind::OpportunityCreate | OperationKind::OpportunityUpdate,
                RequestPayload::Opportunity(_),
            ) => Ok(()),
            (OperationKind::CustomFieldUpdate, RequestPayload::CustomFields(fields)) => {
                if fields.is_empty() {
                    return Err(BatchError::InvalidPayload(
                        "custom-field-update requires at least one field".to_string(),
                    ));
                }
                Ok(())
            }
            (kind, _) => Err(BatchError::InvalidPayload(format!(
                "payload variant does not match operation {}",
                kind
            ))),
        }
    }
}

/// A unit of work accepted by [`submit`](crate::batch::BatchClient::submit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub id: RequestId,
    pub kind: OperationKind,
    /// Absent for creates.
    pub target_id: Option<String>,
    pub payload: RequestPayload,
    pub created_at: DateTime<Utc>,
}

impl BatchRequest {
    /// Build and validate a request. Ids are UUID v7 so they sort by
    /// submission time.
    pub fn new(
        kind: OperationKind,
        target_id: Option<String>,
        payload: RequestPayload,
    ) -> Result<Self, BatchError> {
        payload.validate(kind, target_id.as_deref())?;
        Ok(Self {
            id: Uuid::now_v7(),
            kind,
            target_id,
            payload,
            created_at: Utc::now(),
        })
    }
}

/// Outcome of one submitted request.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub request_id: RequestId,
    pub success: bool,
    pub response: Option<Value>,
    pub error: Option<BatchError>,
    pub latency: Duration,
}

impl BatchResult {
    pub fn ok(request_id: RequestId, response: Value, latency: Duration) -> Self {
        Self {
            request_id,
            success: true,
            response: Some(response),
            error: None,
            latency,
        }
    }

    pub fn err(request_id: RequestId, error: BatchError, latency: Duration) -> Self {
        Self {
            request_id,
            success: false,
            response: None,
            error: Some(error),
            latency,
        }
    }
}

/// Batch-pipeline error taxonomy. Per-item errors are carried inside
/// [`BatchResult`] and never propagate to sibling items.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Crm(#[from] CrmError),
    /// Self-throttling delay. Informational, not a failure.
    #[error("rate limited, waited {waited:?} for a slot")]
    RateLimited { waited: Duration },
    #[error("bulk response mismatch: expected {expected} results, got {got}")]
    ResponseMapping { expected: usize, got: usize },
    #[error("timed out after {0:?} waiting for batch result")]
    TimeoutWaitingForBatch(Duration),
    #[error("no executor registered for operation {0}")]
    UnsupportedOperation(OperationKind),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("pending queue is full ({depth} requests queued)")]
    QueueFull { depth: usize },
    #[error("result channel closed before completion")]
    ChannelClosed,
}
