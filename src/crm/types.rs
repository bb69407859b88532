use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Contact data for a create/upsert call.
///
/// Field names follow the provider's camelCase wire format so payloads can be
/// serialized straight into request bodies. Custom fields are kept as a map
/// here and flattened into the provider's `[{id, value}]` array shape by
/// [`ContactPayload::to_wire`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ContactPayload {
    /// True when the payload carries at least one way to reach the contact.
    pub fn has_contact_info(&self) -> bool {
        self.email.is_some() || self.phone.is_some()
    }

    /// Build the provider wire body for this contact.
    pub fn to_wire(&self, location_id: &str) -> Value {
        let mut body = json!({
            "locationId": location_id,
            "firstName": self.first_name,
            "lastName": self.last_name,
            "email": self.email,
            "phone": self.phone,
            "tags": self.tags,
        });
        if let Some(source) = &self.source {
            body["source"] = json!(source);
        }
        if !self.custom_fields.is_empty() {
            body["customFields"] = custom_fields_wire(&self.custom_fields);
        }
        body
    }
}

/// Partial contact update. Only set fields are sent to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: BTreeMap<String, Value>,
}

impl ContactFields {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.email.is_none()
            && self.phone.is_none()
            && self.tags.is_empty()
            && self.custom_fields.is_empty()
    }

    pub fn to_wire(&self) -> Value {
        let mut body = json!({});
        if let Some(v) = &self.first_name {
            body["firstName"] = json!(v);
        }
        if let Some(v) = &self.last_name {
            body["lastName"] = json!(v);
        }
        if let Some(v) = &self.email {
            body["email"] = json!(v);
        }
        if let Some(v) = &self.phone {
            body["phone"] = json!(v);
        }
        if !self.tags.is_empty() {
            body["tags"] = json!(self.tags);
        }
        if !self.custom_fields.is_empty() {
            body["customFields"] = custom_fields_wire(&self.custom_fields);
        }
        body
    }
}

/// Opportunity data for pipeline create/update calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityPayload {
    pub name: String,
    pub contact_id: String,
    pub pipeline_id: String,
    pub pipeline_stage_id: String,
    #[serde(default)]
    pub monetary_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl OpportunityPayload {
    pub fn to_wire(&self, location_id: &str) -> Value {
        let mut body = json!({
            "locationId": location_id,
            "name": self.name,
            "contactId": self.contact_id,
            "pipelineId": self.pipeline_id,
            "pipelineStageId": self.pipeline_stage_id,
            "monetaryValue": self.monetary_value,
        });
        if let Some(assigned_to) = &self.assigned_to {
            body["assignedTo"] = json!(assigned_to);
        }
        if let Some(source) = &self.source {
            body["source"] = json!(source);
        }
        body
    }
}

/// A contact update paired with its target contact id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactUpdate {
    pub id: String,
    pub fields: ContactFields,
}

/// Tags to apply to one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagEntry {
    pub id: String,
    pub tags: Vec<String>,
}

/// Connectivity report from [`health_check`](crate::batch::BatchClient::health_check).
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub api_accessible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Requests the limiter would currently admit without delay.
    pub rate_limit_remaining: usize,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

/// Errors from the CRM transport boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CrmError {
    #[error("network error: {0}")]
    Network(String),
    #[error("provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("transport configuration error: {0}")]
    Configuration(String),
}

/// Flatten a custom-field map into the provider's `[{id, value}]` array,
/// skipping entries with empty field ids.
pub(crate) fn custom_fields_wire(fields: &BTreeMap<String, Value>) -> Value {
    let entries: Vec<Value> = fields
        .iter()
        .filter(|(id, _)| !id.is_empty())
        .map(|(id, value)| json!({ "id": id, "value": value }))
        .collect();
    json!(entries)
}
