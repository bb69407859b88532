//! Duplicate-request detection over a short trailing window.
//!
//! Two requests are duplicates when they target the same operation, the
//! same record, and carry a semantically identical payload. The key is a
//! hash over the canonical JSON encoding of the payload, so field order
//! in the caller's source never matters.

use super::types::{BatchRequest, RequestId};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

/// Stable fingerprint of (operation, target, payload).
pub fn dedup_key(request: &BatchRequest) -> String {
    let payload = serde_json::to_string(&request.payload).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    request.kind.hash(&mut hasher);
    request.target_id.hash(&mut hasher);
    payload.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// In-flight fingerprint index. Entries expire after `window` so a
/// legitimate re-submission later on is not swallowed.
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: HashMap<String, (RequestId, Instant)>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of a fresh in-window duplicate of `request`, if one is queued.
    pub fn duplicate_of(&self, request: &BatchRequest, window: Duration) -> Option<RequestId> {
        let (id, seen_at) = *self.entries.get(&dedup_key(request))?;
        (Instant::now().duration_since(seen_at) < window).then_some(id)
    }

    /// Record `request` as the primary for its key. Call only once the
    /// request is actually queued; rejected requests must leave no
    /// trace here.
    pub fn register(&mut self, request: &BatchRequest) {
        self.entries
            .insert(dedup_key(request), (request.id, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything. Called when the pending queue is drained so the
    /// next accumulation window starts clean.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
