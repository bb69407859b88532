//! Request batching pipeline: dedup, accumulation, rate limiting, and
//! supervised background execution.

pub mod client;
pub mod dedup;
pub mod executor;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod rate_limiter;
pub mod types;

#[cfg(test)]
pub mod tests;

pub use client::{BatchClient, LeadSyncSummary, LeadUpdate, PendingHandle};
pub use dedup::{DedupIndex, dedup_key};
pub use executor::{ChunkExecutor, ExecutorRegistry};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use processor::{BatchProcessor, ProcessorHandle};
pub use queue::PendingQueue;
pub use rate_limiter::SlidingWindowLimiter;
pub use types::{
    BatchError, BatchRequest, BatchResult, OperationKind, RequestId, RequestPayload,
};
