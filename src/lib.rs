//! # Leadflow
//!
//! A batching client for CRM lead automation. Requests accumulate into
//! short windows, get deduplicated against in-flight work, and execute
//! under a sliding-window rate limit so high-volume lead pipelines stay
//! inside provider quotas.
//!
//! ## Architecture Overview
//!
//! The crate is organized into three modules:
//!
//! - **[`batch`]**: The batching pipeline: pending queue, dedup index,
//!   rate limiter, chunk executors, and the supervised background processor
//! - **[`crm`]**: Provider types and the transport boundary (real HTTP
//!   client plus an offline mock for tests)
//! - **[`config`]**: Layered TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use leadflow::{BatchClient, LeadflowConfig, TagEntry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LeadflowConfig::default().with_env_overrides();
//!     let client = BatchClient::new(config)?;
//!
//!     let results = client
//!         .add_tags_batch(vec![TagEntry {
//!             id: "contact-123".to_string(),
//!             tags: vec!["hot-lead".to_string()],
//!         }])
//!         .await?;
//!     println!("tagged: {}", results.iter().filter(|r| r.success).count());
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Request batching pipeline.
///
/// Accumulates submitted requests per operation kind, coalesces
/// duplicates, and executes chunks in a supervised background task
/// under a sliding-window rate limit.
pub mod batch;

/// CRM provider types and transport.
///
/// Wire-format payloads, the transport trait, the HTTP implementation,
/// and a mock transport for offline tests.
pub mod crm;

/// Configuration loading and discovery.
///
/// TOML files discovered from the working directory upward, with
/// environment-variable overrides for secrets.
pub mod config;

// Re-export the batching surface
pub use batch::{
    BatchClient, BatchError, BatchRequest, BatchResult, LeadSyncSummary, LeadUpdate,
    MetricsSnapshot, OperationKind, PendingHandle, RequestPayload,
};

// Re-export provider types callers build payloads from
pub use crm::types::{
    ContactFields, ContactPayload, ContactUpdate, CrmError, HealthStatus, OpportunityPayload,
    TagEntry,
};
pub use crm::{CrmTransport, HttpTransport, MockTransport};

// Re-export configuration types
pub use config::{
    BatchConfig, ConfigDiscovery, ConfigError, CrmConfig, LeadflowConfig, RateLimitConfig,
};

/// Initialize structured logging for binaries embedding this crate.
///
/// Honors `RUST_LOG` when set, defaulting to `leadflow=info`. Safe to
/// call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("leadflow=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
