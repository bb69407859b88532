//! Lock-free batching counters and derived rates.

use super::types::BatchResult;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic counters updated from the hot path with relaxed atomics.
/// Read via [`snapshot`](MetricsCollector::snapshot), which also
/// derives the rates.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    total_requests: AtomicU64,
    batched_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    deduplicated_requests: AtomicU64,
    rate_limit_violations: AtomicU64,
    retries_executed: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_wait(&self, waited: Duration) {
        if !waited.is_zero() {
            self.rate_limit_violations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fold one executed chunk's results in.
    pub fn record_batch(&self, results: &[BatchResult]) {
        self.batched_requests
            .fetch_add(results.len() as u64, Ordering::Relaxed);
        for result in results {
            if result.success {
                self.successful_requests.fetch_add(1, Ordering::Relaxed);
            } else {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
            }
            self.total_latency_ms
                .fetch_add(result.latency.as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let batched_requests = self.batched_requests.load(Ordering::Relaxed);
        let successful_requests = self.successful_requests.load(Ordering::Relaxed);
        let failed_requests = self.failed_requests.load(Ordering::Relaxed);
        let completed = successful_requests + failed_requests;
        let total_latency_ms = self.total_latency_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_requests,
            batched_requests,
            successful_requests,
            failed_requests,
            deduplicated_requests: self.deduplicated_requests.load(Ordering::Relaxed),
            rate_limit_violations: self.rate_limit_violations.load(Ordering::Relaxed),
            retries_executed: self.retries_executed.load(Ordering::Relaxed),
            average_latency_ms: if completed > 0 {
                total_latency_ms as f64 / completed as f64
            } else {
                0.0
            },
            success_rate_percent: if completed > 0 {
                successful_requests as f64 / completed as f64 * 100.0
            } else {
                0.0
            },
            batch_efficiency_percent: if total_requests > 0 {
                batched_requests as f64 / total_requests as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.batched_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.deduplicated_requests.store(0, Ordering::Relaxed);
        self.rate_limit_violations.store(0, Ordering::Relaxed);
        self.retries_executed.store(0, Ordering::Relaxed);
        self.total_latency_ms.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time view of the collector, including derived rates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub batched_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub deduplicated_requests: u64,
    pub rate_limit_violations: u64,
    pub retries_executed: u64,
    pub average_latency_ms: f64,
    pub success_rate_percent: f64,
    pub batch_efficiency_percent: f64,
}
