//! # Security Metrics
//!
//! Process-wide monotone counters exposed through the gateway's
//! observability surface. These are deliberately simple: lock-free atomics
//! updated on the request path, reset only on process restart, read via a
//! snapshot copy (never a shared reference).
//!
//! Latency histograms and labelled outcome counters go through the
//! `metrics` facade instead; this struct is only the stable security
//! surface (`getSecurityMetrics`).

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SecurityMetrics {
    request_count: AtomicU64,
    failed_requests: AtomicU64,
    blocked_requests: AtomicU64,
}

impl SecurityMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one inbound request. Called exactly once per request, before
    /// any admission decision.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one failed backend call.
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one request blocked by rate limiting.
    pub fn record_blocked(&self) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of the current counter values.
    pub fn snapshot(&self) -> SecurityMetricsSnapshot {
        SecurityMetricsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of [`SecurityMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SecurityMetricsSnapshot {
    pub request_count: u64,
    pub failed_requests: u64,
    pub blocked_requests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increase_monotonically() {
        let metrics = SecurityMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_failure();
        metrics.record_blocked();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.blocked_requests, 1);
    }

    #[test]
    fn test_snapshot_is_idempotent_without_traffic() {
        let metrics = SecurityMetrics::new();
        metrics.record_request();
        assert_eq!(metrics.snapshot(), metrics.snapshot());
    }
}
