//! # Health Monitor
//!
//! Periodically probes every backend connection and keeps one
//! HEALTHY/UNHEALTHY record per service. This is deliberately independent of
//! the circuit breaker: the breaker reacts to failures of real traffic, the
//! monitor proactively catches sustained outages (backend process down) even
//! when no requests are flowing.
//!
//! Probes run on a background task per service, decoupled from request
//! traffic, and are cancelled at shutdown through a [`CancellationToken`].
//! A probe never holds any request-path lock beyond the single record write.
//!
//! A status flip requires `failure_threshold` consecutive probe failures
//! (default 1: a single failed probe marks the service unhealthy, matching
//! the platform's historical behavior; raise it to damp flapping under
//! transient network blips). A single successful probe always flips back to
//! healthy.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::pool::ConnectionPool;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{HealthRecord, HealthStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    /// Time between probes of one service
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Deadline for a single probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Consecutive probe failures before a service is marked unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 1,
        }
    }
}

impl HealthMonitorConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.interval.is_zero() {
            return Err(GatewayError::config("health.interval must be non-zero"));
        }
        if self.probe_timeout.is_zero() {
            return Err(GatewayError::config("health.probe_timeout must be non-zero"));
        }
        if self.failure_threshold == 0 {
            return Err(GatewayError::config("health.failure_threshold must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ServiceHealth {
    record: HealthRecord,
    consecutive_failures: u32,
}

/// Tracks health state for every configured service.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    records: DashMap<String, ServiceHealth>,
}

impl HealthMonitor {
    /// Services start healthy until the first probe completes, so a cold
    /// start does not reject traffic for up to one probe interval.
    pub fn new<'a, I>(config: HealthMonitorConfig, services: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let records = DashMap::new();
        for name in services {
            records.insert(
                name.to_string(),
                ServiceHealth {
                    record: HealthRecord {
                        service_name: name.to_string(),
                        status: HealthStatus::Healthy,
                        last_checked_at: None,
                    },
                    consecutive_failures: 0,
                },
            );
        }
        Self { config, records }
    }

    /// Current status for a service. Eventually consistent: a request may
    /// race a status flip, which is acceptable by design. Unknown services
    /// read as unhealthy.
    pub fn status(&self, service: &str) -> HealthStatus {
        self.records
            .get(service)
            .map(|s| s.record.status)
            .unwrap_or(HealthStatus::Unhealthy)
    }

    /// Copy of all health records, sorted by service name.
    pub fn snapshot(&self) -> Vec<HealthRecord> {
        let mut records: Vec<_> = self.records.iter().map(|s| s.record.clone()).collect();
        records.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        records
    }

    /// Fold one probe outcome into the record. This is the only place
    /// health state is mutated.
    pub fn apply_probe_result(&self, service: &str, result: GatewayResult<()>) {
        let Some(mut entry) = self.records.get_mut(service) else {
            return;
        };
        entry.record.last_checked_at = Some(Utc::now());

        match result {
            Ok(()) => {
                if entry.record.status == HealthStatus::Unhealthy {
                    info!(service, "Backend recovered, marking healthy");
                }
                entry.consecutive_failures = 0;
                entry.record.status = HealthStatus::Healthy;
            }
            Err(e) => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.config.failure_threshold
                    && entry.record.status == HealthStatus::Healthy
                {
                    warn!(
                        service,
                        failures = entry.consecutive_failures,
                        error = %e,
                        "Backend probe failing, marking unhealthy"
                    );
                    entry.record.status = HealthStatus::Unhealthy;
                } else {
                    debug!(service, error = %e, "Backend probe failed");
                }
            }
        }
    }

    /// Start one probe task per service. Tasks stop when `shutdown` fires.
    pub fn spawn_probes(
        self: &Arc<Self>,
        pool: &Arc<ConnectionPool>,
        shutdown: CancellationToken,
    ) -> GatewayResult<()> {
        for service in pool.service_names() {
            let transport = pool.transport(&service)?;
            let monitor = Arc::clone(self);
            let token = shutdown.clone();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitor.config.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(service = %service, "Health probe task stopped");
                            break;
                        }
                        _ = ticker.tick() => {
                            let result = transport.probe(monitor.config.probe_timeout).await;
                            monitor.apply_probe_result(&service, result);
                        }
                    }
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pool::BackendTransport;
    use crate::core::types::{BackendRequest, BackendResponse};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn probe_failure() -> GatewayResult<()> {
        Err(GatewayError::transport("svc", "connection refused"))
    }

    #[test]
    fn test_starts_healthy_until_first_probe() {
        let monitor = HealthMonitor::new(HealthMonitorConfig::default(), ["auth-service"]);
        assert_eq!(monitor.status("auth-service"), HealthStatus::Healthy);
        assert!(monitor.snapshot()[0].last_checked_at.is_none());
    }

    #[test]
    fn test_single_failure_flips_unhealthy_by_default() {
        let monitor = HealthMonitor::new(HealthMonitorConfig::default(), ["auth-service"]);
        monitor.apply_probe_result("auth-service", probe_failure());
        assert_eq!(monitor.status("auth-service"), HealthStatus::Unhealthy);

        // Single success flips straight back
        monitor.apply_probe_result("auth-service", Ok(()));
        assert_eq!(monitor.status("auth-service"), HealthStatus::Healthy);
    }

    #[test]
    fn test_failure_threshold_damps_flapping() {
        let config = HealthMonitorConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(config, ["ai-service"]);

        monitor.apply_probe_result("ai-service", probe_failure());
        monitor.apply_probe_result("ai-service", probe_failure());
        assert_eq!(monitor.status("ai-service"), HealthStatus::Healthy);

        monitor.apply_probe_result("ai-service", probe_failure());
        assert_eq!(monitor.status("ai-service"), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let config = HealthMonitorConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(config, ["ai-service"]);

        monitor.apply_probe_result("ai-service", probe_failure());
        monitor.apply_probe_result("ai-service", Ok(()));
        monitor.apply_probe_result("ai-service", probe_failure());
        assert_eq!(monitor.status("ai-service"), HealthStatus::Healthy);
    }

    #[test]
    fn test_unknown_service_reads_unhealthy() {
        let monitor = HealthMonitor::new(HealthMonitorConfig::default(), ["auth-service"]);
        assert_eq!(monitor.status("ghost-service"), HealthStatus::Unhealthy);
    }

    struct FlakyTransport {
        healthy: AtomicBool,
        probes: AtomicU32,
    }

    #[async_trait]
    impl BackendTransport for FlakyTransport {
        async fn call(
            &self,
            _request: &BackendRequest,
            _deadline: Duration,
        ) -> GatewayResult<BackendResponse> {
            unreachable!("health tests never dispatch calls")
        }

        async fn probe(&self, _deadline: Duration) -> GatewayResult<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(GatewayError::transport("svc", "probe refused"))
            }
        }
    }

    #[tokio::test]
    async fn test_probe_task_tracks_backend_and_stops_on_cancel() {
        let transport = Arc::new(FlakyTransport {
            healthy: AtomicBool::new(false),
            probes: AtomicU32::new(0),
        });
        let mut transports: HashMap<String, Arc<dyn BackendTransport>> = HashMap::new();
        transports.insert("message-service".to_string(), transport.clone());
        let pool = Arc::new(ConnectionPool::with_transports(transports));

        let config = HealthMonitorConfig {
            interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(100),
            failure_threshold: 1,
        };
        let monitor = Arc::new(HealthMonitor::new(config, ["message-service"]));
        let shutdown = CancellationToken::new();
        monitor.spawn_probes(&pool, shutdown.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(monitor.status("message-service"), HealthStatus::Unhealthy);

        transport.healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(monitor.status("message-service"), HealthStatus::Healthy);

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let probes_at_cancel = transport.probes.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.probes.load(Ordering::SeqCst), probes_at_cancel);
    }
}
