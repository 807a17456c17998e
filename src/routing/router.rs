//! # Request Router
//!
//! The single entry point for inbound traffic. For every request the router
//! walks the admission pipeline strictly in order:
//!
//! 1. resolve the target service from the path's first segment
//! 2. rate limiter (policy rejection -> 429, counted as blocked)
//! 3. circuit breaker (open -> 503, never recorded as an outcome)
//! 4. health snapshot (unhealthy -> 503, breaker trial released)
//! 5. dispatch through the connection pool with a bounded deadline
//! 6. record the outcome to the breaker exactly once, update metrics,
//!    transform the response
//!
//! Only calls that are actually attempted against a backend produce breaker
//! outcomes; rejections at steps 2-4 never do. Dispatch and outcome
//! recording run on a detached task: a client disconnect drops the handler
//! future, not the call, so the breaker always receives its outcome.

use chrono::Utc;
use metrics::{counter, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::pool::ConnectionPool;
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{
    BackendRequest, CallMetadata, GatewayResponse, HealthStatus, IncomingRequest, ResponseMetadata,
    RouteClass,
};
use crate::observability::health::HealthMonitor;
use crate::observability::metrics::SecurityMetrics;
use crate::traffic::circuit_breaker::CircuitBreakerRegistry;
use crate::traffic::rate_limiting::{Admission, RateLimiter};

/// Rate-limit class for a route prefix. Auth and AI prefixes carry their
/// own budgets; everything else shares the default policy.
fn class_for_prefix(prefix: &str) -> RouteClass {
    match prefix {
        "auth" => RouteClass::Auth,
        "ai" => RouteClass::Ai,
        _ => RouteClass::Default,
    }
}

pub struct Router {
    /// route prefix -> service name
    routes: HashMap<String, String>,
    rate_limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthMonitor>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<SecurityMetrics>,
    call_timeout: Duration,
}

impl Router {
    pub fn new(
        config: &GatewayConfig,
        pool: Arc<ConnectionPool>,
        rate_limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        health: Arc<HealthMonitor>,
        metrics: Arc<SecurityMetrics>,
    ) -> Self {
        let routes = config
            .services
            .iter()
            .map(|s| (s.route_prefix.clone(), s.name.clone()))
            .collect();

        Self {
            routes,
            rate_limiter,
            breakers,
            health,
            pool,
            metrics,
            call_timeout: config.call_timeout,
        }
    }

    /// Map a request path to (service, route class, backend method).
    fn resolve<'a>(&'a self, path: &str) -> GatewayResult<(&'a str, RouteClass, String)> {
        let trimmed = path.trim_start_matches('/');
        let (prefix, remainder) = match trimmed.split_once('/') {
            Some((prefix, remainder)) => (prefix, remainder),
            None => (trimmed, ""),
        };

        let service = self
            .routes
            .get(prefix)
            .ok_or_else(|| GatewayError::InvalidRoute {
                path: path.to_string(),
            })?;

        Ok((service.as_str(), class_for_prefix(prefix), remainder.to_string()))
    }

    /// Route one inbound request through the full admission pipeline.
    pub async fn route(&self, request: IncomingRequest) -> GatewayResult<GatewayResponse> {
        self.metrics.record_request();

        let (service, class, method) = self.resolve(&request.path)?;

        match self.rate_limiter.admit(class, &request.identity).await {
            Admission::Allowed { .. } => {}
            Admission::Rejected { retry_after } => {
                self.metrics.record_blocked();
                counter!("gateway_requests_rejected_total", "reason" => "rate_limited")
                    .increment(1);
                debug!(service, user = %request.identity.user_id, "Request rate limited");
                return Err(GatewayError::RateLimited {
                    retry_after_secs: (retry_after.as_secs_f64().ceil() as u64).max(1),
                });
            }
        }

        let breaker = self
            .breakers
            .get(service)
            .ok_or_else(|| GatewayError::internal(format!("No circuit breaker for {}", service)))?;

        if let Err(e) = breaker.is_call_allowed() {
            counter!("gateway_requests_rejected_total", "reason" => "circuit_open").increment(1);
            return Err(e);
        }

        if self.health.status(service) != HealthStatus::Healthy {
            // The breaker admitted this call; give back any half-open trial
            // slot it may have claimed, since no outcome will be recorded.
            breaker.abandon_trial();
            counter!("gateway_requests_rejected_total", "reason" => "unhealthy").increment(1);
            return Err(GatewayError::ServiceUnavailable {
                service: service.to_string(),
            });
        }

        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let backend_request = BackendRequest {
            method,
            http_method: request.method,
            payload: request.body,
            metadata: CallMetadata {
                user_id: request.identity.user_id,
                timestamp: Utc::now(),
                trace_id: trace_id.clone(),
            },
        };

        let started = Instant::now();

        // The call and its outcome recording run detached from this future.
        // If the client disconnects, axum drops the handler mid-await; the
        // spawned task still finishes and records exactly one outcome, so a
        // half-open trial can never be left dangling.
        let pool = Arc::clone(&self.pool);
        let metrics = Arc::clone(&self.metrics);
        let call_timeout = self.call_timeout;
        let task_service = service.to_string();
        let task_trace_id = trace_id.clone();
        let dispatch = tokio::spawn(async move {
            let result = pool
                .call(&task_service, &backend_request, call_timeout)
                .await;
            match &result {
                Ok(_) => {
                    breaker.record_success();
                    counter!("gateway_requests_total", "outcome" => "success").increment(1);
                }
                Err(e) => {
                    if e.counts_as_breaker_failure() {
                        breaker.record_failure();
                    } else {
                        breaker.abandon_trial();
                    }
                    metrics.record_failure();
                    counter!("gateway_requests_total", "outcome" => "failure").increment(1);
                    warn!(service = %task_service, %task_trace_id, error = %e, "Backend call failed");
                }
            }
            result
        });

        let response = match dispatch.await {
            Ok(result) => result?,
            Err(e) => {
                return Err(GatewayError::internal(format!(
                    "Dispatch task for {} failed: {}",
                    service, e
                )))
            }
        };

        let elapsed = started.elapsed();
        histogram!("gateway_request_duration_seconds", "service" => service.to_string())
            .record(elapsed.as_secs_f64());

        Ok(GatewayResponse {
            data: response.payload,
            metadata: ResponseMetadata {
                service: service.to_string(),
                trace_id,
                duration_ms: elapsed.as_millis() as u64,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pool::BackendTransport;
    use crate::core::types::{BackendResponse, Identity, ServiceDescriptor};
    use crate::observability::health::HealthMonitorConfig;
    use crate::traffic::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::traffic::rate_limiting::{InMemoryStore, RateLimitSettings, RoutePolicy};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    struct ScriptedTransport {
        fail: AtomicBool,
        delay_ms: AtomicU64,
        calls: AtomicU32,
        last_http_method: Mutex<Option<String>>,
    }

    impl ScriptedTransport {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                delay_ms: AtomicU64::new(0),
                calls: AtomicU32::new(0),
                last_http_method: Mutex::new(None),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendTransport for ScriptedTransport {
        async fn call(
            &self,
            request: &BackendRequest,
            _deadline: Duration,
        ) -> GatewayResult<BackendResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_http_method.lock() = Some(request.http_method.clone());
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                Err(GatewayError::transport("backend", "connection reset"))
            } else {
                Ok(BackendResponse {
                    payload: serde_json::json!({"echo": request.payload, "method": request.method}),
                    metadata: HashMap::new(),
                })
            }
        }

        async fn probe(&self, _deadline: Duration) -> GatewayResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                Err(GatewayError::transport("backend", "probe refused"))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        router: Router,
        metrics: Arc<SecurityMetrics>,
        health: Arc<HealthMonitor>,
        breakers: Arc<CircuitBreakerRegistry>,
        transports: HashMap<String, Arc<ScriptedTransport>>,
    }

    fn harness(mut config: GatewayConfig) -> Harness {
        config.services = vec![
            ServiceDescriptor {
                name: "message-service".to_string(),
                address: "http://message-service:8082".to_string(),
                route_prefix: "messages".to_string(),
            },
            ServiceDescriptor {
                name: "ai-service".to_string(),
                address: "http://ai-service:8083".to_string(),
                route_prefix: "ai".to_string(),
            },
        ];

        let mut scripted = HashMap::new();
        let mut transports: HashMap<String, Arc<dyn BackendTransport>> = HashMap::new();
        for service in &config.services {
            let transport = ScriptedTransport::healthy();
            scripted.insert(service.name.clone(), transport.clone());
            let dynamic: Arc<dyn BackendTransport> = transport;
            transports.insert(service.name.clone(), dynamic);
        }

        let pool = Arc::new(ConnectionPool::with_transports(transports));
        let rate_limiter = Arc::new(RateLimiter::with_store(
            Arc::new(InMemoryStore::new()),
            &config.rate_limit,
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::from_services(
            config.services.iter().map(|s| s.name.as_str()),
            config.circuit_breaker.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            HealthMonitorConfig::default(),
            config.services.iter().map(|s| s.name.as_str()),
        ));
        let metrics = Arc::new(SecurityMetrics::new());

        let router = Router::new(
            &config,
            pool,
            rate_limiter,
            Arc::clone(&breakers),
            Arc::clone(&health),
            Arc::clone(&metrics),
        );

        Harness {
            router,
            metrics,
            health,
            breakers,
            transports: scripted,
        }
    }

    fn chat_request(user: &str) -> IncomingRequest {
        IncomingRequest {
            method: "POST".to_string(),
            path: "/messages/chat/42".to_string(),
            identity: Identity {
                user_id: user.to_string(),
                role: "member".to_string(),
            },
            trace_id: Some("trace-1".to_string()),
            body: serde_json::json!({"text": "hello"}),
        }
    }

    #[tokio::test]
    async fn test_success_path_transforms_response() {
        let h = harness(GatewayConfig::default());

        let response = h.router.route(chat_request("u1")).await.unwrap();
        assert_eq!(response.data["method"], "chat/42");
        assert_eq!(response.data["echo"]["text"], "hello");
        assert_eq!(response.metadata.service, "message-service");
        assert_eq!(response.metadata.trace_id, "trace-1");

        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.failed_requests, 0);
        assert_eq!(snapshot.blocked_requests, 0);

        // The caller's HTTP verb is forwarded to the backend
        assert_eq!(
            h.transports["message-service"]
                .last_http_method
                .lock()
                .as_deref(),
            Some("POST")
        );
    }

    #[tokio::test]
    async fn test_unknown_prefix_is_invalid_route() {
        let h = harness(GatewayConfig::default());

        let err = h
            .router
            .route(IncomingRequest {
                path: "/payments/checkout".to_string(),
                ..chat_request("u1")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRoute { .. }));
        assert_eq!(h.transports["message-service"].calls(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_before_backend() {
        let mut config = GatewayConfig::default();
        config.rate_limit = RateLimitSettings::default();
        config.rate_limit.policies.insert(
            RouteClass::Default,
            RoutePolicy {
                window: Duration::from_secs(60),
                max_requests: 2,
            },
        );
        let h = harness(config);

        for _ in 0..2 {
            h.router.route(chat_request("u1")).await.unwrap();
        }
        let err = h.router.route(chat_request("u1")).await.unwrap_err();

        match err {
            GatewayError::RateLimited { retry_after_secs } => assert!(retry_after_secs > 0),
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert_eq!(h.transports["message-service"].calls(), 2);
        assert_eq!(h.metrics.snapshot().blocked_requests, 1);
        // A different user is not affected
        h.router.route(chat_request("u2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_unhealthy_service_rejected_before_pool() {
        let h = harness(GatewayConfig::default());
        h.health.apply_probe_result(
            "message-service",
            Err(GatewayError::transport("message-service", "down")),
        );

        let err = h.router.route(chat_request("u1")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ServiceUnavailable { .. }));
        assert_eq!(h.transports["message-service"].calls(), 0);

        // Recovery probe re-admits traffic
        h.health.apply_probe_result("message-service", Ok(()));
        h.router.route(chat_request("u1")).await.unwrap();
        assert_eq!(h.transports["message-service"].calls(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_short_circuits() {
        let mut config = GatewayConfig::default();
        config.circuit_breaker = CircuitBreakerConfig {
            volume_threshold: 3,
            ..CircuitBreakerConfig::default()
        };
        let h = harness(config);
        h.transports["ai-service"].fail.store(true, Ordering::SeqCst);

        let ai_request = |u: &str| IncomingRequest {
            path: "/ai/agents/chat".to_string(),
            ..chat_request(u)
        };

        for i in 0..3 {
            let err = h.router.route(ai_request(&format!("u{}", i))).await.unwrap_err();
            assert!(matches!(err, GatewayError::Transport { .. }));
        }
        assert_eq!(
            h.breakers.get("ai-service").unwrap().state(),
            CircuitState::Open
        );

        // 4th request is rejected without contacting the backend
        let err = h.router.route(ai_request("u9")).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        assert_eq!(h.transports["ai-service"].calls(), 3);
        assert_eq!(h.metrics.snapshot().failed_requests, 3);
    }

    #[tokio::test]
    async fn test_outcome_recorded_when_caller_disconnects() {
        let mut config = GatewayConfig::default();
        config.circuit_breaker = CircuitBreakerConfig {
            volume_threshold: 3,
            reset_timeout: Duration::from_millis(100),
            ..CircuitBreakerConfig::default()
        };
        let h = harness(config);
        let transport = &h.transports["ai-service"];
        transport.fail.store(true, Ordering::SeqCst);

        let ai_request = |u: &str| IncomingRequest {
            path: "/ai/agents/chat".to_string(),
            ..chat_request(u)
        };

        for i in 0..3 {
            let _ = h.router.route(ai_request(&format!("u{}", i))).await;
        }
        assert_eq!(
            h.breakers.get("ai-service").unwrap().state(),
            CircuitState::Open
        );

        // Backend recovers, but the half-open trial call takes long enough
        // that the caller gives up and the route future is dropped mid-call.
        transport.fail.store(false, Ordering::SeqCst);
        transport.delay_ms.store(200, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            h.router.route(ai_request("u9")),
        )
        .await;
        assert!(dropped.is_err());

        // The detached dispatch still completes and records the trial
        // outcome; the breaker must not stay wedged half-open.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            h.breakers.get("ai-service").unwrap().state(),
            CircuitState::Closed
        );

        transport.delay_ms.store(0, Ordering::SeqCst);
        h.router.route(ai_request("u10")).await.unwrap();
    }

    #[tokio::test]
    async fn test_breaker_outcome_recorded_exactly_once() {
        let h = harness(GatewayConfig::default());

        h.router.route(chat_request("u1")).await.unwrap();
        let snapshot = h.breakers.get("message-service").unwrap().snapshot();
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.failure_count, 0);

        h.transports["message-service"].fail.store(true, Ordering::SeqCst);
        let _ = h.router.route(chat_request("u1")).await;
        let snapshot = h.breakers.get("message-service").unwrap().snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.failure_count, 1);
    }

    #[tokio::test]
    async fn test_route_class_selection() {
        let h = harness(GatewayConfig::default());
        let (service, class, method) = h.router.resolve("/ai/agents/chat").unwrap();
        assert_eq!(service, "ai-service");
        assert_eq!(class, RouteClass::Ai);
        assert_eq!(method, "agents/chat");

        let (service, class, method) = h.router.resolve("/messages").unwrap();
        assert_eq!(service, "message-service");
        assert_eq!(class, RouteClass::Default);
        assert_eq!(method, "");

        assert!(h.router.resolve("/").is_err());
    }

    #[tokio::test]
    async fn test_missing_trace_id_is_minted() {
        let h = harness(GatewayConfig::default());
        let response = h
            .router
            .route(IncomingRequest {
                trace_id: None,
                ..chat_request("u1")
            })
            .await
            .unwrap();
        assert!(!response.metadata.trace_id.is_empty());
    }
}
