//! # Backend Connection Pool
//!
//! Owns one long-lived HTTP client per configured backend service,
//! established eagerly at startup. Exposes call-with-deadline; retry policy
//! is deliberately absent here — if a call is ever to be retried, that is
//! the router's decision, never silently duplicated inside the pool.
//!
//! [`BackendTransport`] is the seam the health monitor probes through and
//! the tests mock.

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::{Client, Method};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{BackendRequest, BackendResponse, ServiceDescriptor};

/// Unary transport to one backend service.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Issue one call with a bounded deadline. Exceeding the deadline is a
    /// failure outcome (`DeadlineExceeded`), not a distinct state.
    async fn call(
        &self,
        request: &BackendRequest,
        deadline: Duration,
    ) -> GatewayResult<BackendResponse>;

    /// Lightweight liveness call used by the health monitor.
    async fn probe(&self, deadline: Duration) -> GatewayResult<()>;
}

/// JSON-over-HTTP transport. The backends expose unary endpoints at
/// `{address}/{method}` and a liveness endpoint at `{address}/health`; the
/// caller's HTTP verb is forwarded as-is.
pub struct HttpTransport {
    service_name: String,
    base_url: String,
    client: Client,
}

impl HttpTransport {
    pub fn new(descriptor: &ServiceDescriptor) -> GatewayResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| {
                GatewayError::config(format!(
                    "Cannot build HTTP client for {}: {}",
                    descriptor.name, e
                ))
            })?;

        Ok(Self {
            service_name: descriptor.name.clone(),
            base_url: descriptor.address.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method.trim_start_matches('/'))
    }

    fn classify(&self, err: reqwest::Error, deadline: Duration) -> GatewayError {
        if err.is_timeout() {
            GatewayError::DeadlineExceeded {
                service: self.service_name.clone(),
                timeout_ms: deadline.as_millis() as u64,
            }
        } else {
            GatewayError::Transport {
                service: self.service_name.clone(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl BackendTransport for HttpTransport {
    async fn call(
        &self,
        request: &BackendRequest,
        deadline: Duration,
    ) -> GatewayResult<BackendResponse> {
        let url = self.endpoint(&request.method);
        debug!(service = %self.service_name, %url, trace_id = %request.metadata.trace_id, "Dispatching backend call");

        let verb = Method::from_bytes(request.http_method.as_bytes()).unwrap_or(Method::POST);
        let response = self
            .client
            .request(verb, &url)
            .timeout(deadline)
            .header("x-user-id", &request.metadata.user_id)
            .header("x-timestamp", request.metadata.timestamp.to_rfc3339())
            .header("x-trace-id", &request.metadata.trace_id)
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| self.classify(e, deadline))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Backend {
                service: self.service_name.clone(),
                message: format!("{}: {}", status, body.chars().take(200).collect::<String>()),
            });
        }

        // Echo back any metadata headers the backend set
        let metadata: HashMap<String, String> = response
            .headers()
            .iter()
            .filter(|(name, _)| name.as_str().starts_with("x-"))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let payload = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| self.classify(e, deadline))?;

        Ok(BackendResponse { payload, metadata })
    }

    async fn probe(&self, deadline: Duration) -> GatewayResult<()> {
        let url = self.endpoint("health");
        let response = self
            .client
            .get(&url)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| self.classify(e, deadline))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::Backend {
                service: self.service_name.clone(),
                message: format!("health probe returned {}", response.status()),
            })
        }
    }
}

/// One transport per configured service. Handles are created at startup and
/// torn down at shutdown; a missing handle at call time is a configuration
/// bug, not a per-request condition.
pub struct ConnectionPool {
    transports: HashMap<String, Arc<dyn BackendTransport>>,
}

impl ConnectionPool {
    /// Eagerly build transports for every configured service.
    pub fn from_services(services: &[ServiceDescriptor]) -> GatewayResult<Self> {
        let mut transports: HashMap<String, Arc<dyn BackendTransport>> = HashMap::new();
        for descriptor in services {
            let transport = HttpTransport::new(descriptor)?;
            transports.insert(descriptor.name.clone(), Arc::new(transport));
            info!(service = %descriptor.name, address = %descriptor.address, "Backend connection established");
        }
        Ok(Self { transports })
    }

    /// Build a pool from pre-constructed transports (tests).
    pub fn with_transports(transports: HashMap<String, Arc<dyn BackendTransport>>) -> Self {
        Self { transports }
    }

    pub fn transport(&self, service: &str) -> GatewayResult<Arc<dyn BackendTransport>> {
        self.transports
            .get(service)
            .cloned()
            .ok_or_else(|| GatewayError::internal(format!("No connection handle for {}", service)))
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.transports.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute one backend call with a bounded deadline.
    pub async fn call(
        &self,
        service: &str,
        request: &BackendRequest,
        deadline: Duration,
    ) -> GatewayResult<BackendResponse> {
        let transport = self.transport(service)?;
        let started = Instant::now();
        let result = transport.call(request, deadline).await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        histogram!("gateway_backend_call_duration_seconds", "service" => service.to_string())
            .record(started.elapsed().as_secs_f64());
        counter!("gateway_backend_calls_total", "service" => service.to_string(), "outcome" => outcome)
            .increment(1);

        result
    }
}
