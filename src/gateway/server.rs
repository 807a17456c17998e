//! # HTTP Server
//!
//! Axum wiring around the request router. Every inbound request is reduced
//! to an [`IncomingRequest`] (identity headers, trace id, JSON body) and
//! handed to the router; gateway errors convert straight into HTTP
//! responses through `IntoResponse`.
//!
//! Besides the catch-all dispatch route, the server exposes the
//! observability surface under `/gateway/*`, which is deliberately outside
//! the backend route table so it can never shadow a service prefix.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router as AxumRouter,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::backend::pool::ConnectionPool;
use crate::core::config::GatewayConfig;
use crate::core::error::GatewayResult;
use crate::core::types::{Identity, IncomingRequest};
use crate::observability::health::HealthMonitor;
use crate::observability::metrics::SecurityMetrics;
use crate::routing::router::Router;
use crate::traffic::circuit_breaker::CircuitBreakerRegistry;
use crate::traffic::rate_limiting::RateLimiter;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ServerState {
    pub router: Arc<Router>,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<SecurityMetrics>,
    pub breakers: Arc<CircuitBreakerRegistry>,
}

/// The gateway process: owns the wired components and the shutdown token.
pub struct GatewayServer {
    config: GatewayConfig,
    state: ServerState,
    shutdown: CancellationToken,
}

impl GatewayServer {
    /// Wire all components from configuration. Connection handles are
    /// created eagerly here; a bad service address fails startup, not a
    /// request.
    pub async fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;

        let service_names: Vec<&str> = config.services.iter().map(|s| s.name.as_str()).collect();

        let pool = Arc::new(ConnectionPool::from_services(&config.services)?);
        let rate_limiter = Arc::new(RateLimiter::from_settings(&config.rate_limit).await?);
        let breakers = Arc::new(CircuitBreakerRegistry::from_services(
            service_names.iter().copied(),
            config.circuit_breaker.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            service_names.iter().copied(),
        ));
        let metrics = Arc::new(SecurityMetrics::new());

        let shutdown = CancellationToken::new();
        health.spawn_probes(&pool, shutdown.child_token())?;

        let router = Arc::new(Router::new(
            &config,
            pool,
            rate_limiter,
            Arc::clone(&breakers),
            Arc::clone(&health),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            state: ServerState {
                router,
                health,
                metrics,
                breakers,
            },
            config,
            shutdown,
        })
    }

    /// Token that stops the server and all background probe tasks.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token fires.
    pub async fn run(self) -> GatewayResult<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "Gateway listening");

        let app = build_app(self.state);
        let shutdown = self.shutdown.clone();

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

/// Build the axum application. Public so integration tests can drive the
/// full pipeline without binding a socket.
pub fn build_app(state: ServerState) -> AxumRouter {
    AxumRouter::new()
        .route("/gateway/health", get(health_status))
        .route("/gateway/metrics", get(security_metrics))
        .route("/gateway/circuits", get(circuit_snapshots))
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `getHealthStatus`: one record per configured service.
async fn health_status(State(state): State<ServerState>) -> Response {
    Json(state.health.snapshot()).into_response()
}

/// `getSecurityMetrics`: snapshot copy of the process-wide counters.
async fn security_metrics(State(state): State<ServerState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

async fn circuit_snapshots(State(state): State<ServerState>) -> Response {
    Json(state.breakers.snapshots()).into_response()
}

/// Catch-all: every non-observability request goes through the router.
async fn dispatch(
    State(state): State<ServerState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let request = IncomingRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        identity: identity_from_headers(&headers, &client_ip),
        trace_id: header_value(&headers, "x-trace-id"),
        body: parse_body(&body),
    };

    match state.router.route(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// The auth layer in front of the gateway attaches validated identity
/// headers; callers without them are keyed by client IP.
fn identity_from_headers(headers: &HeaderMap, client_ip: &str) -> Identity {
    match header_value(headers, "x-user-id") {
        Some(user_id) => Identity {
            user_id,
            role: header_value(headers, "x-user-role").unwrap_or_else(|| "member".to_string()),
        },
        None => Identity::anonymous(client_ip),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn parse_body(body: &Bytes) -> Value {
    if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(body).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_identity_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("u42"));
        headers.insert("x-user-role", HeaderValue::from_static("admin"));

        let identity = identity_from_headers(&headers, "10.0.0.1");
        assert_eq!(identity.user_id, "u42");
        assert_eq!(identity.role, "admin");
    }

    #[test]
    fn test_missing_identity_falls_back_to_ip() {
        let identity = identity_from_headers(&HeaderMap::new(), "10.0.0.1");
        assert_eq!(identity.user_id, "ip:10.0.0.1");
        assert_eq!(identity.role, "anonymous");
    }

    #[test]
    fn test_parse_body_handles_empty_and_invalid() {
        assert_eq!(parse_body(&Bytes::new()), Value::Null);
        assert_eq!(parse_body(&Bytes::from_static(b"not json")), Value::Null);
        assert_eq!(
            parse_body(&Bytes::from_static(b"{\"a\":1}")),
            serde_json::json!({"a": 1})
        );
    }
}
