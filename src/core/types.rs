//! # Core Types
//!
//! Shared data structures used across the gateway: service descriptors loaded
//! from configuration, the inbound request shape handed to the router, the
//! backend call/response shapes, and health records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Static description of one backend service.
///
/// Loaded once at startup and immutable thereafter. `name` is the unique key
/// used by the connection pool, circuit breaker registry, and health monitor;
/// `route_prefix` is the first path segment that selects this service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique service name (e.g. "message-service")
    pub name: String,
    /// Base URL of the backend (e.g. "http://message-service:8080")
    pub address: String,
    /// Inbound path prefix mapped to this service (e.g. "messages")
    pub route_prefix: String,
}

/// Rate-limit policy class for a route.
///
/// Auth routes get a stricter budget to blunt credential-stuffing, AI routes
/// a distinct budget reflecting higher per-call cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    Default,
    Auth,
    Ai,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Default => "default",
            RouteClass::Auth => "auth",
            RouteClass::Ai => "ai",
        }
    }
}

impl std::fmt::Display for RouteClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated caller identity consumed from upstream auth.
///
/// The gateway does not issue or validate credentials itself; it trusts the
/// identity headers attached by the auth layer in front of it. Anonymous
/// callers are keyed by client IP for rate limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: String,
}

impl Identity {
    /// Identity for a caller without auth context, keyed by client address.
    pub fn anonymous(client_ip: &str) -> Self {
        Self {
            user_id: format!("ip:{}", client_ip),
            role: "anonymous".to_string(),
        }
    }
}

/// Inbound request as seen by the router, already stripped of transport
/// details by the HTTP layer.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// HTTP method of the original request
    pub method: String,
    /// Full request path (e.g. "/messages/chat/42")
    pub path: String,
    /// Validated caller identity
    pub identity: Identity,
    /// Trace id from the caller, if any; the router mints one otherwise
    pub trace_id: Option<String>,
    /// Request body forwarded as the backend payload
    pub body: Value,
}

/// Metadata attached to every backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetadata {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
}

/// Unary call shape sent to a backend service.
#[derive(Debug, Clone, Serialize)]
pub struct BackendRequest {
    /// Backend method, derived from the path remainder after the prefix
    pub method: String,
    /// HTTP verb of the original request, forwarded to the backend
    pub http_method: String,
    /// Request body forwarded verbatim
    pub payload: Value,
    pub metadata: CallMetadata,
}

/// Unary response returned by a backend service.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendResponse {
    pub payload: Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Health status of one backend, as tracked by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// One health record per configured service. Mutated only by the health
/// monitor's probe task; read by the router on every request.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub service_name: String,
    pub status: HealthStatus,
    /// None until the first probe completes
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Successful response returned to the caller: the backend payload plus
/// gateway metadata.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    pub data: Value,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub service: String,
    pub trace_id: String,
    pub duration_ms: u64,
}
