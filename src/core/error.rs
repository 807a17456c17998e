//! # Error Handling
//!
//! All gateway failures are expressed through the [`GatewayError`] enum and
//! mapped to stable HTTP responses via [`IntoResponse`]. The taxonomy mirrors
//! the dispatch pipeline:
//!
//! - `InvalidRoute` — client error, unknown path prefix, no retry
//! - `RateLimited` — caller must back off per the Retry-After hint
//! - `CircuitOpen` — reactive failure tracking tripped; transient
//! - `ServiceUnavailable` — proactive health probe marked the backend down
//! - `Backend` — the backend returned an application error
//! - `Transport` / `DeadlineExceeded` — network failure or timeout; both
//!   count as circuit-breaker failures
//!
//! Configuration and internal errors are programming/deployment mistakes and
//! are fatal at startup validation rather than handled per request.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Every failure the gateway can surface to a caller or log.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// The request path's first segment matches no configured service
    #[error("Invalid service path: {path}")]
    InvalidRoute { path: String },

    /// Rate-limit policy rejected the request before it reached a backend
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Circuit breaker is open for the target service
    #[error("Circuit breaker open for service: {service}")]
    CircuitOpen { service: String },

    /// Health monitor has marked the target service unhealthy
    #[error("Service unavailable: {service}")]
    ServiceUnavailable { service: String },

    /// Backend returned an application-level error response
    #[error("Backend error from {service}: {message}")]
    Backend { service: String, message: String },

    /// Network-level failure reaching the backend
    #[error("Transport error calling {service}: {message}")]
    Transport { service: String, message: String },

    /// The outbound call exceeded its deadline
    #[error("Deadline exceeded calling {service} after {timeout_ms}ms")]
    DeadlineExceeded { service: String, timeout_ms: u64 },

    /// Rate-limit store failure (the admit decision then follows fail mode)
    #[error("Rate limit store error: {message}")]
    RateLimitStore { message: String },

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Unexpected internal failure
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(service: S, message: S) -> Self {
        Self::Transport {
            service: service.into(),
            message: message.into(),
        }
    }

    /// HTTP status code surfaced to the caller for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRoute { .. } => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Backend { .. } => StatusCode::BAD_GATEWAY,
            Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::RateLimitStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error type string for API responses.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRoute { .. } => "invalid_route",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Backend { .. } => "backend_error",
            Self::Transport { .. } => "transport_error",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::RateLimitStore { .. } => "rate_limit_store_error",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Stable human-readable message for the response body. Deliberately
    /// coarse: callers get the documented strings, logs get the details.
    fn client_message(&self) -> &'static str {
        match self {
            Self::InvalidRoute { .. } => "Invalid service path",
            Self::RateLimited { .. } => "Too many requests, please try again later",
            Self::CircuitOpen { .. } | Self::ServiceUnavailable { .. } => {
                "Service temporarily unavailable"
            }
            Self::Backend { .. } => "Backend service error",
            Self::Transport { .. } => "Backend service error",
            Self::DeadlineExceeded { .. } => "Backend service timed out",
            _ => "Internal server error",
        }
    }

    /// Whether the caller may safely retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::CircuitOpen { .. }
                | Self::ServiceUnavailable { .. }
                | Self::Transport { .. }
                | Self::DeadlineExceeded { .. }
        )
    }

    /// Whether this outcome counts as a failure for the circuit breaker.
    ///
    /// Only outcomes of calls that actually reached (or tried to reach) a
    /// backend count; policy-level rejections never do.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            Self::Backend { .. } | Self::Transport { .. } | Self::DeadlineExceeded { .. }
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = json!({
            "error": self.client_message(),
            "type": self.error_type(),
            "retryable": self.is_retryable(),
        });

        let mut response = (status, Json(body)).into_response();

        if let Self::RateLimited { retry_after_secs } = self {
            // Retry-after guidance is always included for 429s
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("YAML error: {}", err),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {}", err),
        }
    }
}
