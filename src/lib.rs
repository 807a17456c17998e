//! # Chat Gateway
//!
//! Request-routing core of the API gateway that fronts the chat platform's
//! backend services (auth, messaging, AI, preferences). The gateway accepts
//! inbound REST calls, translates them into backend calls, and protects the
//! backends from overload and cascading failure.
//!
//! Per-request control flow:
//!
//! ```text
//! router -> rate limiter -> circuit breaker -> health monitor
//!        -> connection pool -> metrics -> response transform
//! ```
//!
//! The backend set is fixed, small, and statically known from
//! configuration; there is no dynamic service discovery.

/// Fundamental building blocks: error taxonomy, configuration, shared types
pub mod core;

/// Outbound connections: one eager handle per configured backend
pub mod backend;

/// Traffic protection: circuit breakers and distributed rate limiting
pub mod traffic;

/// Health tracking, security metrics, and logging setup
pub mod observability;

/// The request router: the single orchestrator of the admission pipeline
pub mod routing;

/// Axum server wiring and process lifecycle
pub mod gateway;

pub use crate::core::config::GatewayConfig;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::gateway::server::{GatewayServer, ServerState};
pub use crate::routing::router::Router;
