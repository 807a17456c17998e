//! Traffic protection: per-service circuit breakers and distributed rate
//! limiting. Both gate requests before they reach the connection pool.

pub mod circuit_breaker;
pub mod rate_limiting;
