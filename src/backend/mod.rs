//! Outbound side of the gateway: per-service connection handles and the
//! transport seam the health monitor probes through.

pub mod pool;

pub use pool::{BackendTransport, ConnectionPool, HttpTransport};
