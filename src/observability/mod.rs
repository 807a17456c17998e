//! Observability: health tracking, security metrics, and logging setup.
//! These components record and report; none of them make routing decisions.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthMonitor, HealthMonitorConfig};
pub use metrics::{SecurityMetrics, SecurityMetricsSnapshot};
