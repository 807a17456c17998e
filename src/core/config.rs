//! # Gateway Configuration
//!
//! YAML-backed configuration for the gateway. The service set is static and
//! small: it is loaded once at startup, validated, and never mutated. Every
//! component config (circuit breaker, health monitor, rate limiter) lives
//! next to its component; this module aggregates them into [`GatewayConfig`]
//! and owns startup validation.
//!
//! Durations are written in human-readable form in YAML ("30s", "3000ms")
//! via `humantime-serde`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceDescriptor;
use crate::observability::health::HealthMonitorConfig;
use crate::traffic::circuit_breaker::CircuitBreakerConfig;
use crate::traffic::rate_limiting::RateLimitSettings;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the gateway listens on
    pub listen_addr: SocketAddr,

    /// The statically-known backend services
    pub services: Vec<ServiceDescriptor>,

    /// Deadline applied to every backend call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Per-service circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,

    /// Health probe settings
    pub health: HealthMonitorConfig,

    /// Rate limiting settings
    pub rate_limit: RateLimitSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().expect("valid default listen addr"),
            services: default_services(),
            call_timeout: Duration::from_millis(3000),
            circuit_breaker: CircuitBreakerConfig::default(),
            health: HealthMonitorConfig::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

/// The fixed service table of the chat platform.
fn default_services() -> Vec<ServiceDescriptor> {
    vec![
        ServiceDescriptor {
            name: "auth-service".to_string(),
            address: "http://auth-service:8081".to_string(),
            route_prefix: "auth".to_string(),
        },
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
        ServiceDescriptor {
            name: "preference-service".to_string(),
            address: "http://preference-service:8084".to_string(),
            route_prefix: "preferences".to_string(),
        },
    ]
}

impl GatewayConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::config(format!(
                "Cannot read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: GatewayConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        info!(
            services = config.services.len(),
            "Configuration loaded from {}",
            path.as_ref().display()
        );
        Ok(config)
    }

    /// Validate the configuration. Failures here are fatal at startup;
    /// nothing in the request path should ever have to handle them.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.services.is_empty() {
            return Err(GatewayError::config("At least one service must be configured"));
        }

        let mut names = std::collections::HashSet::new();
        let mut prefixes = std::collections::HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                return Err(GatewayError::config("Service name must not be empty"));
            }
            if !names.insert(service.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "Duplicate service name: {}",
                    service.name
                )));
            }
            if service.route_prefix.is_empty() || service.route_prefix.contains('/') {
                return Err(GatewayError::config(format!(
                    "Invalid route prefix for {}: {:?}",
                    service.name, service.route_prefix
                )));
            }
            if !prefixes.insert(service.route_prefix.as_str()) {
                return Err(GatewayError::config(format!(
                    "Duplicate route prefix: {}",
                    service.route_prefix
                )));
            }
            if !service.address.starts_with("http://") && !service.address.starts_with("https://") {
                return Err(GatewayError::config(format!(
                    "Service {} address must be an http(s) URL, got {:?}",
                    service.name, service.address
                )));
            }
        }

        if self.call_timeout.is_zero() {
            return Err(GatewayError::config("call_timeout must be non-zero"));
        }

        self.circuit_breaker.validate()?;
        self.health.validate()?;
        self.rate_limit.validate()?;

        Ok(())
    }
}
