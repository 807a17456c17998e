//! # Distributed Rate Limiting
//!
//! Fixed-window counters against a shared store, consulted before any
//! request reaches a backend. The increment is atomic at the store level
//! (Redis `INCR`), never read-then-write from the gateway, so concurrent
//! gateway instances sharing one store cannot race the same key. Window
//! boundaries are set by the first request (the key's TTL starts when the
//! counter is created), not by wall-clock alignment.
//!
//! Policies are keyed by route class: DEFAULT gets the broad budget, AUTH a
//! strict one to blunt credential-stuffing, AI a separate budget reflecting
//! per-call cost.
//!
//! When the store itself is unreachable the limiter follows an explicit
//! [`FailMode`]: fail-open admits and logs, fail-closed rejects. This is a
//! deployment decision, not an accident of error handling.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Identity, RouteClass};

/// Behavior when the shared counter store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit the request and log the store failure
    Open,
    /// Reject the request as if rate limited
    Closed,
}

/// Rate-limit policy for one route class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicy {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max_requests: u32,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Redis connection string; in-memory counters are used when unset
    /// (single-instance deployments and tests)
    pub redis_url: Option<String>,
    /// Prefix for counter keys in the store
    pub key_prefix: String,
    /// Store-unreachable behavior
    pub fail_mode: FailMode,
    /// Per-class policies; the `default` class must be present
    pub policies: HashMap<RouteClass, RoutePolicy>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            RouteClass::Default,
            RoutePolicy {
                window: Duration::from_secs(60),
                max_requests: 100,
            },
        );
        policies.insert(
            RouteClass::Auth,
            RoutePolicy {
                window: Duration::from_secs(60),
                max_requests: 20,
            },
        );
        policies.insert(
            RouteClass::Ai,
            RoutePolicy {
                window: Duration::from_secs(60),
                max_requests: 30,
            },
        );
        Self {
            redis_url: None,
            key_prefix: "rl".to_string(),
            fail_mode: FailMode::Open,
            policies,
        }
    }
}

impl RateLimitSettings {
    pub fn validate(&self) -> GatewayResult<()> {
        if !self.policies.contains_key(&RouteClass::Default) {
            return Err(GatewayError::config(
                "rate_limit.policies must include the default class",
            ));
        }
        for (class, policy) in &self.policies {
            if policy.max_requests == 0 {
                return Err(GatewayError::config(format!(
                    "rate_limit policy for {} must allow at least one request",
                    class
                )));
            }
            if policy.window.is_zero() {
                return Err(GatewayError::config(format!(
                    "rate_limit policy for {} must have a non-zero window",
                    class
                )));
            }
        }
        if self.key_prefix.is_empty() {
            return Err(GatewayError::config("rate_limit.key_prefix must not be empty"));
        }
        Ok(())
    }
}

/// Admission decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Rejected { retry_after: Duration },
}

/// Storage backend for rate-limit counters.
///
/// `increment` must be atomic at the store: the returned count is the value
/// after this request's increment, with the key's TTL set to `ttl` when the
/// count started at 1 (first request defines the window).
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn increment(&self, key: &str, ttl: Duration) -> GatewayResult<u64>;

    /// Remaining lifetime of a key, if it exists and has a TTL.
    async fn ttl(&self, key: &str) -> GatewayResult<Option<Duration>>;
}

/// Counter increment and first-request expiry in one server-side step: a
/// key can never be created without its TTL, even if the connection dies
/// between the two calls.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Redis-backed counter store shared across gateway instances.
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
    increment: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url).map_err(|e| GatewayError::RateLimitStore {
            message: format!("invalid redis url: {}", e),
        })?;
        let manager =
            client
                .get_connection_manager()
                .await
                .map_err(|e| GatewayError::RateLimitStore {
                    message: format!("redis connect failed: {}", e),
                })?;
        Ok(Self {
            manager,
            increment: redis::Script::new(INCREMENT_SCRIPT),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn increment(&self, key: &str, ttl: Duration) -> GatewayResult<u64> {
        let mut conn = self.manager.clone();
        self.increment
            .key(key)
            .arg(ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatewayError::RateLimitStore {
                message: e.to_string(),
            })
    }

    async fn ttl(&self, key: &str) -> GatewayResult<Option<Duration>> {
        let mut conn = self.manager.clone();
        let millis: i64 = conn
            .pttl(key)
            .await
            .map_err(|e| GatewayError::RateLimitStore {
                message: e.to_string(),
            })?;
        if millis > 0 {
            Ok(Some(Duration::from_millis(millis as u64)))
        } else {
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

/// In-process counter store. Counters live behind per-key DashMap entry
/// locks, so the increment-and-check is atomic within one instance. Not
/// suitable for multi-instance deployments.
#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, CounterEntry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> GatewayResult<u64> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            // Window lapsed: this request starts a new one
            entry.count = 0;
            entry.expires_at = now + ttl;
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn ttl(&self, key: &str) -> GatewayResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self.entries.get(key).and_then(|entry| {
            if entry.expires_at > now {
                Some(entry.expires_at - now)
            } else {
                None
            }
        }))
    }
}

/// The rate limiter consulted by the router for every request.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policies: HashMap<RouteClass, RoutePolicy>,
    default_policy: RoutePolicy,
    key_prefix: String,
    fail_mode: FailMode,
}

impl RateLimiter {
    /// Build from settings, connecting to Redis when configured.
    pub async fn from_settings(settings: &RateLimitSettings) -> GatewayResult<Self> {
        let store: Arc<dyn RateLimitStore> = match &settings.redis_url {
            Some(url) => Arc::new(RedisStore::connect(url).await?),
            None => {
                warn!("No redis_url configured, using in-process rate-limit counters");
                Arc::new(InMemoryStore::new())
            }
        };
        Ok(Self::with_store(store, settings))
    }

    pub fn with_store(store: Arc<dyn RateLimitStore>, settings: &RateLimitSettings) -> Self {
        let default_policy = settings
            .policies
            .get(&RouteClass::Default)
            .cloned()
            .unwrap_or_else(|| RoutePolicy {
                window: Duration::from_secs(60),
                max_requests: 100,
            });
        Self {
            store,
            policies: settings.policies.clone(),
            default_policy,
            key_prefix: settings.key_prefix.clone(),
            fail_mode: settings.fail_mode,
        }
    }

    fn policy_for(&self, class: RouteClass) -> &RoutePolicy {
        self.policies.get(&class).unwrap_or(&self.default_policy)
    }

    fn key_for(&self, class: RouteClass, identity: &Identity) -> String {
        format!("{}:{}-{}", self.key_prefix, identity.user_id, class)
    }

    /// Admit or reject one request under the class policy.
    pub async fn admit(&self, class: RouteClass, identity: &Identity) -> Admission {
        let policy = self.policy_for(class);
        let key = self.key_for(class, identity);

        match self.store.increment(&key, policy.window).await {
            Ok(count) if count <= policy.max_requests as u64 => {
                debug!(%key, count, max = policy.max_requests, "Rate limit check passed");
                Admission::Allowed {
                    remaining: policy.max_requests - count as u32,
                }
            }
            Ok(count) => {
                let retry_after = match self.store.ttl(&key).await {
                    Ok(Some(remaining)) => remaining,
                    _ => policy.window,
                };
                debug!(%key, count, "Rate limit exceeded");
                Admission::Rejected { retry_after }
            }
            Err(e) => match self.fail_mode {
                FailMode::Open => {
                    warn!(%key, error = %e, "Rate limit store unreachable, failing open");
                    Admission::Allowed { remaining: 0 }
                }
                FailMode::Closed => {
                    error!(%key, error = %e, "Rate limit store unreachable, failing closed");
                    Admission::Rejected {
                        retry_after: policy.window,
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    #[async_trait]
    impl RateLimitStore for FailingStore {
        async fn increment(&self, _key: &str, _ttl: Duration) -> GatewayResult<u64> {
            Err(GatewayError::RateLimitStore {
                message: "connection refused".to_string(),
            })
        }

        async fn ttl(&self, _key: &str) -> GatewayResult<Option<Duration>> {
            Err(GatewayError::RateLimitStore {
                message: "connection refused".to_string(),
            })
        }
    }

    fn settings_with(max: u32, window: Duration) -> RateLimitSettings {
        let mut settings = RateLimitSettings::default();
        settings.policies.insert(
            RouteClass::Default,
            RoutePolicy {
                window,
                max_requests: max,
            },
        );
        settings
    }

    fn user(id: &str) -> Identity {
        Identity {
            user_id: id.to_string(),
            role: "member".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fixed_window_admits_up_to_max_then_rejects() {
        let settings = settings_with(5, Duration::from_millis(1000));
        let limiter = RateLimiter::with_store(Arc::new(InMemoryStore::new()), &settings);
        let identity = user("u1");

        for i in 0..5 {
            match limiter.admit(RouteClass::Default, &identity).await {
                Admission::Allowed { remaining } => assert_eq!(remaining, 4 - i),
                other => panic!("request {} unexpectedly rejected: {:?}", i + 1, other),
            }
        }

        match limiter.admit(RouteClass::Default, &identity).await {
            Admission::Rejected { retry_after } => assert!(retry_after > Duration::ZERO),
            other => panic!("6th request should be rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_window_lapse_resets_count() {
        let settings = settings_with(5, Duration::from_millis(200));
        let limiter = RateLimiter::with_store(Arc::new(InMemoryStore::new()), &settings);
        let identity = user("u1");

        for _ in 0..6 {
            limiter.admit(RouteClass::Default, &identity).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        // New window: count restarts at 1
        match limiter.admit(RouteClass::Default, &identity).await {
            Admission::Allowed { remaining } => assert_eq!(remaining, 4),
            other => panic!("expected admission after window lapse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_classes_and_identities_do_not_share_counters() {
        let settings = settings_with(1, Duration::from_secs(60));
        let limiter = RateLimiter::with_store(Arc::new(InMemoryStore::new()), &settings);

        assert!(matches!(
            limiter.admit(RouteClass::Default, &user("u1")).await,
            Admission::Allowed { .. }
        ));
        assert!(matches!(
            limiter.admit(RouteClass::Default, &user("u1")).await,
            Admission::Rejected { .. }
        ));

        // Different class, same identity: separate key
        assert!(matches!(
            limiter.admit(RouteClass::Ai, &user("u1")).await,
            Admission::Allowed { .. }
        ));
        // Same class, different identity: separate key
        assert!(matches!(
            limiter.admit(RouteClass::Default, &user("u2")).await,
            Admission::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_auth_policy_is_stricter_than_default() {
        let settings = RateLimitSettings::default();
        let auth = &settings.policies[&RouteClass::Auth];
        let default = &settings.policies[&RouteClass::Default];
        assert!(auth.max_requests < default.max_requests);
    }

    #[tokio::test]
    async fn test_fail_open_admits_on_store_error() {
        let mut settings = RateLimitSettings::default();
        settings.fail_mode = FailMode::Open;
        let limiter = RateLimiter::with_store(Arc::new(FailingStore), &settings);

        assert!(matches!(
            limiter.admit(RouteClass::Default, &user("u1")).await,
            Admission::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_on_store_error() {
        let mut settings = RateLimitSettings::default();
        settings.fail_mode = FailMode::Closed;
        let limiter = RateLimiter::with_store(Arc::new(FailingStore), &settings);

        assert!(matches!(
            limiter.admit(RouteClass::Default, &user("u1")).await,
            Admission::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_settings_validation() {
        let mut settings = RateLimitSettings::default();
        assert!(settings.validate().is_ok());

        settings.policies.remove(&RouteClass::Default);
        assert!(settings.validate().is_err());

        let mut settings = RateLimitSettings::default();
        settings
            .policies
            .get_mut(&RouteClass::Ai)
            .unwrap()
            .max_requests = 0;
        assert!(settings.validate().is_err());
    }
}
