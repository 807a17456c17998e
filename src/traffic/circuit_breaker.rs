//! # Circuit Breaker
//!
//! Per-service failure-rate breaker protecting backends from cascade
//! failures. Each breaker is a three-state machine:
//!
//! - **Closed**: normal operation; every call outcome lands in a rolling
//!   window of one-second buckets. When the window holds at least
//!   `volume_threshold` outcomes and the failure rate reaches
//!   `error_threshold_percent`, the breaker opens.
//! - **Open**: calls are rejected without reaching the backend until
//!   `reset_timeout` has elapsed since opening.
//! - **HalfOpen**: exactly one trial call is admitted; its outcome decides
//!   whether the breaker closes (window reset) or reopens.
//!
//! The half-open tie-break matters under load: many callers can race the
//! Open→HalfOpen boundary, and all but one must keep being rejected until
//! the trial resolves. The trial token is claimed inside the state lock, so
//! only one caller ever wins.
//!
//! Outcomes are recorded by the router exactly once per attempted call.
//! Policy-level rejections (rate limit, open circuit, unhealthy service)
//! never reach `record_success`/`record_failure`.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::error::{GatewayError, GatewayResult};

/// Configuration for per-service circuit breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Length of the rolling outcome window
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Number of sub-buckets the window is divided into
    pub buckets: u32,

    /// Minimum outcomes in the window before the error rate is evaluated
    pub volume_threshold: u32,

    /// Failure percentage (1-100) at which the breaker opens
    pub error_threshold_percent: u32,

    /// How long the breaker stays open before allowing a trial call
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            buckets: 10,
            volume_threshold: 10,
            error_threshold_percent: 50,
            // Matches the default backend call timeout: one full timed-out
            // call has elapsed before we probe the backend again.
            reset_timeout: Duration::from_millis(3000),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.buckets == 0 {
            return Err(GatewayError::config("circuit_breaker.buckets must be > 0"));
        }
        if self.window.is_zero() {
            return Err(GatewayError::config("circuit_breaker.window must be non-zero"));
        }
        if self.volume_threshold == 0 {
            return Err(GatewayError::config(
                "circuit_breaker.volume_threshold must be > 0",
            ));
        }
        if !(1..=100).contains(&self.error_threshold_percent) {
            return Err(GatewayError::config(
                "circuit_breaker.error_threshold_percent must be in 1..=100",
            ));
        }
        Ok(())
    }

    fn bucket_width(&self) -> Duration {
        self.window / self.buckets
    }
}

/// Externally visible breaker state, used in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// One sub-bucket of the rolling outcome window.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    started_at: Instant,
    requests: u32,
    failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: State,
    window: VecDeque<Bucket>,
}

impl Inner {
    /// Drop buckets that have aged out of the window.
    fn prune(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        while let Some(bucket) = self.window.front() {
            if now.duration_since(bucket.started_at) >= config.window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record one outcome into the current bucket, rotating if needed.
    fn record(&mut self, config: &CircuitBreakerConfig, now: Instant, failure: bool) {
        self.prune(config, now);

        let rotate = match self.window.back() {
            Some(bucket) => now.duration_since(bucket.started_at) >= config.bucket_width(),
            None => true,
        };
        if rotate {
            self.window.push_back(Bucket {
                started_at: now,
                requests: 0,
                failures: 0,
            });
        }

        if let Some(bucket) = self.window.back_mut() {
            bucket.requests += 1;
            if failure {
                bucket.failures += 1;
            }
        }
    }

    /// Window totals as (requests, failures).
    fn totals(&self) -> (u32, u32) {
        self.window
            .iter()
            .fold((0, 0), |(r, f), b| (r + b.requests, f + b.failures))
    }
}

/// Snapshot of one breaker for observability.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub service_name: String,
    pub state: CircuitState,
    pub request_count: u32,
    pub failure_count: u32,
}

/// Circuit breaker for a single backend service.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                window: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gate a call. `Ok(())` admits the call; the caller must then report
    /// the outcome via [`record_success`]/[`record_failure`], or release an
    /// unused half-open trial via [`abandon_trial`] if the call is rejected
    /// by a later pipeline stage before dispatch.
    ///
    /// [`record_success`]: Self::record_success
    /// [`record_failure`]: Self::record_failure
    /// [`abandon_trial`]: Self::abandon_trial
    pub fn is_call_allowed(&self) -> GatewayResult<()> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            State::Closed => Ok(()),
            State::Open { opened_at } => {
                if now.duration_since(opened_at) >= self.config.reset_timeout {
                    // This caller wins the Open -> HalfOpen transition and
                    // claims the single trial slot while holding the lock.
                    inner.state = State::HalfOpen {
                        trial_in_flight: true,
                    };
                    info!(service = %self.name, "Circuit breaker half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen {
                        service: self.name.clone(),
                    })
                }
            }
            State::HalfOpen {
                ref mut trial_in_flight,
            } => {
                if *trial_in_flight {
                    Err(GatewayError::CircuitOpen {
                        service: self.name.clone(),
                    })
                } else {
                    *trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Release a claimed half-open trial without an outcome. Used when the
    /// router rejects an admitted call before it is dispatched (unhealthy
    /// service); without this the trial slot would never be freed.
    pub fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if let State::HalfOpen {
            ref mut trial_in_flight,
        } = inner.state
        {
            *trial_in_flight = false;
        }
    }

    /// Open the breaker if the window meets both thresholds. Called after
    /// every outcome recorded in the closed state, success or failure: a
    /// success can be the outcome that lifts the window over the volume
    /// threshold while the failure rate is already at the limit.
    fn evaluate_threshold(&self, inner: &mut Inner, now: Instant) {
        let (requests, failures) = inner.totals();
        if requests >= self.config.volume_threshold
            && failures * 100 >= requests * self.config.error_threshold_percent
        {
            inner.state = State::Open { opened_at: now };
            warn!(
                service = %self.name,
                requests,
                failures,
                "Circuit breaker opened"
            );
        }
    }

    /// Record a successful call outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            State::Closed => {
                inner.record(&self.config, now, false);
                self.evaluate_threshold(&mut inner, now);
            }
            State::HalfOpen { .. } => {
                // Trial succeeded: close and start a fresh window.
                inner.state = State::Closed;
                inner.window.clear();
                info!(service = %self.name, "Circuit breaker closed after successful trial");
            }
            State::Open { .. } => {
                // Late outcome from a call admitted before the breaker
                // opened. Keep the window consistent; no transition.
                inner.record(&self.config, now, false);
            }
        }
    }

    /// Record a failed call outcome.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            State::Closed => {
                inner.record(&self.config, now, true);
                self.evaluate_threshold(&mut inner, now);
            }
            State::HalfOpen { .. } => {
                inner.state = State::Open { opened_at: now };
                warn!(service = %self.name, "Circuit breaker reopened after failed trial");
            }
            State::Open { .. } => {
                inner.record(&self.config, now, true);
            }
        }
    }

    /// Current state, for snapshots and tests.
    pub fn state(&self) -> CircuitState {
        match self.inner.lock().state {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        let (request_count, failure_count) = inner.totals();
        CircuitBreakerSnapshot {
            service_name: self.name.clone(),
            state: match inner.state {
                State::Closed => CircuitState::Closed,
                State::Open { .. } => CircuitState::Open,
                State::HalfOpen { .. } => CircuitState::HalfOpen,
            },
            request_count,
            failure_count,
        }
    }
}

/// Flat registry of breakers keyed by service name. Built once at startup
/// for the configured services; per-service locks mean different services
/// never contend with each other.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn from_services<'a, I>(services: I, config: CircuitBreakerConfig) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let breakers = DashMap::new();
        for name in services {
            breakers.insert(
                name.to_string(),
                Arc::new(CircuitBreaker::new(name, config.clone())),
            );
        }
        Self { breakers }
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|b| Arc::clone(b.value()))
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        snapshots
    }
}
