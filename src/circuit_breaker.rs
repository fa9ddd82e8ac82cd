//! Per-service circuit breakers for Bulwark.
//!
//! Each registered downstream service has one [`CircuitBreakerState`] in the
//! state store. The state machine itself is a set of pure methods on that
//! struct; [`CircuitBreakerRegistry`] applies them under compare-and-swap so
//! concurrent callers of the same service are serialized.
//!
//! # State Machine
//!
//! ```text
//!              failure_count >= failure_threshold
//!   +--------+ ---------------------------------> +------+
//!   | CLOSED |                                    | OPEN | <---+
//!   +--------+ <--+                               +------+     |
//!                 |                                  |         |
//!                 | success_count >=                 | now >=  | any
//!                 | success_threshold                | next_attempt_time
//!                 |                                  v         | failure
//!                 |                             +-----------+  |
//!                 +---------------------------- | HALF_OPEN | -+
//!                                               +-----------+
//!                                         (at most half_open_max_calls probes)
//! ```
//!
//! Unknown services and unreadable state are treated as open.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditDispatcher, ViolationEvent, ViolationKind};
use crate::clock::{add_duration, SharedClock};
use crate::constants::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT_SECS};
use crate::store::{update, StateStore};
use crate::{bail_if, Error, Result};

// =============================================================================
// STATE & CONFIG
// =============================================================================

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally, failures are counted
    Closed,
    /// Calls are rejected without I/O
    Open,
    /// A limited number of probe calls test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_recovery_timeout_secs() -> u64 {
    DEFAULT_RECOVERY_TIMEOUT_SECS
}

fn default_half_open_max_calls() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

/// Breaker thresholds for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before probing.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Probes admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,

    /// Probe successes needed to close again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a [`Duration`].
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn validate(&self, service: &str) -> Result<()> {
        let key = |field: &str| format!("services.{service}.circuit_breaker.{field}");
        bail_if!(
            self.failure_threshold == 0,
            Error::config_invalid_value(key("failure_threshold"), "must be at least 1")
        );
        bail_if!(
            self.half_open_max_calls == 0,
            Error::config_invalid_value(key("half_open_max_calls"), "must be at least 1")
        );
        bail_if!(
            self.success_threshold == 0,
            Error::config_invalid_value(key("success_threshold"), "must be at least 1")
        );
        bail_if!(
            self.success_threshold > self.half_open_max_calls,
            Error::config_invalid_value(
                key("success_threshold"),
                "must not exceed half_open_max_calls",
            )
        );
        Ok(())
    }
}

/// A state change produced by one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Breaker state for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub service_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    /// Held open by an administrator until [`CircuitBreakerRegistry::reset`].
    #[serde(default)]
    pub forced_open: bool,
}

impl CircuitBreakerState {
    /// A fresh closed breaker.
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure_time: None,
            next_attempt_time: None,
            forced_open: false,
        }
    }

    fn recovery_due(&self, now: DateTime<Utc>) -> bool {
        !self.forced_open && self.next_attempt_time.is_some_and(|at| now >= at)
    }

    /// Whether an attempt would be admitted at `now`. Does not mutate.
    pub fn would_allow(&self, now: DateTime<Utc>, config: &CircuitBreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.recovery_due(now),
            CircuitState::HalfOpen => self.half_open_calls < config.half_open_max_calls,
        }
    }

    fn change(&mut self, to: CircuitState) -> Option<Transition> {
        let from = self.state;
        self.state = to;
        (from != to).then_some(Transition { from, to })
    }

    fn trip(&mut self, now: DateTime<Utc>, config: &CircuitBreakerConfig) -> Option<Transition> {
        self.next_attempt_time = Some(add_duration(now, config.recovery_timeout()));
        self.success_count = 0;
        self.half_open_calls = 0;
        let from = self.state;
        self.state = CircuitState::Open;
        Some(Transition {
            from,
            to: CircuitState::Open,
        })
    }

    /// Move an open breaker to half-open once its recovery time has passed.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if self.state == CircuitState::Open && self.recovery_due(now) {
            self.success_count = 0;
            self.half_open_calls = 0;
            return self.change(CircuitState::HalfOpen);
        }
        None
    }

    /// Admit an attempt, reserving a probe slot when half-open.
    pub fn acquire(
        &mut self,
        now: DateTime<Utc>,
        config: &CircuitBreakerConfig,
    ) -> (bool, Option<Transition>) {
        let transition = self.advance(now);
        let admitted = match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.half_open_calls < config.half_open_max_calls {
                    self.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        };
        (admitted, transition)
    }

    /// Give back a reserved probe slot whose call never completed.
    pub fn release(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_calls = self.half_open_calls.saturating_sub(1);
        }
    }

    /// Record a successful attempt.
    pub fn on_success(&mut self, config: &CircuitBreakerConfig) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= config.success_threshold {
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.half_open_calls = 0;
                    self.next_attempt_time = None;
                    return self.change(CircuitState::Closed);
                }
                None
            }
            // Late result of a call admitted before the breaker opened.
            CircuitState::Open => None,
        }
    }

    /// Record a failed attempt.
    pub fn on_failure(
        &mut self,
        now: DateTime<Utc>,
        config: &CircuitBreakerConfig,
    ) -> Option<Transition> {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);
        match self.state {
            CircuitState::Closed if self.failure_count >= config.failure_threshold => {
                self.trip(now, config)
            }
            CircuitState::Closed | CircuitState::Open => None,
            CircuitState::HalfOpen => self.trip(now, config),
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

fn breaker_key(service: &str) -> String {
    format!("breaker:{service}")
}

/// Whole seconds from `now` until `at`, rounded up and never below one.
fn retry_hint_secs(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let remaining_ms = (at - now).num_milliseconds().max(0) as u64;
    remaining_ms.div_ceil(1000).max(1)
}

/// Breakers for every registered service.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    store: Arc<dyn StateStore<CircuitBreakerState>>,
    configs: DashMap<String, CircuitBreakerConfig>,
    clock: SharedClock,
    audit: AuditDispatcher,
}

impl CircuitBreakerRegistry {
    pub fn new(
        store: Arc<dyn StateStore<CircuitBreakerState>>,
        clock: SharedClock,
        audit: AuditDispatcher,
    ) -> Self {
        Self {
            store,
            configs: DashMap::new(),
            clock,
            audit,
        }
    }

    fn config(&self, service: &str) -> Option<CircuitBreakerConfig> {
        self.configs.get(service).map(|c| *c.value())
    }

    /// Register a service with a closed breaker.
    ///
    /// State already present in a shared store is kept.
    pub async fn register(&self, service: &str, config: CircuitBreakerConfig) -> Result<()> {
        config.validate(service)?;
        bail_if!(
            self.configs.contains_key(service),
            Error::ServiceAlreadyRegistered {
                service: service.to_string(),
            }
        );
        self.store
            .compare_and_swap(&breaker_key(service), None, CircuitBreakerState::new(service))
            .await?;
        self.configs.insert(service.to_string(), config);
        info!(service, "circuit breaker registered");
        Ok(())
    }

    /// Registered service ids, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Whether an attempt against `service` would currently be admitted.
    pub async fn allow(&self, service: &str) -> bool {
        let Some(config) = self.config(service) else {
            return false;
        };
        match self.store.get(&breaker_key(service)).await {
            Ok(Some(current)) => current.value.would_allow(self.clock.now(), &config),
            Ok(None) => true,
            Err(e) => {
                warn!(service, "breaker state unreadable, treating as open: {}", e);
                false
            }
        }
    }

    /// Admit one attempt, or fail with [`Error::CircuitOpen`].
    pub async fn try_acquire(&self, service: &str) -> Result<()> {
        let config = self
            .config(service)
            .ok_or_else(|| Error::service_not_registered(service))?;
        let now = self.clock.now();

        let outcome = update(self.store.as_ref(), &breaker_key(service), |current| {
            let mut state = current.unwrap_or_else(|| CircuitBreakerState::new(service));
            let (admitted, transition) = state.acquire(now, &config);
            let snapshot = (admitted, transition, state.failure_count, state.next_attempt_time);
            (state, snapshot)
        })
        .await;

        match outcome {
            Ok((_, (true, transition, _, _))) => {
                if let Some(t) = transition {
                    info!(service, from = %t.from, to = %t.to, "circuit probing recovery");
                }
                Ok(())
            }
            Ok((_, (false, _, failure_count, next_attempt_time))) => {
                debug!(service, failure_count, "circuit open, call rejected");
                Err(Error::CircuitOpen {
                    service: service.to_string(),
                    failure_count,
                    next_attempt_time,
                    retry_after_secs: next_attempt_time.map(|at| retry_hint_secs(at, now)),
                })
            }
            Err(e) => {
                warn!(service, "breaker state unavailable, failing closed: {}", e);
                Err(Error::CircuitOpen {
                    service: service.to_string(),
                    failure_count: 0,
                    next_attempt_time: None,
                    retry_after_secs: None,
                })
            }
        }
    }

    /// Give back a probe slot reserved by [`try_acquire`](Self::try_acquire)
    /// when the call was abandoned before producing a result.
    pub async fn release_probe(&self, service: &str) -> Result<()> {
        update(self.store.as_ref(), &breaker_key(service), |current| {
            let mut state = current.unwrap_or_else(|| CircuitBreakerState::new(service));
            state.release();
            (state, ())
        })
        .await?;
        Ok(())
    }

    /// Record the outcome of an attempt.
    pub async fn record_result(&self, service: &str, success: bool) -> Result<Option<Transition>> {
        let config = self
            .config(service)
            .ok_or_else(|| Error::service_not_registered(service))?;
        let now = self.clock.now();

        let (state, transition) = update(self.store.as_ref(), &breaker_key(service), |current| {
            let mut state = current.unwrap_or_else(|| CircuitBreakerState::new(service));
            let transition = if success {
                state.on_success(&config)
            } else {
                state.on_failure(now, &config)
            };
            (state, transition)
        })
        .await?;

        if let Some(t) = transition {
            match t.to {
                CircuitState::Open => {
                    warn!(
                        service,
                        from = %t.from,
                        failure_count = state.failure_count,
                        "circuit opened"
                    );
                    self.audit.emit(
                        ViolationEvent::for_service(
                            ViolationKind::CircuitOpened,
                            now,
                            service,
                            format!("circuit opened after {} failures", state.failure_count),
                        )
                        .with_metadata(serde_json::json!({
                            "from": t.from.to_string(),
                            "failure_count": state.failure_count,
                            "next_attempt_time": state.next_attempt_time,
                        })),
                    );
                }
                CircuitState::Closed => info!(service, "circuit closed"),
                CircuitState::HalfOpen => {}
            }
        }
        Ok(transition)
    }

    /// Current stored state of the breaker.
    pub async fn state(&self, service: &str) -> Result<CircuitBreakerState> {
        bail_if!(
            !self.configs.contains_key(service),
            Error::service_not_registered(service)
        );
        Ok(self
            .store
            .get(&breaker_key(service))
            .await?
            .map(|v| v.value)
            .unwrap_or_else(|| CircuitBreakerState::new(service)))
    }

    /// Hold the breaker open until [`reset`](Self::reset).
    pub async fn force_open(&self, service: &str) -> Result<()> {
        bail_if!(
            !self.configs.contains_key(service),
            Error::service_not_registered(service)
        );
        update(self.store.as_ref(), &breaker_key(service), |current| {
            let mut state = current.unwrap_or_else(|| CircuitBreakerState::new(service));
            state.forced_open = true;
            state.state = CircuitState::Open;
            state.next_attempt_time = None;
            state.half_open_calls = 0;
            state.success_count = 0;
            (state, ())
        })
        .await?;
        warn!(service, "circuit forced open");
        Ok(())
    }

    /// Return the breaker to a fresh closed state.
    pub async fn reset(&self, service: &str) -> Result<()> {
        bail_if!(
            !self.configs.contains_key(service),
            Error::service_not_registered(service)
        );
        self.store
            .set(&breaker_key(service), CircuitBreakerState::new(service))
            .await?;
        info!(service, "circuit reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_secs: 30,
            half_open_max_calls: 2,
            success_threshold: 2,
        }
    }

    async fn registry() -> (CircuitBreakerRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let registry = CircuitBreakerRegistry::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            AuditDispatcher::default(),
        );
        registry.register("billing", config()).await.unwrap();
        (registry, clock)
    }

    // ------------------------------------------------------------------------
    // Pure state machine
    // ------------------------------------------------------------------------

    #[test]
    fn test_success_while_closed_resets_failures() {
        let cfg = config();
        let now = Utc::now();
        let mut s = CircuitBreakerState::new("svc");
        s.on_failure(now, &cfg);
        s.on_failure(now, &cfg);
        assert_eq!(s.failure_count, 2);
        assert!(s.on_success(&cfg).is_none());
        assert_eq!(s.failure_count, 0);
        assert_eq!(s.state, CircuitState::Closed);
    }

    #[test]
    fn test_opens_on_threshold_failure() {
        let cfg = config();
        let now = Utc::now();
        let mut s = CircuitBreakerState::new("svc");
        assert!(s.on_failure(now, &cfg).is_none());
        assert!(s.on_failure(now, &cfg).is_none());
        let t = s.on_failure(now, &cfg).unwrap();
        assert_eq!(t.to, CircuitState::Open);
        assert_eq!(s.next_attempt_time, Some(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_late_success_while_open_is_ignored() {
        let cfg = config();
        let now = Utc::now();
        let mut s = CircuitBreakerState::new("svc");
        for _ in 0..3 {
            s.on_failure(now, &cfg);
        }
        assert!(s.on_success(&cfg).is_none());
        assert_eq!(s.state, CircuitState::Open);
        assert_eq!(s.failure_count, 3);
    }

    #[test]
    fn test_would_allow_is_pure() {
        let cfg = config();
        let now = Utc::now();
        let mut s = CircuitBreakerState::new("svc");
        for _ in 0..3 {
            s.on_failure(now, &cfg);
        }
        let later = now + chrono::Duration::seconds(31);
        assert!(s.would_allow(later, &cfg));
        assert_eq!(s.state, CircuitState::Open);
    }

    #[test]
    fn test_forced_open_never_recovers() {
        let cfg = config();
        let mut s = CircuitBreakerState::new("svc");
        s.forced_open = true;
        s.state = CircuitState::Open;
        let far = Utc::now() + chrono::Duration::days(365);
        assert!(!s.would_allow(far, &cfg));
        assert_eq!(s.acquire(far, &cfg), (false, None));
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate("svc").is_ok());
        let bad = CircuitBreakerConfig {
            success_threshold: 5,
            half_open_max_calls: 2,
            ..CircuitBreakerConfig::default()
        };
        assert!(bad.validate("svc").is_err());
        let zero = CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        };
        assert!(zero.validate("svc").is_err());
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_unknown_service_is_denied() {
        let (registry, _) = registry().await;
        assert!(!registry.allow("unknown").await);
        assert!(matches!(
            registry.try_acquire("unknown").await,
            Err(Error::ServiceNotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_rejection_carries_retry_hint() {
        let (registry, clock) = registry().await;
        for _ in 0..3 {
            registry.record_result("billing", false).await.unwrap();
        }
        let hint = |result: Result<()>| match result {
            Err(Error::CircuitOpen {
                retry_after_secs, ..
            }) => retry_after_secs,
            other => panic!("unexpected result: {other:?}"),
        };
        assert_eq!(hint(registry.try_acquire("billing").await), Some(30));

        clock.advance(Duration::from_millis(20_500));
        let err = registry.try_acquire("billing").await.unwrap_err();
        assert_eq!(err.retry_after_secs(), Some(10));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (registry, _) = registry().await;
        let err = registry.register("billing", config()).await.unwrap_err();
        assert!(matches!(err, Error::ServiceAlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn test_half_open_probe_cycle() {
        let (registry, clock) = registry().await;
        for _ in 0..3 {
            registry.record_result("billing", false).await.unwrap();
        }
        assert!(matches!(
            registry.try_acquire("billing").await,
            Err(Error::CircuitOpen { failure_count: 3, .. })
        ));

        clock.advance_secs(30);
        registry.try_acquire("billing").await.unwrap();
        registry.try_acquire("billing").await.unwrap();
        assert!(registry.try_acquire("billing").await.is_err());
        assert_eq!(
            registry.state("billing").await.unwrap().state,
            CircuitState::HalfOpen
        );

        registry.record_result("billing", true).await.unwrap();
        let t = registry.record_result("billing", true).await.unwrap();
        assert_eq!(t.map(|t| t.to), Some(CircuitState::Closed));
        let state = registry.state("billing").await.unwrap();
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.half_open_calls, 0);
    }

    #[tokio::test]
    async fn test_release_probe_frees_slot() {
        let (registry, clock) = registry().await;
        for _ in 0..3 {
            registry.record_result("billing", false).await.unwrap();
        }
        clock.advance_secs(30);
        registry.try_acquire("billing").await.unwrap();
        registry.try_acquire("billing").await.unwrap();
        registry.release_probe("billing").await.unwrap();
        assert!(registry.try_acquire("billing").await.is_ok());
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let (registry, clock) = registry().await;
        registry.force_open("billing").await.unwrap();
        clock.advance_secs(3600);
        assert!(!registry.allow("billing").await);

        registry.reset("billing").await.unwrap();
        assert!(registry.allow("billing").await);
        assert_eq!(registry.services(), vec!["billing".to_string()]);
    }
}
