//! The assembled resilience core.
//!
//! [`ResilienceCore`] wires the rate limiter, penalty manager, abuse
//! detector, circuit breakers and connectivity manager around shared state
//! stores. Nothing is global: every dependency is handed to the
//! [`ResilienceCoreBuilder`] or defaulted there.
//!
//! ```text
//!            check_admission            execute
//!                  |                       |
//!                  v                       v
//!     +------------------------+  +--------------------+
//!     | MultiScopeRateLimiter  |  | ConnectivityManager|
//!     |  +- PenaltyManager     |  |  +- RetryPolicy    |
//!     |  +- AbuseDetector      |  |  +- Breakers       |
//!     +-----------+------------+  +---------+----------+
//!                 |                         |
//!        buckets / profiles           breaker states
//!                 |                         |
//!                 +-------> StateStore <----+
//!                               ^
//!                            Sweeper (background)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use bulwark::{Config, ResilienceCore, SubscriptionTier};
//!
//! let core = ResilienceCore::builder().config(Config::load()?).build().await?;
//! core.start().await;
//!
//! let decision = core
//!     .check_admission("user-1", "ws-1", Some("203.0.113.7"), SubscriptionTier::Free, 0)
//!     .await;
//! decision.into_result()?;
//!
//! let response = core.execute("billing", ServiceRequest::get("/invoices")).await?;
//!
//! core.shutdown().await;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::abuse::AbuseDetector;
use crate::audit::{AuditDispatcher, AuditSink, TracingAuditSink};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerState};
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::connectivity::{
    ConnectivityManager, ServiceHealth, ServiceRequest, ServiceResponse, Transport,
};
use crate::penalty::{PenaltyLevel, PenaltyManager, PenaltyRecord};
use crate::rate_limiter::{AdmissionDecision, CallerStatus, MultiScopeRateLimiter};
use crate::retry::{Scheduler, TokioScheduler};
use crate::store::{MemoryStore, StateStore};
use crate::sweeper::Sweeper;
use crate::tiers::SubscriptionTier;
use crate::token_bucket::TokenBucket;
use crate::trust::BehaviorProfile;
use crate::{bail_if, Error, Result};

// =============================================================================
// TIER RESOLUTION
// =============================================================================

/// Looks up a caller's subscription tier.
#[async_trait]
pub trait TierResolver: Send + Sync + fmt::Debug {
    async fn user_tier(&self, user_id: &str, workspace_id: &str) -> Result<SubscriptionTier>;
}

/// Resolves every caller to the same tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTierResolver(pub SubscriptionTier);

#[async_trait]
impl TierResolver for FixedTierResolver {
    async fn user_tier(&self, _user_id: &str, _workspace_id: &str) -> Result<SubscriptionTier> {
        Ok(self.0)
    }
}

// =============================================================================
// CORE
// =============================================================================

/// Admission control and protected outbound calls behind one handle.
#[derive(Debug)]
pub struct ResilienceCore {
    config: Config,
    limiter: MultiScopeRateLimiter,
    connectivity: Arc<ConnectivityManager>,
    sweeper: Sweeper,
    tiers: Arc<dyn TierResolver>,
    cancel: CancellationToken,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
}

impl ResilienceCore {
    /// Create a builder for custom wiring.
    pub fn builder() -> ResilienceCoreBuilder {
        ResilienceCoreBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn limiter(&self) -> &MultiScopeRateLimiter {
        &self.limiter
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityManager> {
        &self.connectivity
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start background maintenance. Calling it twice has no effect.
    pub async fn start(&self) {
        let mut task = self.sweeper_task.lock().await;
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }
        *task = Some(self.sweeper.clone().spawn(self.cancel.child_token()));
        info!(
            services = self.connectivity.breakers().services().len(),
            "resilience core started"
        );
    }

    /// Stop background maintenance and wait for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.sweeper_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("sweeper task ended abnormally: {}", e);
            }
        }
        info!("resilience core stopped");
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Decide whether a request from `user_id` may proceed.
    pub async fn check_admission(
        &self,
        user_id: &str,
        workspace_id: &str,
        ip: Option<&str>,
        tier: SubscriptionTier,
        payload_size: u64,
    ) -> AdmissionDecision {
        self.limiter
            .check_admission(user_id, workspace_id, ip, tier, payload_size)
            .await
    }

    /// As [`check_admission`](Self::check_admission), looking the tier up
    /// through the configured [`TierResolver`]. A failed lookup counts as
    /// [`SubscriptionTier::Free`].
    pub async fn check_admission_resolved(
        &self,
        user_id: &str,
        workspace_id: &str,
        ip: Option<&str>,
        payload_size: u64,
    ) -> AdmissionDecision {
        let tier = match self.tiers.user_tier(user_id, workspace_id).await {
            Ok(tier) => tier,
            Err(e) => {
                warn!(user_id, workspace_id, "tier lookup failed, using FREE: {}", e);
                SubscriptionTier::Free
            }
        };
        self.check_admission(user_id, workspace_id, ip, tier, payload_size)
            .await
    }

    /// Trust, usage and penalty diagnostics for a caller.
    pub async fn get_status(&self, user_id: &str, workspace_id: &str) -> Result<CallerStatus> {
        self.limiter.status(user_id, workspace_id).await
    }

    // -------------------------------------------------------------------------
    // Penalties
    // -------------------------------------------------------------------------

    /// Apply a penalty by hand. `minutes` overrides the level's default.
    pub async fn apply_penalty(
        &self,
        user_id: &str,
        workspace_id: &str,
        level: PenaltyLevel,
        reason: &str,
        minutes: Option<u64>,
    ) -> Result<PenaltyRecord> {
        bail_if!(
            reason.trim().is_empty(),
            Error::config_invalid_value("reason", "must not be empty")
        );
        self.limiter
            .penalties()
            .apply_penalty(user_id, workspace_id, level, reason, minutes)
            .await
    }

    /// Lift the active penalty. Returns whether one was present.
    pub async fn clear_penalty(&self, user_id: &str, workspace_id: &str) -> Result<bool> {
        self.limiter
            .penalties()
            .clear_penalty(user_id, workspace_id)
            .await
    }

    // -------------------------------------------------------------------------
    // Outbound calls
    // -------------------------------------------------------------------------

    /// Call a registered service with retry and breaker protection.
    pub async fn execute(&self, service_id: &str, request: ServiceRequest) -> Result<ServiceResponse> {
        self.connectivity.execute(service_id, request).await
    }

    /// As [`execute`](Self::execute) with an overall deadline across all
    /// attempts and backoff sleeps.
    pub async fn execute_with_deadline(
        &self,
        service_id: &str,
        request: ServiceRequest,
        deadline: Duration,
    ) -> Result<ServiceResponse> {
        self.connectivity
            .execute_with_deadline(service_id, request, deadline)
            .await
    }

    pub async fn service_health(&self) -> Vec<ServiceHealth> {
        self.connectivity.service_health().await
    }

    pub async fn breaker_state(&self, service_id: &str) -> Result<CircuitBreakerState> {
        self.connectivity.breakers().state(service_id).await
    }

    /// Hold a service's breaker open until [`reset_breaker`](Self::reset_breaker).
    pub async fn force_open(&self, service_id: &str) -> Result<()> {
        self.connectivity.force_open(service_id).await
    }

    pub async fn reset_breaker(&self, service_id: &str) -> Result<()> {
        self.connectivity.reset(service_id).await
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for a [`ResilienceCore`]. Unset parts use in-memory stores, the
/// system clock, the tokio scheduler and the tracing audit sink.
#[derive(Debug, Default)]
pub struct ResilienceCoreBuilder {
    config: Option<Config>,
    clock: Option<SharedClock>,
    scheduler: Option<Arc<dyn Scheduler>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    tiers: Option<Arc<dyn TierResolver>>,
    bucket_store: Option<Arc<dyn StateStore<TokenBucket>>>,
    profile_store: Option<Arc<dyn StateStore<BehaviorProfile>>>,
    breaker_store: Option<Arc<dyn StateStore<CircuitBreakerState>>>,
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl ResilienceCoreBuilder {
    /// Set the full configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the scheduler used for retry backoff.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Set the resolver used by `check_admission_resolved`.
    pub fn tier_resolver(mut self, resolver: Arc<dyn TierResolver>) -> Self {
        self.tiers = Some(resolver);
        self
    }

    pub fn bucket_store(mut self, store: Arc<dyn StateStore<TokenBucket>>) -> Self {
        self.bucket_store = Some(store);
        self
    }

    pub fn profile_store(mut self, store: Arc<dyn StateStore<BehaviorProfile>>) -> Self {
        self.profile_store = Some(store);
        self
    }

    pub fn breaker_store(mut self, store: Arc<dyn StateStore<CircuitBreakerState>>) -> Self {
        self.breaker_store = Some(store);
        self
    }

    /// Reach a configured service through `transport` instead of HTTP.
    pub fn transport(mut self, service_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(service_id.into(), transport);
        self
    }

    /// Validate the configuration, wire every component and register the
    /// configured services.
    pub async fn build(mut self) -> Result<ResilienceCore> {
        let config = self.config.take().unwrap_or_default();
        config.validate()?;

        for service_id in self.transports.keys() {
            bail_if!(
                !config.services.iter().any(|s| &s.service_id == service_id),
                Error::service_not_registered(service_id)
            );
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let scheduler = self.scheduler.unwrap_or_else(|| Arc::new(TokioScheduler));
        let audit = AuditDispatcher::new(
            self.audit_sink
                .unwrap_or_else(|| Arc::new(TracingAuditSink)),
        );
        let tiers = self
            .tiers
            .unwrap_or_else(|| Arc::new(FixedTierResolver::default()));
        let buckets = self
            .bucket_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let profiles = self
            .profile_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let breaker_states = self
            .breaker_store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let penalties = PenaltyManager::new(
            Arc::clone(&profiles),
            Arc::clone(&clock),
            audit.clone(),
            config.penalties.clone(),
        );
        let limiter = MultiScopeRateLimiter::new(
            config.rate_limits.clone(),
            Arc::clone(&buckets),
            Arc::clone(&profiles),
            penalties,
            AbuseDetector::new(config.abuse.clone()),
            Arc::clone(&clock),
            audit.clone(),
        );

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            breaker_states,
            Arc::clone(&clock),
            audit,
        ));
        let connectivity = Arc::new(ConnectivityManager::new(breakers, scheduler));
        for service in &config.services {
            match self.transports.remove(&service.service_id) {
                Some(transport) => {
                    connectivity
                        .register_service_with_transport(service.clone(), transport)
                        .await?
                }
                None => connectivity.register_service(service.clone()).await?,
            }
        }

        let sweeper = Sweeper::new(buckets, profiles, clock, config.sweeper.clone());

        Ok(ResilienceCore {
            config,
            limiter,
            connectivity,
            sweeper,
            tiers,
            cancel: CancellationToken::new(),
            sweeper_task: Mutex::new(None),
        })
    }
}

// =============================================================================
// UNIT TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{ChannelAuditSink, ViolationKind};
    use crate::circuit_breaker::CircuitState;
    use crate::clock::{Clock, ManualClock};
    use crate::connectivity::ServiceConfig;
    use crate::rate_limiter::RateScope;
    use crate::retry::RetryPolicy;

    #[derive(Debug)]
    struct StatusTransport(u16);

    #[async_trait]
    impl Transport for StatusTransport {
        async fn send(&self, _: &ServiceConfig, _: &ServiceRequest) -> Result<ServiceResponse> {
            Ok(ServiceResponse::new(self.0, "ok"))
        }
    }

    #[derive(Debug)]
    struct BrokenResolver;

    #[async_trait]
    impl TierResolver for BrokenResolver {
        async fn user_tier(&self, _: &str, _: &str) -> Result<SubscriptionTier> {
            Err(Error::internal("directory offline"))
        }
    }

    fn config_with_service() -> Config {
        Config {
            services: vec![ServiceConfig::new("billing", "http://billing.test")
                .with_retry(RetryPolicy::no_retry())],
            ..Config::default()
        }
    }

    async fn core_with(config: Config, status: u16) -> (ResilienceCore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let mut builder = ResilienceCore::builder().clock(clock.clone());
        if config.services.iter().any(|s| s.service_id == "billing") {
            builder = builder.transport("billing", Arc::new(StatusTransport(status)));
        }
        let core = builder.config(config).build().await.expect("Should build core");
        (core, clock)
    }

    // ------------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_build_registers_services() {
        let (core, _) = core_with(config_with_service(), 200).await;
        let health = core.service_health().await;
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].service_id, "billing");
        assert_eq!(health[0].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.rate_limits.min_trust_factor = 0.0;
        let err = ResilienceCore::builder().config(config).build().await.unwrap_err();
        assert_eq!(err.code(), "B003");
    }

    #[tokio::test]
    async fn test_build_rejects_transport_for_unknown_service() {
        let err = ResilienceCore::builder()
            .transport("ghost", Arc::new(StatusTransport(200)))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotRegistered { .. }));
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_execute_through_override_transport() {
        let (core, _) = core_with(config_with_service(), 200).await;
        let response = core
            .execute("billing", ServiceRequest::get("/invoices"))
            .await
            .expect("Should succeed");
        assert_eq!(response.text(), "ok");
        assert!(matches!(
            core.execute("unknown", ServiceRequest::get("/")).await,
            Err(Error::ServiceNotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let (core, _) = core_with(config_with_service(), 200).await;
        core.force_open("billing").await.unwrap();
        assert!(matches!(
            core.execute("billing", ServiceRequest::get("/")).await,
            Err(Error::CircuitOpen { .. })
        ));
        core.reset_breaker("billing").await.unwrap();
        assert!(core.execute("billing", ServiceRequest::get("/")).await.is_ok());
    }

    #[tokio::test]
    async fn test_manual_penalty_gates_and_clears() {
        let (core, clock) = core_with(Config::default(), 200).await;
        let record = core
            .apply_penalty("u1", "w1", PenaltyLevel::TempBlock, "chargeback", Some(30))
            .await
            .unwrap();
        assert_eq!(record.level, PenaltyLevel::TempBlock);

        let status = core.get_status("u1", "w1").await.unwrap();
        let active = status.active_penalty.unwrap();
        let until = active.until.unwrap();
        assert_eq!((until - clock.now()).num_minutes(), 30);

        let d = core
            .check_admission("u1", "w1", None, SubscriptionTier::Free, 0)
            .await;
        assert_eq!(d.scope(), Some(RateScope::Penalty));

        assert!(core.clear_penalty("u1", "w1").await.unwrap());
        assert!(core
            .check_admission("u1", "w1", None, SubscriptionTier::Free, 0)
            .await
            .allowed);
    }

    #[tokio::test]
    async fn test_empty_penalty_reason_rejected() {
        let (core, _) = core_with(Config::default(), 200).await;
        assert!(core
            .apply_penalty("u1", "w1", PenaltyLevel::Warning, "  ", None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_resolver_failure_falls_back_to_free() {
        let clock = Arc::new(ManualClock::starting_now());
        let core = ResilienceCore::builder()
            .clock(clock)
            .tier_resolver(Arc::new(BrokenResolver))
            .build()
            .await
            .unwrap();

        // FREE burst 10 floored by trust to 5.
        for _ in 0..5 {
            assert!(core.check_admission_resolved("u1", "w1", None, 0).await.allowed);
        }
        let d = core.check_admission_resolved("u1", "w1", None, 0).await;
        assert_eq!(d.violation.unwrap().limit, 5);
    }

    #[tokio::test]
    async fn test_audit_sink_receives_penalty_events() {
        let (sink, mut rx) = ChannelAuditSink::new();
        let core = ResilienceCore::builder()
            .clock(Arc::new(ManualClock::starting_now()))
            .audit_sink(Arc::new(sink))
            .build()
            .await
            .unwrap();
        core.apply_penalty("u1", "w1", PenaltyLevel::Throttle, "spam", None)
            .await
            .unwrap();
        let event = rx.recv().await.expect("Should receive event");
        assert_eq!(event.kind, ViolationKind::PenaltyApplied);
        assert_eq!(event.user_id.as_deref(), Some("u1"));
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let (core, _) = core_with(Config::default(), 200).await;
        core.start().await;
        core.start().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        core.shutdown().await;
        assert!(core.sweeper_task.lock().await.is_none());

        // A stopped core does not restart its sweeper.
        core.start().await;
        assert!(core.sweeper_task.lock().await.is_none());
    }
}
