//! Multi-scope adaptive rate limiter for Bulwark.
//!
//! Every admission check walks a fixed chain of gates. The first gate that
//! denies stops evaluation:
//!
//! ```text
//! +---------+   +------+   +-----------+   +-----------+   +--------+
//! | penalty |-->| user |-->| workspace |-->| ip (opt.) |-->| global |--> allowed
//! +---------+   +------+   +-----------+   +-----------+   +--------+
//!      |            |            |               |              |
//!      +------------+------------+---------------+--------------+--> denied(scope)
//! ```
//!
//! ## Scopes
//!
//! | Scope | Bucket key | Capacity / refill |
//! |-------|------------|-------------------|
//! | user | `user:{workspace}:{user}` | tier burst / refill, scaled by trust |
//! | workspace | `workspace:{workspace}` | tier values x `workspace_multiplier` |
//! | ip | `ip:{addr}` | `ip` scope limits |
//! | global | `global` | `global` scope limits |
//!
//! Tokens taken at earlier scopes are refunded when a later scope denies,
//! so a rejected request consumes no quota. On a bucket denial the abuse
//! detector inspects the caller's profile and may issue a penalty, which
//! then gates every later check.
//!
//! Store or detector failures never deny a request: they are logged and the
//! affected gate is skipped.
//!
//! ## Example
//!
//! ```rust,ignore
//! let decision = limiter
//!     .check_admission("user-1", "ws-1", Some("203.0.113.7"), SubscriptionTier::Free, 512)
//!     .await;
//!
//! if !decision.allowed {
//!     for (name, value) in decision.headers() {
//!         response.insert_header(name, value);
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::abuse::{AbuseDetectionResult, AbuseDetector, DenialContext, RecommendedAction};
use crate::audit::{AuditDispatcher, ViolationEvent, ViolationKind};
use crate::clock::SharedClock;
use crate::constants::{
    DEFAULT_MIN_TRUST_FACTOR, DEFAULT_VIOLATION_RETENTION_SECS, DEFAULT_WORKSPACE_MULTIPLIER,
    GLOBAL_BUCKET_KEY,
};
use crate::penalty::{PenaltyGate, PenaltyLevel, PenaltyManager, PenaltyRecord};
use crate::store::{update, StateStore};
use crate::tiers::{ScopeLimits, SubscriptionTier, TierTable};
use crate::token_bucket::{request_cost, BucketOutcome, TokenBucket};
use crate::trust::{floored_limit, profile_key, BehaviorProfile};
use crate::{bail_if, Error, Result};

// =============================================================================
// SCOPES & DECISIONS
// =============================================================================

/// The gate that produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    Penalty,
    User,
    Workspace,
    Ip,
    Global,
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RateScope::Penalty => "penalty",
            RateScope::User => "user",
            RateScope::Workspace => "workspace",
            RateScope::Ip => "ip",
            RateScope::Global => "global",
        };
        f.write_str(s)
    }
}

pub fn user_bucket_key(workspace_id: &str, user_id: &str) -> String {
    format!("user:{workspace_id}:{user_id}")
}

pub fn workspace_bucket_key(workspace_id: &str) -> String {
    format!("workspace:{workspace_id}")
}

pub fn ip_bucket_key(addr: &str) -> String {
    format!("ip:{addr}")
}

/// Details of a denial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationInfo {
    pub scope: RateScope,
    /// `None` only for a permanent ban without a configured hint.
    pub retry_after_secs: Option<f64>,
    pub abuse_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_action: Option<RecommendedAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_level: Option<PenaltyLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Capacity of the denying bucket.
    pub limit: u32,
    /// Whole tokens left in the denying bucket.
    pub remaining: u32,
    /// Seconds until the denying bucket is full again.
    pub reset_after_secs: u64,
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<ViolationInfo>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            violation: None,
        }
    }

    pub fn deny(violation: ViolationInfo) -> Self {
        Self {
            allowed: false,
            violation: Some(violation),
        }
    }

    /// The denying scope, if any.
    pub fn scope(&self) -> Option<RateScope> {
        self.violation.as_ref().map(|v| v.scope)
    }

    /// Convert a denial into an error for `?` propagation.
    pub fn into_result(self) -> Result<()> {
        let allowed = self.allowed;
        let Some(v) = self.violation.filter(|_| !allowed) else {
            return Ok(());
        };
        match (v.scope, v.penalty_level) {
            (RateScope::Penalty, Some(level)) => Err(Error::PenaltyActive {
                level,
                reason: v.reason.unwrap_or_default(),
                retry_after_secs: v.retry_after_secs,
            }),
            _ => Err(Error::RateLimited {
                scope: v.scope,
                limit: v.limit,
                remaining: v.remaining,
                reset_secs: v.reset_after_secs,
                retry_after_secs: v.retry_after_secs.unwrap_or(0.0),
            }),
        }
    }

    /// Conventional response headers for a denial.
    pub fn headers(&self) -> Vec<(String, String)> {
        let Some(v) = &self.violation else {
            return Vec::new();
        };
        let mut headers = Vec::with_capacity(4);
        if let Some(retry) = v.retry_after_secs {
            headers.push(("Retry-After".to_string(), (retry.max(0.0).ceil() as u64).to_string()));
        }
        headers.push(("X-RateLimit-Limit".to_string(), v.limit.to_string()));
        headers.push(("X-RateLimit-Remaining".to_string(), v.remaining.to_string()));
        headers.push(("X-RateLimit-Reset".to_string(), v.reset_after_secs.to_string()));
        headers
    }
}

/// Tokens and capacity of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeUsage {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub user: Option<ScopeUsage>,
    pub workspace: Option<ScopeUsage>,
    pub requests_last_minute: usize,
}

/// Diagnostics for one caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallerStatus {
    pub user_id: String,
    pub workspace_id: String,
    pub trust_score: f64,
    pub current_usage: UsageSnapshot,
    pub active_penalty: Option<PenaltyRecord>,
    pub violations_retained: usize,
}

// =============================================================================
// CONFIGURATION
// =============================================================================

fn default_enabled() -> bool {
    true
}

fn default_ip() -> ScopeLimits {
    ScopeLimits::ip_default()
}

fn default_global() -> ScopeLimits {
    ScopeLimits::global_default()
}

fn default_workspace_multiplier() -> f64 {
    DEFAULT_WORKSPACE_MULTIPLIER
}

fn default_min_trust_factor() -> f64 {
    DEFAULT_MIN_TRUST_FACTOR
}

fn default_violation_retention_secs() -> u64 {
    DEFAULT_VIOLATION_RETENTION_SECS
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// When false every check is admitted.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub tiers: TierTable,

    #[serde(default = "default_ip")]
    pub ip: ScopeLimits,

    #[serde(default = "default_global")]
    pub global: ScopeLimits,

    /// Workspace limits as a multiple of the caller's tier limits.
    #[serde(default = "default_workspace_multiplier")]
    pub workspace_multiplier: f64,

    /// Floor for trust adaptation of user limits, in (0, 1].
    #[serde(default = "default_min_trust_factor")]
    pub min_trust_factor: f64,

    /// How long violations count against a caller.
    #[serde(default = "default_violation_retention_secs")]
    pub violation_retention_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tiers: TierTable::default(),
            ip: default_ip(),
            global: default_global(),
            workspace_multiplier: default_workspace_multiplier(),
            min_trust_factor: default_min_trust_factor(),
            violation_retention_secs: default_violation_retention_secs(),
        }
    }
}

impl RateLimitConfig {
    /// No limiting at all.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.tiers.validate()?;
        self.ip.validate("rate_limits.ip")?;
        self.global.validate("rate_limits.global")?;
        bail_if!(
            !self.workspace_multiplier.is_finite() || self.workspace_multiplier < 1.0,
            Error::config_invalid_value("rate_limits.workspace_multiplier", "must be >= 1.0")
        );
        bail_if!(
            !(self.min_trust_factor > 0.0 && self.min_trust_factor <= 1.0),
            Error::config_invalid_value("rate_limits.min_trust_factor", "must lie in (0, 1]")
        );
        bail_if!(
            self.violation_retention_secs == 0,
            Error::config_invalid_value("rate_limits.violation_retention_secs", "must be positive")
        );
        Ok(())
    }
}

// =============================================================================
// RATE LIMITER
// =============================================================================

/// One bucket to evaluate.
#[derive(Debug, Clone)]
struct ScopeCheck {
    scope: RateScope,
    key: String,
    capacity: f64,
    refill: f64,
}

/// A bucket denial.
#[derive(Debug, Clone)]
struct Denial {
    scope: RateScope,
    retry_after_secs: f64,
    bucket: TokenBucket,
}

/// Admission control over user, workspace, IP and global buckets.
#[derive(Debug, Clone)]
pub struct MultiScopeRateLimiter {
    config: RateLimitConfig,
    buckets: Arc<dyn StateStore<TokenBucket>>,
    profiles: Arc<dyn StateStore<BehaviorProfile>>,
    penalties: PenaltyManager,
    detector: AbuseDetector,
    clock: SharedClock,
    audit: AuditDispatcher,
}

impl MultiScopeRateLimiter {
    pub fn new(
        config: RateLimitConfig,
        buckets: Arc<dyn StateStore<TokenBucket>>,
        profiles: Arc<dyn StateStore<BehaviorProfile>>,
        penalties: PenaltyManager,
        detector: AbuseDetector,
        clock: SharedClock,
        audit: AuditDispatcher,
    ) -> Self {
        Self {
            config,
            buckets,
            profiles,
            penalties,
            detector,
            clock,
            audit,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn penalties(&self) -> &PenaltyManager {
        &self.penalties
    }

    /// Decide whether a request may proceed.
    pub async fn check_admission(
        &self,
        user_id: &str,
        workspace_id: &str,
        ip: Option<&str>,
        tier: SubscriptionTier,
        payload_size: u64,
    ) -> AdmissionDecision {
        if !self.config.enabled {
            return AdmissionDecision::allow();
        }
        let now = self.clock.now();
        let cost = request_cost(payload_size);

        // Penalty gate
        match self.penalties.check_penalty(user_id, workspace_id).await {
            Ok(PenaltyGate::Blocked {
                record,
                retry_after_secs,
            }) => {
                debug!(user_id, workspace_id, level = %record.level, "denied by active penalty");
                return AdmissionDecision::deny(ViolationInfo {
                    scope: RateScope::Penalty,
                    retry_after_secs,
                    abuse_detected: false,
                    recommended_action: None,
                    penalty_level: Some(record.level),
                    reason: Some(record.reason),
                    limit: 0,
                    remaining: 0,
                    reset_after_secs: retry_after_secs.map_or(0, |s| s.ceil() as u64),
                });
            }
            Ok(PenaltyGate::Clear) => {}
            Err(e) => warn!(user_id, workspace_id, "penalty lookup failed, skipping gate: {}", e),
        }

        // Trust-adapted limits
        let pkey = profile_key(workspace_id, user_id);
        let trust = match self.profiles.get(&pkey).await {
            Ok(profile) => profile.map_or(0.0, |p| p.value.trust_score(now)),
            Err(e) => {
                warn!(user_id, workspace_id, "profile lookup failed: {}", e);
                0.0
            }
        };
        let checks = self.scope_checks(user_id, workspace_id, ip, tier, trust);

        // Buckets in order
        let mut consumed: Vec<&ScopeCheck> = Vec::with_capacity(checks.len());
        let mut denial = None;
        for check in &checks {
            match self.consume(check, cost, now).await {
                Ok((_, BucketOutcome::Admitted { .. })) => consumed.push(check),
                Ok((bucket, BucketOutcome::Denied { retry_after_secs, .. })) => {
                    denial = Some(Denial {
                        scope: check.scope,
                        retry_after_secs,
                        bucket,
                    });
                    break;
                }
                Err(e) => warn!(scope = %check.scope, key = %check.key, "bucket unavailable, skipping: {}", e),
            }
        }

        if denial.is_some() {
            for check in consumed {
                if let Err(e) = self.refund(check, cost, now).await {
                    warn!(key = %check.key, "refund failed: {}", e);
                }
            }
        }

        // Profile bookkeeping
        let denied_scope = denial.as_ref().map(|d| d.scope);
        let retention = self.config.violation_retention_secs;
        let profile = update(self.profiles.as_ref(), &pkey, |current| {
            let mut profile =
                current.unwrap_or_else(|| BehaviorProfile::new(user_id, workspace_id, now));
            let previous_typical = profile.record_request(now, payload_size, retention);
            if let Some(scope) = denied_scope {
                profile.record_violation(now, scope, cost);
            }
            (profile, previous_typical)
        })
        .await;
        let profile = match profile {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(user_id, workspace_id, "profile update failed: {}", e);
                None
            }
        };

        let Some(denial) = denial else {
            debug!(user_id, workspace_id, cost, trust, "admitted");
            return AdmissionDecision::allow();
        };

        warn!(
            user_id,
            workspace_id,
            scope = %denial.scope,
            retry_after_secs = denial.retry_after_secs,
            "rate limit exceeded"
        );
        self.audit.emit(
            ViolationEvent::for_caller(
                ViolationKind::RateLimitExceeded,
                now,
                user_id,
                workspace_id,
                format!("rate limit exceeded at {} scope", denial.scope),
            )
            .with_metadata(serde_json::json!({
                "scope": denial.scope,
                "cost": cost,
                "retry_after_secs": denial.retry_after_secs,
                "ip": ip,
            })),
        );

        let detection = profile.and_then(|(profile, previous_typical)| {
            self.detector.evaluate(&DenialContext {
                profile: &profile,
                tier_limits: self.config.tiers.limits(tier),
                payload_size,
                previous_typical_payload: previous_typical,
                now,
            })
        });
        let applied = match &detection {
            Some(result) => self.handle_abuse(user_id, workspace_id, result, now).await,
            None => None,
        };

        let bucket = &denial.bucket;
        AdmissionDecision::deny(ViolationInfo {
            scope: denial.scope,
            retry_after_secs: Some(denial.retry_after_secs),
            abuse_detected: detection.is_some(),
            recommended_action: detection.as_ref().map(|d| d.recommended_action),
            penalty_level: applied
                .map(|record| record.level)
                .or_else(|| detection.as_ref().map(|d| d.penalty_level)),
            reason: detection.as_ref().map(|d| d.reason()),
            limit: bucket.capacity.floor() as u32,
            remaining: bucket.tokens.max(0.0).floor() as u32,
            reset_after_secs: bucket.reset_after(now).ceil() as u64,
        })
    }

    fn scope_checks(
        &self,
        user_id: &str,
        workspace_id: &str,
        ip: Option<&str>,
        tier: SubscriptionTier,
        trust: f64,
    ) -> Vec<ScopeCheck> {
        let limits = self.config.tiers.limits(tier);
        let floor = self.config.min_trust_factor;
        let multiplier = self.config.workspace_multiplier;

        let mut checks = vec![
            ScopeCheck {
                scope: RateScope::User,
                key: user_bucket_key(workspace_id, user_id),
                capacity: floored_limit(limits.capacity(), trust, floor),
                refill: floored_limit(limits.refill_per_sec, trust, floor),
            },
            ScopeCheck {
                scope: RateScope::Workspace,
                key: workspace_bucket_key(workspace_id),
                capacity: limits.capacity() * multiplier,
                refill: limits.refill_per_sec * multiplier,
            },
        ];
        if let Some(addr) = ip.filter(|a| !a.is_empty()) {
            checks.push(ScopeCheck {
                scope: RateScope::Ip,
                key: ip_bucket_key(addr),
                capacity: self.config.ip.capacity,
                refill: self.config.ip.refill_per_sec,
            });
        }
        checks.push(ScopeCheck {
            scope: RateScope::Global,
            key: GLOBAL_BUCKET_KEY.to_string(),
            capacity: self.config.global.capacity,
            refill: self.config.global.refill_per_sec,
        });
        checks
    }

    async fn consume(
        &self,
        check: &ScopeCheck,
        cost: f64,
        now: DateTime<Utc>,
    ) -> Result<(TokenBucket, BucketOutcome)> {
        update(self.buckets.as_ref(), &check.key, |current| {
            let mut bucket = match current {
                Some(mut bucket) => {
                    bucket.refill(now);
                    bucket.reconfigure(check.capacity, check.refill);
                    bucket
                }
                None => TokenBucket::new(&check.key, check.capacity, check.refill, now),
            };
            let outcome = bucket.try_consume(cost, now);
            (bucket, outcome)
        })
        .await
    }

    async fn refund(&self, check: &ScopeCheck, cost: f64, now: DateTime<Utc>) -> Result<()> {
        update(self.buckets.as_ref(), &check.key, |current| {
            let mut bucket = current
                .unwrap_or_else(|| TokenBucket::new(&check.key, check.capacity, check.refill, now));
            bucket.refund(cost);
            (bucket, ())
        })
        .await?;
        Ok(())
    }

    async fn handle_abuse(
        &self,
        user_id: &str,
        workspace_id: &str,
        result: &AbuseDetectionResult,
        now: DateTime<Utc>,
    ) -> Option<PenaltyRecord> {
        warn!(
            user_id,
            workspace_id,
            confidence = result.confidence,
            action = %result.recommended_action,
            "abuse detected: {}",
            result.evidence.join("; ")
        );
        self.audit.emit(
            ViolationEvent::for_caller(
                ViolationKind::AbuseDetected,
                now,
                user_id,
                workspace_id,
                result.reason(),
            )
            .with_metadata(serde_json::to_value(result).unwrap_or_default()),
        );
        match self
            .penalties
            .apply_detected(user_id, workspace_id, result.penalty_level, &result.reason())
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                warn!(user_id, workspace_id, "failed to apply detected penalty: {}", e);
                None
            }
        }
    }

    /// Diagnostics for a caller. Does not create any state.
    pub async fn status(&self, user_id: &str, workspace_id: &str) -> Result<CallerStatus> {
        let now = self.clock.now();
        let profile = self
            .profiles
            .get(&profile_key(workspace_id, user_id))
            .await?
            .map(|v| v.value);

        let usage = |bucket: Option<TokenBucket>| {
            bucket.map(|b| ScopeUsage {
                tokens: b.peek(now),
                capacity: b.capacity,
                refill_per_sec: b.refill_rate,
            })
        };
        let user = self
            .buckets
            .get(&user_bucket_key(workspace_id, user_id))
            .await?
            .map(|v| v.value);
        let workspace = self
            .buckets
            .get(&workspace_bucket_key(workspace_id))
            .await?
            .map(|v| v.value);

        Ok(CallerStatus {
            user_id: user_id.to_string(),
            workspace_id: workspace_id.to_string(),
            trust_score: profile.as_ref().map_or(0.0, |p| p.trust_score(now)),
            current_usage: UsageSnapshot {
                user: usage(user),
                workspace: usage(workspace),
                requests_last_minute: profile.as_ref().map_or(0, |p| p.requests_in_window(now)),
            },
            active_penalty: profile.as_ref().and_then(|p| p.active_penalty(now).cloned()),
            violations_retained: profile.as_ref().map_or(0, |p| p.violations.len()),
        })
    }
}
