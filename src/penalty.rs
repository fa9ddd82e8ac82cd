//! Time-bounded penalties and escalation.
//!
//! A penalty is stored on the caller's [`BehaviorProfile`] and checked before
//! any token bucket. At most one penalty is active per profile:
//!
//! | Incoming vs. active | Result |
//! |---------------------|--------|
//! | stronger | replaces the active penalty |
//! | equal | keeps the later expiry |
//! | weaker | rejected ([`Error::PenaltyDowngrade`] for manual calls) |
//!
//! Detector-issued penalties escalate one level when the caller already
//! received a penalty within `escalation_window_secs`, up to
//! `max_auto_level`. `WARNING` is recorded but never gates admission.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditDispatcher, ViolationEvent, ViolationKind};
use crate::clock::{add_duration, elapsed_secs, SharedClock};
use crate::constants::{
    DEFAULT_EXTENDED_BLOCK_MINUTES, DEFAULT_TEMP_BLOCK_MINUTES, DEFAULT_THROTTLE_MINUTES,
    DEFAULT_VIOLATION_RETENTION_SECS, MAX_PENALTY_MINUTES,
};
use crate::store::{update, StateStore};
use crate::trust::{profile_key, BehaviorProfile};
use crate::{bail_if, Error, Result};

const MAX_PENALTY_HISTORY: usize = 50;

// =============================================================================
// PENALTY LEVELS & RECORDS
// =============================================================================

/// Penalty severity, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PenaltyLevel {
    Warning,
    Throttle,
    TempBlock,
    ExtendedBlock,
    PermanentBan,
}

impl PenaltyLevel {
    /// Whether an active penalty of this level denies admission.
    pub fn gates_admission(&self) -> bool {
        *self != PenaltyLevel::Warning
    }

    /// The next harsher level.
    pub fn escalate(&self) -> PenaltyLevel {
        match self {
            PenaltyLevel::Warning => PenaltyLevel::Throttle,
            PenaltyLevel::Throttle => PenaltyLevel::TempBlock,
            PenaltyLevel::TempBlock => PenaltyLevel::ExtendedBlock,
            PenaltyLevel::ExtendedBlock | PenaltyLevel::PermanentBan => PenaltyLevel::PermanentBan,
        }
    }
}

impl fmt::Display for PenaltyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PenaltyLevel::Warning => "WARNING",
            PenaltyLevel::Throttle => "THROTTLE",
            PenaltyLevel::TempBlock => "TEMP_BLOCK",
            PenaltyLevel::ExtendedBlock => "EXTENDED_BLOCK",
            PenaltyLevel::PermanentBan => "PERMANENT_BAN",
        };
        f.write_str(s)
    }
}

impl FromStr for PenaltyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "warning" | "warn" => Ok(PenaltyLevel::Warning),
            "throttle" => Ok(PenaltyLevel::Throttle),
            "temp_block" | "temporary_block" => Ok(PenaltyLevel::TempBlock),
            "extended_block" => Ok(PenaltyLevel::ExtendedBlock),
            "permanent_ban" | "ban" => Ok(PenaltyLevel::PermanentBan),
            other => Err(Error::config_invalid_value(
                "penalty.level",
                format!("unknown penalty level '{other}'"),
            )),
        }
    }
}

/// A penalty applied to a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyRecord {
    pub level: PenaltyLevel,
    pub reason: String,
    pub applied_at: DateTime<Utc>,
    /// `None` only for `PERMANENT_BAN`.
    pub until: Option<DateTime<Utc>>,
}

impl PenaltyRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.until.map_or(true, |until| now < until)
    }

    /// Seconds until expiry; `None` for a permanent ban.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> Option<f64> {
        self.until.map(|until| elapsed_secs(now, until))
    }

    fn outlasts(&self, other: &PenaltyRecord) -> bool {
        match (self.until, other.until) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => a >= b,
        }
    }
}

/// Outcome of the penalty gate.
#[derive(Debug, Clone, PartialEq)]
pub enum PenaltyGate {
    Clear,
    Blocked {
        record: PenaltyRecord,
        retry_after_secs: Option<f64>,
    },
}

// =============================================================================
// CONFIGURATION
// =============================================================================

fn default_warning_minutes() -> u64 {
    60
}

fn default_throttle_minutes() -> u64 {
    DEFAULT_THROTTLE_MINUTES
}

fn default_temp_block_minutes() -> u64 {
    DEFAULT_TEMP_BLOCK_MINUTES
}

fn default_extended_block_minutes() -> u64 {
    DEFAULT_EXTENDED_BLOCK_MINUTES
}

fn default_escalation_window_secs() -> u64 {
    DEFAULT_VIOLATION_RETENTION_SECS
}

fn default_max_auto_level() -> PenaltyLevel {
    PenaltyLevel::ExtendedBlock
}

/// Penalty durations and escalation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyConfig {
    #[serde(default = "default_warning_minutes")]
    pub warning_minutes: u64,
    #[serde(default = "default_throttle_minutes")]
    pub throttle_minutes: u64,
    #[serde(default = "default_temp_block_minutes")]
    pub temp_block_minutes: u64,
    #[serde(default = "default_extended_block_minutes")]
    pub extended_block_minutes: u64,

    /// A prior penalty this recent escalates the next detected one.
    #[serde(default = "default_escalation_window_secs")]
    pub escalation_window_secs: u64,

    /// Highest level the detector may reach through escalation.
    #[serde(default = "default_max_auto_level")]
    pub max_auto_level: PenaltyLevel,

    /// Retry hint reported to permanently banned callers.
    #[serde(default)]
    pub ban_retry_hint_secs: Option<u64>,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            warning_minutes: default_warning_minutes(),
            throttle_minutes: default_throttle_minutes(),
            temp_block_minutes: default_temp_block_minutes(),
            extended_block_minutes: default_extended_block_minutes(),
            escalation_window_secs: default_escalation_window_secs(),
            max_auto_level: default_max_auto_level(),
            ban_retry_hint_secs: None,
        }
    }
}

impl PenaltyConfig {
    /// Default duration for `level`; `None` for a permanent ban.
    pub fn duration_minutes(&self, level: PenaltyLevel) -> Option<u64> {
        match level {
            PenaltyLevel::Warning => Some(self.warning_minutes),
            PenaltyLevel::Throttle => Some(self.throttle_minutes),
            PenaltyLevel::TempBlock => Some(self.temp_block_minutes),
            PenaltyLevel::ExtendedBlock => Some(self.extended_block_minutes),
            PenaltyLevel::PermanentBan => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (key, minutes) in [
            ("penalties.warning_minutes", self.warning_minutes),
            ("penalties.throttle_minutes", self.throttle_minutes),
            ("penalties.temp_block_minutes", self.temp_block_minutes),
            ("penalties.extended_block_minutes", self.extended_block_minutes),
        ] {
            bail_if!(
                minutes == 0 || minutes > MAX_PENALTY_MINUTES,
                Error::config_invalid_value(
                    key,
                    format!("must be between 1 and {MAX_PENALTY_MINUTES}"),
                )
            );
        }
        bail_if!(
            self.max_auto_level == PenaltyLevel::Warning,
            Error::config_invalid_value("penalties.max_auto_level", "must gate admission")
        );
        Ok(())
    }
}

// =============================================================================
// PENALTY MANAGER
// =============================================================================

enum Merge {
    Applied(PenaltyRecord),
    Kept(PenaltyRecord),
    Rejected { active: PenaltyLevel },
}

/// Places the incoming record onto the profile following the table above.
fn merge(profile: &mut BehaviorProfile, incoming: PenaltyRecord, now: DateTime<Utc>) -> Merge {
    if let Some(active) = profile.active_penalty(now).cloned() {
        if incoming.level < active.level {
            return Merge::Rejected {
                active: active.level,
            };
        }
        if incoming.level == active.level && active.outlasts(&incoming) {
            return Merge::Kept(active);
        }
    }
    profile.current_penalty = Some(incoming.clone());
    profile.penalty_history.push(incoming.clone());
    if profile.penalty_history.len() > MAX_PENALTY_HISTORY {
        let excess = profile.penalty_history.len() - MAX_PENALTY_HISTORY;
        profile.penalty_history.drain(..excess);
    }
    Merge::Applied(incoming)
}

/// Reads and writes penalties on behavior profiles.
#[derive(Debug, Clone)]
pub struct PenaltyManager {
    profiles: Arc<dyn StateStore<BehaviorProfile>>,
    clock: SharedClock,
    audit: AuditDispatcher,
    config: PenaltyConfig,
}

impl PenaltyManager {
    pub fn new(
        profiles: Arc<dyn StateStore<BehaviorProfile>>,
        clock: SharedClock,
        audit: AuditDispatcher,
        config: PenaltyConfig,
    ) -> Self {
        Self {
            profiles,
            clock,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &PenaltyConfig {
        &self.config
    }

    fn record_for(&self, level: PenaltyLevel, reason: &str, minutes: Option<u64>) -> PenaltyRecord {
        let now = self.clock.now();
        let until = match level {
            PenaltyLevel::PermanentBan => None,
            _ => {
                let minutes = minutes
                    .or_else(|| self.config.duration_minutes(level))
                    .unwrap_or(0)
                    .min(MAX_PENALTY_MINUTES);
                Some(add_duration(now, Duration::from_secs(minutes * 60)))
            }
        };
        PenaltyRecord {
            level,
            reason: reason.to_string(),
            applied_at: now,
            until,
        }
    }

    /// The active penalty for a caller, if any.
    pub async fn active_penalty(&self, user_id: &str, workspace_id: &str) -> Result<Option<PenaltyRecord>> {
        let now = self.clock.now();
        Ok(self
            .profiles
            .get(&profile_key(workspace_id, user_id))
            .await?
            .and_then(|p| p.value.active_penalty(now).cloned()))
    }

    /// First admission gate.
    pub async fn check_penalty(&self, user_id: &str, workspace_id: &str) -> Result<PenaltyGate> {
        let now = self.clock.now();
        match self.active_penalty(user_id, workspace_id).await? {
            Some(record) if record.level.gates_admission() => {
                let retry_after_secs = record.remaining_secs(now).or_else(|| {
                    self.config
                        .ban_retry_hint_secs
                        .map(|secs| secs as f64)
                });
                Ok(PenaltyGate::Blocked {
                    record,
                    retry_after_secs,
                })
            }
            _ => Ok(PenaltyGate::Clear),
        }
    }

    /// Apply a penalty on administrative request.
    ///
    /// `minutes` overrides the level's default duration. Fails with
    /// [`Error::PenaltyDowngrade`] when a stronger penalty is active.
    pub async fn apply_penalty(
        &self,
        user_id: &str,
        workspace_id: &str,
        level: PenaltyLevel,
        reason: &str,
        minutes: Option<u64>,
    ) -> Result<PenaltyRecord> {
        let incoming = self.record_for(level, reason, minutes);
        match self.store_penalty(user_id, workspace_id, incoming).await? {
            Merge::Applied(record) => {
                self.announce(user_id, workspace_id, &record, false);
                Ok(record)
            }
            Merge::Kept(record) => Ok(record),
            Merge::Rejected { active } => Err(Error::PenaltyDowngrade {
                active,
                requested: level,
            }),
        }
    }

    /// Apply a detector-issued penalty, escalating repeat offenders.
    ///
    /// Returns the newly applied record, or `None` when an equal or
    /// stronger penalty was already in force.
    pub async fn apply_detected(
        &self,
        user_id: &str,
        workspace_id: &str,
        level: PenaltyLevel,
        reason: &str,
    ) -> Result<Option<PenaltyRecord>> {
        let now = self.clock.now();
        let window = self.config.escalation_window_secs as f64;
        let recently_penalized = self
            .profiles
            .get(&profile_key(workspace_id, user_id))
            .await?
            .is_some_and(|p| {
                p.value
                    .penalty_history
                    .iter()
                    .any(|r| elapsed_secs(r.applied_at, now) <= window)
            });

        let effective = if recently_penalized {
            level.escalate().min(self.config.max_auto_level).max(level)
        } else {
            level
        };

        let incoming = self.record_for(effective, reason, None);
        match self.store_penalty(user_id, workspace_id, incoming).await? {
            Merge::Applied(record) => {
                self.announce(user_id, workspace_id, &record, effective != level);
                Ok(Some(record))
            }
            Merge::Kept(_) | Merge::Rejected { .. } => Ok(None),
        }
    }

    /// Remove the active penalty. Returns whether one was present.
    pub async fn clear_penalty(&self, user_id: &str, workspace_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let key = profile_key(workspace_id, user_id);
        if self.profiles.get(&key).await?.is_none() {
            return Ok(false);
        }
        let (_, cleared) = update(self.profiles.as_ref(), &key, |current| {
            let mut profile =
                current.unwrap_or_else(|| BehaviorProfile::new(user_id, workspace_id, now));
            let cleared = profile.current_penalty.take();
            (profile, cleared)
        })
        .await?;

        if let Some(record) = &cleared {
            info!(user_id, workspace_id, level = %record.level, "penalty cleared");
            self.audit.emit(ViolationEvent::for_caller(
                ViolationKind::PenaltyCleared,
                now,
                user_id,
                workspace_id,
                format!("{} penalty cleared", record.level),
            ));
        }
        Ok(cleared.is_some_and(|r| r.is_active(now)))
    }

    async fn store_penalty(
        &self,
        user_id: &str,
        workspace_id: &str,
        incoming: PenaltyRecord,
    ) -> Result<Merge> {
        let now = self.clock.now();
        let (_, outcome) = update(
            self.profiles.as_ref(),
            &profile_key(workspace_id, user_id),
            |current| {
                let mut profile =
                    current.unwrap_or_else(|| BehaviorProfile::new(user_id, workspace_id, now));
                let outcome = merge(&mut profile, incoming.clone(), now);
                (profile, outcome)
            },
        )
        .await?;
        Ok(outcome)
    }

    fn announce(&self, user_id: &str, workspace_id: &str, record: &PenaltyRecord, escalated: bool) {
        warn!(
            user_id,
            workspace_id,
            level = %record.level,
            until = ?record.until,
            escalated,
            "penalty applied: {}",
            record.reason
        );
        self.audit.emit(
            ViolationEvent::for_caller(
                ViolationKind::PenaltyApplied,
                record.applied_at,
                user_id,
                workspace_id,
                format!("{} penalty: {}", record.level, record.reason),
            )
            .with_metadata(serde_json::json!({
                "level": record.level,
                "until": record.until,
                "escalated": escalated,
            })),
        );
    }
}
