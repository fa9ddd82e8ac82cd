//! Behavior profiles and trust scoring.
//!
//! One [`BehaviorProfile`] exists per (workspace, user). It accumulates
//! request statistics, rate-limit violations and penalties, and yields a
//! trust score in `[0, 1]`:
//!
//! ```text
//! trust = clamp01( min(1, age_days / 30) * legitimacy - 0.1 * violations )
//!
//! legitimacy = (admitted + 8) / (total + 8)
//! ```
//!
//! Trust scales the caller's user-scope limits through [`adapted_limit`].
//! It is recomputed on every check and never cached.
//!
//! The limiter applies [`floored_limit`] with `rate_limits.min_trust_factor`
//! as the floor. With the default factor of 0.5 the floor always wins below
//! the expansion threshold, so every caller under trust 0.5 gets exactly
//! half the base limit and the `base * trust` shrink never shows. Lower the
//! factor to let low trust shrink limits further.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_secs;
use crate::constants::{
    EMA_ALPHA, LEGITIMACY_PRIOR, MAX_RECENT_REQUESTS, RATE_WINDOW_SECS,
    TRUST_EXPANSION_BONUS, TRUST_EXPANSION_THRESHOLD, TRUST_FULL_AGE_DAYS,
    TRUST_PENALTY_PER_VIOLATION,
};
use crate::penalty::PenaltyRecord;
use crate::rate_limiter::RateScope;

const SECS_PER_DAY: f64 = 86_400.0;

/// Store key of a caller's profile.
pub fn profile_key(workspace_id: &str, user_id: &str) -> String {
    format!("profile:{workspace_id}:{user_id}")
}

/// One rate-limit denial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub at: DateTime<Utc>,
    pub scope: RateScope,
    pub cost: f64,
}

/// Accumulated behavior of one caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub user_id: String,
    pub workspace_id: String,
    pub avg_msgs_per_min: f64,
    pub peak_msgs_per_min: f64,
    pub typical_payload_size: f64,
    /// Request timestamps within the last rate window.
    #[serde(default)]
    pub recent_requests: VecDeque<DateTime<Utc>>,
    pub total_requests: u64,
    pub denied_requests: u64,
    pub violations: Vec<ViolationRecord>,
    pub current_penalty: Option<PenaltyRecord>,
    #[serde(default)]
    pub penalty_history: Vec<PenaltyRecord>,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl BehaviorProfile {
    pub fn new(user_id: impl Into<String>, workspace_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            avg_msgs_per_min: 0.0,
            peak_msgs_per_min: 0.0,
            typical_payload_size: 0.0,
            recent_requests: VecDeque::new(),
            total_requests: 0,
            denied_requests: 0,
            violations: Vec::new(),
            current_penalty: None,
            penalty_history: Vec::new(),
            first_seen: now,
            last_activity: now,
        }
    }

    /// Drop request timestamps outside the rate window and violations
    /// older than `retention_secs`.
    pub fn prune(&mut self, now: DateTime<Utc>, retention_secs: u64) {
        let window_start = now - Duration::seconds(RATE_WINDOW_SECS);
        while self.recent_requests.front().is_some_and(|t| *t < window_start) {
            self.recent_requests.pop_front();
        }
        let retention = retention_secs as f64;
        self.violations
            .retain(|v| elapsed_secs(v.at, now) <= retention);
    }

    /// Record an admission check and update the rate and payload averages.
    ///
    /// Returns the typical payload size as it was before this request.
    pub fn record_request(&mut self, now: DateTime<Utc>, payload_size: u64, retention_secs: u64) -> f64 {
        self.prune(now, retention_secs);

        self.recent_requests.push_back(now);
        while self.recent_requests.len() > MAX_RECENT_REQUESTS {
            self.recent_requests.pop_front();
        }

        let previous_typical = self.typical_payload_size;
        let size = payload_size as f64;
        self.typical_payload_size = if self.total_requests == 0 {
            size
        } else {
            ema(self.typical_payload_size, size)
        };

        self.total_requests = self.total_requests.saturating_add(1);
        let rate = self.recent_requests.len() as f64;
        self.avg_msgs_per_min = ema(self.avg_msgs_per_min, rate);
        self.peak_msgs_per_min = self.peak_msgs_per_min.max(rate);
        self.last_activity = now;

        previous_typical
    }

    /// Record a denial at `scope`.
    pub fn record_violation(&mut self, now: DateTime<Utc>, scope: RateScope, cost: f64) {
        self.denied_requests = self.denied_requests.saturating_add(1);
        self.violations.push(ViolationRecord { at: now, scope, cost });
        self.last_activity = now;
    }

    /// Requests observed within the trailing rate window.
    pub fn requests_in_window(&self, now: DateTime<Utc>) -> usize {
        let window_start = now - Duration::seconds(RATE_WINDOW_SECS);
        self.recent_requests.iter().filter(|t| **t >= window_start).count()
    }

    /// Retained violations no older than `window_secs`.
    pub fn violations_within(&self, now: DateTime<Utc>, window_secs: u64) -> usize {
        let window = window_secs as f64;
        self.violations
            .iter()
            .filter(|v| elapsed_secs(v.at, now) <= window)
            .count()
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        elapsed_secs(self.first_seen, now) / SECS_PER_DAY
    }

    /// Smoothed share of admitted requests.
    pub fn legitimacy_score(&self) -> f64 {
        let total = self.total_requests as f64;
        let admitted = self.total_requests.saturating_sub(self.denied_requests) as f64;
        clamp01((admitted + LEGITIMACY_PRIOR) / (total + LEGITIMACY_PRIOR))
    }

    pub fn trust_score(&self, now: DateTime<Utc>) -> f64 {
        trust_score(self.age_days(now), self.legitimacy_score(), self.violations.len())
    }

    /// The current penalty if it has not expired.
    pub fn active_penalty(&self, now: DateTime<Utc>) -> Option<&PenaltyRecord> {
        self.current_penalty.as_ref().filter(|p| p.is_active(now))
    }
}

fn ema(previous: f64, sample: f64) -> f64 {
    EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * previous
}

fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Trust from account age, legitimacy ratio and retained violation count.
pub fn trust_score(age_days: f64, legitimacy: f64, violation_count: usize) -> f64 {
    let age = if age_days.is_finite() { age_days.max(0.0) } else { 0.0 };
    let age_factor = (age / TRUST_FULL_AGE_DAYS).min(1.0);
    let raw = age_factor * clamp01(legitimacy)
        - TRUST_PENALTY_PER_VIOLATION * violation_count as f64;
    clamp01(raw)
}

/// Scale `base` by trust: expand above the threshold, shrink below it.
pub fn adapted_limit(base: f64, trust: f64) -> f64 {
    let trust = clamp01(trust);
    if trust >= TRUST_EXPANSION_THRESHOLD {
        base * (1.0 + TRUST_EXPANSION_BONUS * trust)
    } else {
        base * trust
    }
}

/// [`adapted_limit`] but never below `base * min_factor`.
///
/// Below the expansion threshold the result is
/// `base * max(trust, min_factor)`.
pub fn floored_limit(base: f64, trust: f64, min_factor: f64) -> f64 {
    adapted_limit(base, trust).max(base * clamp01(min_factor))
}
