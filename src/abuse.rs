//! Behavioral abuse detection.
//!
//! Runs on every bucket denial against the caller's updated profile.
//!
//! | Pattern | Rule | Confidence |
//! |---------|------|------------|
//! | Flooding | `flood_violation_count` violations within `flood_window_secs` | 0.8 (0.95 at twice the count) |
//! | Spam | requests in the last minute above `rpm * spam_rate_multiplier` | 0.6 |
//! | Payload anomaly | payload above `typical * payload_anomaly_factor` | 0.5 |
//! | Repeat offender | `repeat_offender_violations` within `repeat_window_secs` | 0.9 |
//!
//! The overall confidence is the maximum over matched patterns and maps to
//! an action and penalty level:
//!
//! ```text
//! confidence >= 0.9  ->  BLOCK       / EXTENDED_BLOCK
//! confidence >= 0.7  ->  QUARANTINE  / TEMP_BLOCK
//! otherwise          ->  FLAG        / THROTTLE
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BLOCK_CONFIDENCE, DEFAULT_QUARANTINE_CONFIDENCE};
use crate::penalty::PenaltyLevel;
use crate::tiers::TierLimits;
use crate::trust::BehaviorProfile;
use crate::{bail_if, Error, Result};

const FLOODING_CONFIDENCE: f64 = 0.8;
const SEVERE_FLOODING_CONFIDENCE: f64 = 0.95;
const SPAM_CONFIDENCE: f64 = 0.6;
const PAYLOAD_ANOMALY_CONFIDENCE: f64 = 0.5;
const REPEAT_OFFENDER_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbuseType {
    Flooding,
    Spam,
    PayloadAnomaly,
    RepeatOffender,
}

impl fmt::Display for AbuseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbuseType::Flooding => "flooding",
            AbuseType::Spam => "spam",
            AbuseType::PayloadAnomaly => "payload_anomaly",
            AbuseType::RepeatOffender => "repeat_offender",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedAction {
    Flag,
    Quarantine,
    Block,
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecommendedAction::Flag => "FLAG",
            RecommendedAction::Quarantine => "QUARANTINE",
            RecommendedAction::Block => "BLOCK",
        };
        f.write_str(s)
    }
}

/// One evaluation that matched at least one pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbuseDetectionResult {
    pub abuse_types: Vec<AbuseType>,
    pub confidence: f64,
    pub recommended_action: RecommendedAction,
    pub penalty_level: PenaltyLevel,
    pub evidence: Vec<String>,
}

impl AbuseDetectionResult {
    /// Short reason string stored on the penalty record.
    pub fn reason(&self) -> String {
        let types: Vec<String> = self.abuse_types.iter().map(|t| t.to_string()).collect();
        format!("{} (confidence {:.2})", types.join(", "), self.confidence)
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

fn default_enabled() -> bool {
    true
}

fn default_flood_violation_count() -> usize {
    3
}

fn default_flood_window_secs() -> u64 {
    60
}

fn default_spam_rate_multiplier() -> f64 {
    2.0
}

fn default_payload_anomaly_factor() -> f64 {
    10.0
}

fn default_payload_anomaly_min_bytes() -> u64 {
    1_000
}

fn default_repeat_offender_violations() -> usize {
    10
}

fn default_repeat_window_secs() -> u64 {
    3_600
}

fn default_block_confidence() -> f64 {
    DEFAULT_BLOCK_CONFIDENCE
}

fn default_quarantine_confidence() -> f64 {
    DEFAULT_QUARANTINE_CONFIDENCE
}

/// Detection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbuseConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_flood_violation_count")]
    pub flood_violation_count: usize,
    #[serde(default = "default_flood_window_secs")]
    pub flood_window_secs: u64,
    #[serde(default = "default_spam_rate_multiplier")]
    pub spam_rate_multiplier: f64,
    #[serde(default = "default_payload_anomaly_factor")]
    pub payload_anomaly_factor: f64,
    /// Payloads below this size are never anomalous.
    #[serde(default = "default_payload_anomaly_min_bytes")]
    pub payload_anomaly_min_bytes: u64,
    #[serde(default = "default_repeat_offender_violations")]
    pub repeat_offender_violations: usize,
    #[serde(default = "default_repeat_window_secs")]
    pub repeat_window_secs: u64,
    #[serde(default = "default_block_confidence")]
    pub block_confidence: f64,
    #[serde(default = "default_quarantine_confidence")]
    pub quarantine_confidence: f64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            flood_violation_count: default_flood_violation_count(),
            flood_window_secs: default_flood_window_secs(),
            spam_rate_multiplier: default_spam_rate_multiplier(),
            payload_anomaly_factor: default_payload_anomaly_factor(),
            payload_anomaly_min_bytes: default_payload_anomaly_min_bytes(),
            repeat_offender_violations: default_repeat_offender_violations(),
            repeat_window_secs: default_repeat_window_secs(),
            block_confidence: default_block_confidence(),
            quarantine_confidence: default_quarantine_confidence(),
        }
    }
}

impl AbuseConfig {
    pub fn validate(&self) -> Result<()> {
        bail_if!(
            self.flood_violation_count == 0,
            Error::config_invalid_value("abuse.flood_violation_count", "must be at least 1")
        );
        bail_if!(
            self.repeat_offender_violations == 0,
            Error::config_invalid_value("abuse.repeat_offender_violations", "must be at least 1")
        );
        bail_if!(
            !(self.spam_rate_multiplier.is_finite() && self.spam_rate_multiplier > 0.0),
            Error::config_invalid_value("abuse.spam_rate_multiplier", "must be positive")
        );
        bail_if!(
            !(self.payload_anomaly_factor.is_finite() && self.payload_anomaly_factor > 1.0),
            Error::config_invalid_value("abuse.payload_anomaly_factor", "must be greater than 1")
        );
        bail_if!(
            !(0.0..=1.0).contains(&self.quarantine_confidence)
                || !(0.0..=1.0).contains(&self.block_confidence)
                || self.quarantine_confidence > self.block_confidence,
            Error::config_invalid_value(
                "abuse.block_confidence",
                "confidences must lie in [0, 1] with quarantine <= block",
            )
        );
        Ok(())
    }
}

// =============================================================================
// DETECTOR
// =============================================================================

/// What the detector sees about the request that was just denied.
#[derive(Debug, Clone, Copy)]
pub struct DenialContext<'a> {
    pub profile: &'a BehaviorProfile,
    pub tier_limits: TierLimits,
    pub payload_size: u64,
    /// Typical payload before this request was folded into the average.
    pub previous_typical_payload: f64,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct AbuseDetector {
    config: AbuseConfig,
}

impl AbuseDetector {
    pub fn new(config: AbuseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AbuseConfig {
        &self.config
    }

    /// Evaluate a denial. `None` means no pattern matched.
    pub fn evaluate(&self, ctx: &DenialContext<'_>) -> Option<AbuseDetectionResult> {
        if !self.config.enabled {
            return None;
        }
        let cfg = &self.config;
        let mut matched: Vec<(AbuseType, f64, String)> = Vec::new();

        let recent_violations = ctx.profile.violations_within(ctx.now, cfg.flood_window_secs);
        if recent_violations >= cfg.flood_violation_count {
            let confidence = if recent_violations >= cfg.flood_violation_count * 2 {
                SEVERE_FLOODING_CONFIDENCE
            } else {
                FLOODING_CONFIDENCE
            };
            matched.push((
                AbuseType::Flooding,
                confidence,
                format!(
                    "{recent_violations} violations within {}s",
                    cfg.flood_window_secs
                ),
            ));
        }

        let rate = ctx.profile.requests_in_window(ctx.now) as f64;
        let spam_threshold = f64::from(ctx.tier_limits.requests_per_minute) * cfg.spam_rate_multiplier;
        if rate > spam_threshold {
            matched.push((
                AbuseType::Spam,
                SPAM_CONFIDENCE,
                format!("{rate} requests in the last minute (threshold {spam_threshold})"),
            ));
        }

        let typical = ctx.previous_typical_payload;
        if ctx.payload_size >= cfg.payload_anomaly_min_bytes
            && typical > 0.0
            && ctx.payload_size as f64 > typical * cfg.payload_anomaly_factor
        {
            matched.push((
                AbuseType::PayloadAnomaly,
                PAYLOAD_ANOMALY_CONFIDENCE,
                format!("payload {} bytes vs typical {typical:.0}", ctx.payload_size),
            ));
        }

        let long_violations = ctx.profile.violations_within(ctx.now, cfg.repeat_window_secs);
        if long_violations >= cfg.repeat_offender_violations {
            matched.push((
                AbuseType::RepeatOffender,
                REPEAT_OFFENDER_CONFIDENCE,
                format!(
                    "{long_violations} violations within {}s",
                    cfg.repeat_window_secs
                ),
            ));
        }

        if matched.is_empty() {
            return None;
        }

        let confidence = matched.iter().map(|(_, c, _)| *c).fold(0.0, f64::max);
        let (recommended_action, penalty_level) = self.classify(confidence);
        Some(AbuseDetectionResult {
            abuse_types: matched.iter().map(|(t, _, _)| *t).collect(),
            confidence,
            recommended_action,
            penalty_level,
            evidence: matched.into_iter().map(|(_, _, e)| e).collect(),
        })
    }

    /// Map a confidence onto an action and penalty level.
    pub fn classify(&self, confidence: f64) -> (RecommendedAction, PenaltyLevel) {
        if confidence >= self.config.block_confidence {
            (RecommendedAction::Block, PenaltyLevel::ExtendedBlock)
        } else if confidence >= self.config.quarantine_confidence {
            (RecommendedAction::Quarantine, PenaltyLevel::TempBlock)
        } else {
            (RecommendedAction::Flag, PenaltyLevel::Throttle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateScope;
    use crate::tiers::TierTable;
    use chrono::Duration;

    fn free() -> TierLimits {
        TierTable::default().free
    }

    fn profile_with_violations(now: DateTime<Utc>, count: usize, spacing_secs: i64) -> BehaviorProfile {
        let mut profile = BehaviorProfile::new("u1", "w1", now - Duration::days(1));
        for i in 0..count {
            let at = now - Duration::seconds(spacing_secs * i as i64);
            profile.violations.push(crate::trust::ViolationRecord {
                at,
                scope: RateScope::User,
                cost: 1.0,
            });
        }
        profile
    }

    fn ctx(profile: &BehaviorProfile, now: DateTime<Utc>) -> DenialContext<'_> {
        DenialContext {
            profile,
            tier_limits: free(),
            payload_size: 0,
            previous_typical_payload: 0.0,
            now,
        }
    }

    #[test]
    fn test_no_pattern_no_result() {
        let now = Utc::now();
        let profile = profile_with_violations(now, 2, 1);
        assert!(AbuseDetector::default().evaluate(&ctx(&profile, now)).is_none());
    }

    #[test]
    fn test_three_violations_quarantine() {
        let now = Utc::now();
        let profile = profile_with_violations(now, 3, 5);
        let result = AbuseDetector::default().evaluate(&ctx(&profile, now)).unwrap();
        assert_eq!(result.abuse_types, vec![AbuseType::Flooding]);
        assert_eq!(result.confidence, 0.8);
        assert_eq!(result.recommended_action, RecommendedAction::Quarantine);
        assert_eq!(result.penalty_level, PenaltyLevel::TempBlock);
    }

    #[test]
    fn test_severe_flooding_blocks() {
        let now = Utc::now();
        let profile = profile_with_violations(now, 6, 1);
        let result = AbuseDetector::default().evaluate(&ctx(&profile, now)).unwrap();
        assert_eq!(result.recommended_action, RecommendedAction::Block);
        assert_eq!(result.penalty_level, PenaltyLevel::ExtendedBlock);
    }

    #[test]
    fn test_violations_outside_window_are_not_flooding() {
        let now = Utc::now();
        let profile = profile_with_violations(now, 3, 40);
        assert!(AbuseDetector::default().evaluate(&ctx(&profile, now)).is_none());
    }

    #[test]
    fn test_repeat_offender() {
        let now = Utc::now();
        let profile = profile_with_violations(now, 10, 300);
        let result = AbuseDetector::default().evaluate(&ctx(&profile, now)).unwrap();
        assert!(result.abuse_types.contains(&AbuseType::RepeatOffender));
        assert_eq!(result.recommended_action, RecommendedAction::Block);
    }

    #[test]
    fn test_spam_flags() {
        let now = Utc::now();
        let mut profile = BehaviorProfile::new("u1", "w1", now);
        for _ in 0..61 {
            profile.recent_requests.push_back(now);
        }
        let result = AbuseDetector::default().evaluate(&ctx(&profile, now)).unwrap();
        assert_eq!(result.abuse_types, vec![AbuseType::Spam]);
        assert_eq!(result.recommended_action, RecommendedAction::Flag);
        assert_eq!(result.penalty_level, PenaltyLevel::Throttle);
    }

    #[test]
    fn test_payload_anomaly() {
        let now = Utc::now();
        let profile = BehaviorProfile::new("u1", "w1", now);
        let mut c = ctx(&profile, now);
        c.payload_size = 50_000;
        c.previous_typical_payload = 200.0;
        let result = AbuseDetector::default().evaluate(&c).unwrap();
        assert_eq!(result.abuse_types, vec![AbuseType::PayloadAnomaly]);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_disabled_detector() {
        let now = Utc::now();
        let profile = profile_with_violations(now, 10, 1);
        let detector = AbuseDetector::new(AbuseConfig {
            enabled: false,
            ..AbuseConfig::default()
        });
        assert!(detector.evaluate(&ctx(&profile, now)).is_none());
    }

    #[test]
    fn test_config_validation() {
        assert!(AbuseConfig::default().validate().is_ok());
        let bad = AbuseConfig {
            quarantine_confidence: 0.95,
            block_confidence: 0.9,
            ..AbuseConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
