//! Subscription tiers and their rate-limit parameters.
//!
//! | Tier | Requests/min | Burst | Refill/sec |
//! |------|--------------|-------|------------|
//! | FREE | 30 | 10 | 0.5 |
//! | STANDARD | 60 | 20 | 1.0 |
//! | PREMIUM | 120 | 40 | 2.0 |
//! | ENTERPRISE | 300 | 100 | 5.0 |
//! | ADMIN | 1000 | 200 | 16.0 |
//!
//! `burst_size` is the bucket capacity and `refill_per_sec` its refill
//! rate. `requests_per_minute` is the nominal rate used by the abuse
//! detector's spam rule.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{bail_if, Error, Result};

/// Caller subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Standard,
    Premium,
    Enterprise,
    Admin,
}

impl SubscriptionTier {
    pub fn all() -> [SubscriptionTier; 5] {
        [
            SubscriptionTier::Free,
            SubscriptionTier::Standard,
            SubscriptionTier::Premium,
            SubscriptionTier::Enterprise,
            SubscriptionTier::Admin,
        ]
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionTier::Free => "FREE",
            SubscriptionTier::Standard => "STANDARD",
            SubscriptionTier::Premium => "PREMIUM",
            SubscriptionTier::Enterprise => "ENTERPRISE",
            SubscriptionTier::Admin => "ADMIN",
        };
        f.write_str(s)
    }
}

impl FromStr for SubscriptionTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(SubscriptionTier::Free),
            "standard" | "basic" => Ok(SubscriptionTier::Standard),
            "premium" | "pro" => Ok(SubscriptionTier::Premium),
            "enterprise" => Ok(SubscriptionTier::Enterprise),
            "admin" => Ok(SubscriptionTier::Admin),
            other => Err(Error::config_invalid_value(
                "tier",
                format!("unknown subscription tier '{other}'"),
            )),
        }
    }
}

/// Per-user limits for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierLimits {
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub refill_per_sec: f64,
}

impl TierLimits {
    pub const fn new(requests_per_minute: u32, burst_size: u32, refill_per_sec: f64) -> Self {
        Self {
            requests_per_minute,
            burst_size,
            refill_per_sec,
        }
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> f64 {
        f64::from(self.burst_size)
    }

    fn validate(&self, key: &str) -> Result<()> {
        bail_if!(
            self.burst_size == 0,
            Error::config_invalid_value(format!("{key}.burst_size"), "must be positive")
        );
        bail_if!(
            self.requests_per_minute == 0,
            Error::config_invalid_value(format!("{key}.requests_per_minute"), "must be positive")
        );
        bail_if!(
            !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0,
            Error::config_invalid_value(format!("{key}.refill_per_sec"), "must be positive")
        );
        Ok(())
    }
}

/// Limits for a scope not derived from a tier (IP, global).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeLimits {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl ScopeLimits {
    pub const fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Default per-IP limits.
    pub const fn ip_default() -> Self {
        Self::new(60.0, 1.0)
    }

    /// Default system-wide limits.
    pub const fn global_default() -> Self {
        Self::new(10_000.0, 500.0)
    }

    pub fn validate(&self, key: &str) -> Result<()> {
        bail_if!(
            !self.capacity.is_finite() || self.capacity <= 0.0,
            Error::config_invalid_value(format!("{key}.capacity"), "must be positive")
        );
        bail_if!(
            !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0,
            Error::config_invalid_value(format!("{key}.refill_per_sec"), "must be positive")
        );
        Ok(())
    }
}

fn default_free() -> TierLimits {
    TierLimits::new(30, 10, 0.5)
}

fn default_standard() -> TierLimits {
    TierLimits::new(60, 20, 1.0)
}

fn default_premium() -> TierLimits {
    TierLimits::new(120, 40, 2.0)
}

fn default_enterprise() -> TierLimits {
    TierLimits::new(300, 100, 5.0)
}

fn default_admin() -> TierLimits {
    TierLimits::new(1000, 200, 16.0)
}

/// One entry per tier; no tier can be missing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierTable {
    #[serde(default = "default_free")]
    pub free: TierLimits,
    #[serde(default = "default_standard")]
    pub standard: TierLimits,
    #[serde(default = "default_premium")]
    pub premium: TierLimits,
    #[serde(default = "default_enterprise")]
    pub enterprise: TierLimits,
    #[serde(default = "default_admin")]
    pub admin: TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: default_free(),
            standard: default_standard(),
            premium: default_premium(),
            enterprise: default_enterprise(),
            admin: default_admin(),
        }
    }
}

impl TierTable {
    pub fn limits(&self, tier: SubscriptionTier) -> TierLimits {
        match tier {
            SubscriptionTier::Free => self.free,
            SubscriptionTier::Standard => self.standard,
            SubscriptionTier::Premium => self.premium,
            SubscriptionTier::Enterprise => self.enterprise,
            SubscriptionTier::Admin => self.admin,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for tier in SubscriptionTier::all() {
            let key = format!("rate_limits.tiers.{}", tier.to_string().to_lowercase());
            self.limits(tier).validate(&key)?;
        }
        Ok(())
    }
}
