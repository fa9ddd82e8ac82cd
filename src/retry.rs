//! Retry policy and backoff scheduling for Bulwark.
//!
//! A [`RetryPolicy`] decides how many times a protected call is attempted
//! and how long to wait between attempts. The wait itself goes through a
//! [`Scheduler`], so backoff sleeps can be cancelled and tests can observe
//! the requested delays without sleeping.
//!
//! # Backoff Strategies
//!
//! | Strategy | Delay before retry `n` (0-based) |
//! |----------|----------------------------------|
//! | `fixed` | `base_delay` |
//! | `linear` | `base_delay * (n + 1)` |
//! | `exponential` | `base_delay * multiplier^n` |
//!
//! Every delay is capped at `max_delay`. With jitter enabled the capped
//! delay is scaled by a uniform random factor in `[0.5, 1.0]`.
//!
//! # Example
//!
//! ```rust,ignore
//! use bulwark::retry::{BackoffStrategy, RetryPolicy};
//!
//! let policy = RetryPolicy::default().with_strategy(BackoffStrategy::Linear);
//! assert_eq!(policy.next_delay(2).as_millis(), 300);
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::constants::DEFAULT_MAX_ATTEMPTS;
use crate::{bail_if, Error, Result};

// =============================================================================
// BACKOFF STRATEGY
// =============================================================================

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay.
    Fixed,
    /// Delay grows by `base_delay` each attempt.
    Linear,
    /// Delay is multiplied by `multiplier` each attempt.
    #[default]
    Exponential,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffStrategy::Fixed => write!(f, "fixed"),
            BackoffStrategy::Linear => write!(f, "linear"),
            BackoffStrategy::Exponential => write!(f, "exponential"),
        }
    }
}

impl FromStr for BackoffStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fixed" | "constant" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" | "exp" => Ok(BackoffStrategy::Exponential),
            other => Err(Error::config_invalid_value(
                "retry.strategy",
                format!("unknown backoff strategy '{other}'"),
            )),
        }
    }
}

// =============================================================================
// RETRY POLICY
// =============================================================================

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// Retry behavior for one downstream service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total tries, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay growth strategy.
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on any single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Scale delays by a random factor in `[0.5, 1.0]`.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff strategy.
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set base and maximum delay.
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Base delay as a [`Duration`].
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum delay as a [`Duration`].
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay to wait after the failed attempt `attempt` (0-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64;
        let max = self.max_delay_ms as f64;

        let raw = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * (f64::from(attempt) + 1.0),
            BackoffStrategy::Exponential => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                base * self.multiplier.powi(exponent)
            }
        };

        let capped = if raw.is_finite() { raw.min(max) } else { max };

        let millis = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(millis.max(0.0) / 1000.0)
    }

    /// Reject policies that cannot make progress.
    pub fn validate(&self, service: &str) -> Result<()> {
        bail_if!(
            self.max_attempts == 0,
            Error::config_invalid_value(
                format!("services.{service}.retry.max_attempts"),
                "must be at least 1",
            )
        );
        bail_if!(
            !self.multiplier.is_finite() || self.multiplier < 1.0,
            Error::config_invalid_value(
                format!("services.{service}.retry.multiplier"),
                "must be a finite number >= 1.0",
            )
        );
        bail_if!(
            self.base_delay_ms > self.max_delay_ms,
            Error::config_invalid_value(
                format!("services.{service}.retry.base_delay_ms"),
                "must not exceed max_delay_ms",
            )
        );
        Ok(())
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Performs backoff sleeps.
#[async_trait]
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Sleep for `duration` unless `cancel` fires first.
    ///
    /// Returns `true` when the full duration elapsed and `false` when the
    /// sleep was cancelled.
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

/// Scheduler backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
