//! Refillable token bucket.
//!
//! A bucket holds up to `capacity` tokens and gains `refill_rate` tokens per
//! second. A request of cost `c` is admitted iff at least `c` tokens are
//! present. Buckets are plain serializable values; the rate limiter keeps
//! them in the state store and mutates them under compare-and-swap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_secs;
use crate::constants::{MAX_RETRY_AFTER_SECS, PAYLOAD_BYTES_PER_TOKEN};

/// Token cost of a request carrying `payload_size` bytes: `1 + size/1000`.
pub fn request_cost(payload_size: u64) -> f64 {
    1.0 + payload_size as f64 / PAYLOAD_BYTES_PER_TOKEN
}

/// Result of [`TokenBucket::try_consume`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BucketOutcome {
    /// Tokens were deducted.
    Admitted { remaining: f64 },
    /// Not enough tokens; nothing was deducted.
    Denied { retry_after_secs: f64, tokens: f64 },
}

impl BucketOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, BucketOutcome::Admitted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub key: String,
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(key: impl Into<String>, capacity: f64, refill_rate: f64, now: DateTime<Utc>) -> Self {
        let capacity = sanitize(capacity);
        Self {
            key: key.into(),
            tokens: capacity,
            capacity,
            refill_rate: sanitize(refill_rate),
            last_refill: now,
        }
    }

    /// Add the tokens accrued since `last_refill`.
    ///
    /// A clock that moved backwards adds nothing.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        if now <= self.last_refill {
            return;
        }
        let gained = elapsed_secs(self.last_refill, now) * self.refill_rate;
        self.tokens = (self.tokens + gained).min(self.capacity);
        self.last_refill = now;
    }

    /// Apply new limits, keeping `tokens <= capacity`.
    pub fn reconfigure(&mut self, capacity: f64, refill_rate: f64) {
        self.capacity = sanitize(capacity);
        self.refill_rate = sanitize(refill_rate);
        self.tokens = self.tokens.clamp(0.0, self.capacity);
    }

    /// Refill, then deduct `cost` if enough tokens are present.
    pub fn try_consume(&mut self, cost: f64, now: DateTime<Utc>) -> BucketOutcome {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            BucketOutcome::Admitted {
                remaining: self.tokens,
            }
        } else {
            BucketOutcome::Denied {
                retry_after_secs: self.retry_after(cost),
                tokens: self.tokens,
            }
        }
    }

    /// Give back tokens deducted for a request rejected at a later scope.
    pub fn refund(&mut self, cost: f64) {
        self.tokens = (self.tokens + cost.max(0.0)).min(self.capacity);
    }

    /// Seconds until `cost` tokens are available: `(cost - tokens) / refill_rate`.
    pub fn retry_after(&self, cost: f64) -> f64 {
        let missing = cost - self.tokens;
        if missing <= 0.0 {
            return 0.0;
        }
        if self.refill_rate <= 0.0 {
            return MAX_RETRY_AFTER_SECS;
        }
        (missing / self.refill_rate).min(MAX_RETRY_AFTER_SECS)
    }

    /// Token count as of `now`, without mutating.
    pub fn peek(&self, now: DateTime<Utc>) -> f64 {
        let mut copy = self.clone();
        copy.refill(now);
        copy.tokens
    }

    /// Seconds until the bucket is full again.
    pub fn reset_after(&self, now: DateTime<Utc>) -> f64 {
        let missing = self.capacity - self.peek(now);
        if missing <= 0.0 {
            0.0
        } else if self.refill_rate <= 0.0 {
            MAX_RETRY_AFTER_SECS
        } else {
            (missing / self.refill_rate).min(MAX_RETRY_AFTER_SECS)
        }
    }

    /// Untouched for at least `idle_secs`.
    pub fn is_idle(&self, now: DateTime<Utc>, idle_secs: u64) -> bool {
        elapsed_secs(self.last_refill, now) >= idle_secs as f64
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn test_request_cost() {
        assert_eq!(request_cost(0), 1.0);
        assert_eq!(request_cost(500), 1.5);
        assert_eq!(request_cost(4_000), 5.0);
    }

    #[test]
    fn test_ten_then_denied_then_refilled() {
        let t0 = Utc::now();
        let mut bucket = TokenBucket::new("user:w:u", 10.0, 1.0, t0);
        for _ in 0..10 {
            assert!(bucket.try_consume(1.0, t0).is_admitted());
        }
        match bucket.try_consume(1.0, t0) {
            BucketOutcome::Denied {
                retry_after_secs, ..
            } => assert!((retry_after_secs - 1.0).abs() < 1e-9),
            other => panic!("expected denial, got {other:?}"),
        }

        let t5 = t0 + Duration::seconds(5);
        for _ in 0..5 {
            assert!(bucket.try_consume(1.0, t5).is_admitted());
        }
        assert!(!bucket.try_consume(1.0, t5).is_admitted());
    }

    #[test]
    fn test_denial_deducts_nothing() {
        let t0 = Utc::now();
        let mut bucket = TokenBucket::new("ip:1.1.1.1", 2.0, 1.0, t0);
        assert!(!bucket.try_consume(3.0, t0).is_admitted());
        assert_eq!(bucket.tokens, 2.0);
    }

    #[test]
    fn test_clock_backwards_adds_nothing() {
        let t0 = Utc::now();
        let mut bucket = TokenBucket::new("global", 5.0, 1.0, t0);
        bucket.try_consume(5.0, t0);
        bucket.refill(t0 - Duration::seconds(60));
        assert_eq!(bucket.tokens, 0.0);
        assert_eq!(bucket.last_refill, t0);
    }

    #[test]
    fn test_zero_rate_retry_is_bounded() {
        let t0 = Utc::now();
        let mut bucket = TokenBucket::new("global", 1.0, 0.0, t0);
        bucket.try_consume(1.0, t0);
        assert_eq!(bucket.retry_after(1.0), MAX_RETRY_AFTER_SECS);
    }

    #[test]
    fn test_reconfigure_clamps_tokens() {
        let t0 = Utc::now();
        let mut bucket = TokenBucket::new("user:w:u", 10.0, 1.0, t0);
        bucket.reconfigure(4.0, 0.5);
        assert_eq!(bucket.tokens, 4.0);
        bucket.refund(100.0);
        assert_eq!(bucket.tokens, 4.0);
    }

    #[test]
    fn test_idle_detection() {
        let t0 = Utc::now();
        let bucket = TokenBucket::new("user:w:u", 10.0, 1.0, t0);
        assert!(!bucket.is_idle(t0 + Duration::seconds(59), 60));
        assert!(bucket.is_idle(t0 + Duration::seconds(60), 60));
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_capacity(
            capacity in 0.0f64..1_000.0,
            rate in 0.0f64..100.0,
            ops in proptest::collection::vec((0i64..10_000, 0u64..20_000, any::<bool>()), 1..64),
        ) {
            let t0 = Utc::now();
            let mut bucket = TokenBucket::new("k", capacity, rate, t0);
            let mut now = t0;
            for (advance_ms, payload, refund) in ops {
                now += Duration::milliseconds(advance_ms);
                let cost = request_cost(payload);
                if let BucketOutcome::Admitted { .. } = bucket.try_consume(cost, now) {
                    if refund {
                        bucket.refund(cost);
                    }
                }
                prop_assert!(bucket.tokens >= 0.0);
                prop_assert!(bucket.tokens <= bucket.capacity);
            }
        }
    }
}
