//! Centralized constants for Bulwark.
//!
//! This module provides a single source of truth for the default values and
//! fixed coefficients used throughout the crate.

// ============================================================================
// Rate Limiting
// ============================================================================

/// Payload bytes that add one extra token to a request's cost.
pub const PAYLOAD_BYTES_PER_TOKEN: f64 = 1000.0;

/// Workspace buckets are this multiple of the caller's per-user limits.
pub const DEFAULT_WORKSPACE_MULTIPLIER: f64 = 10.0;

/// Lower bound on the trust adaptation factor applied to user limits.
pub const DEFAULT_MIN_TRUST_FACTOR: f64 = 0.5;

/// How long rate-limit violations stay in a behavior profile.
pub const DEFAULT_VIOLATION_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Key of the single system-wide bucket.
pub const GLOBAL_BUCKET_KEY: &str = "global";

// ============================================================================
// Trust Score
// ============================================================================

/// Account age at which the age factor of the trust score saturates.
pub const TRUST_FULL_AGE_DAYS: f64 = 30.0;

/// Trust deducted per retained violation.
pub const TRUST_PENALTY_PER_VIOLATION: f64 = 0.1;

/// Trust at or above which limits are expanded rather than shrunk.
pub const TRUST_EXPANSION_THRESHOLD: f64 = 0.5;

/// Maximum expansion bonus for fully trusted callers.
pub const TRUST_EXPANSION_BONUS: f64 = 0.5;

/// Pseudo-count prior used when smoothing the legitimacy ratio.
pub const LEGITIMACY_PRIOR: f64 = 8.0;

/// Window over which per-minute request rates are measured.
pub const RATE_WINDOW_SECS: i64 = 60;

/// Cap on remembered request timestamps per profile.
pub const MAX_RECENT_REQUESTS: usize = 10_000;

/// Smoothing factor for the rate and payload moving averages.
pub const EMA_ALPHA: f64 = 0.1;

// ============================================================================
// Abuse Detection & Penalties
// ============================================================================

/// Confidence at or above which abuse is blocked outright.
pub const DEFAULT_BLOCK_CONFIDENCE: f64 = 0.9;

/// Confidence at or above which abuse is quarantined.
pub const DEFAULT_QUARANTINE_CONFIDENCE: f64 = 0.7;

/// THROTTLE penalty duration.
pub const DEFAULT_THROTTLE_MINUTES: u64 = 5;

/// TEMP_BLOCK penalty duration.
pub const DEFAULT_TEMP_BLOCK_MINUTES: u64 = 30;

/// EXTENDED_BLOCK penalty duration.
pub const DEFAULT_EXTENDED_BLOCK_MINUTES: u64 = 240;

/// Upper bound accepted for any penalty duration (one year).
pub const MAX_PENALTY_MINUTES: u64 = 365 * 24 * 60;

// ============================================================================
// Connectivity
// ============================================================================

/// Default connect timeout for downstream services.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Default per-attempt request timeout for downstream services.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default maximum attempts per protected call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default consecutive failures before a breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open breaker waits before probing.
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Store & Sweeper
// ============================================================================

/// Compare-and-swap attempts before giving up on a contended key.
pub const DEFAULT_CAS_ATTEMPTS: u32 = 64;

/// Idle time after which a token bucket is reclaimed.
pub const DEFAULT_BUCKET_IDLE_SECS: u64 = 60 * 60;

/// Idle time after which a behavior profile is reclaimed.
pub const DEFAULT_PROFILE_IDLE_SECS: u64 = 7 * 24 * 60 * 60;

/// Upper bound on any computed retry hint.
pub const MAX_RETRY_AFTER_SECS: f64 = 365.0 * 24.0 * 60.0 * 60.0;
