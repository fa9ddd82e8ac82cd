//! Error types for Bulwark.
//!
//! This module provides the crate-wide error taxonomy with:
//! - Error codes for programmatic handling (B001-B099)
//! - HTTP status mapping for the conventional 429/503 responses
//! - Client-safe messages that never leak internal state
//! - Structured error types using thiserror
//!
//! # Error Code Ranges
//!
//! | Range | Category |
//! |-------|----------|
//! | B001-B009 | Configuration errors |
//! | B010-B019 | State store errors |
//! | B020-B029 | Rate limiting and penalty denials |
//! | B030-B039 | Circuit breaker and connectivity errors |
//! | B040-B049 | Penalty administration errors |
//! | B070-B079 | I/O errors |
//! | B080-B089 | Serialization errors |
//! | B090-B099 | Internal errors |
//!
//! Admission denials are normally returned as typed
//! [`AdmissionDecision`](crate::rate_limiter::AdmissionDecision) values.
//! [`Error::RateLimited`] and [`Error::PenaltyActive`] exist for callers that
//! prefer to propagate a denial with `?`.
//!
//! ## Macros
//!
//! The [`bail_if!`] macro provides early return on condition:
//!
//! ```ignore
//! use bulwark::error::{bail_if, Error};
//!
//! fn validate_rate(rate: f64) -> bulwark::Result<()> {
//!     bail_if!(rate <= 0.0, Error::config_invalid_value("refill_per_sec", "must be positive"));
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::penalty::PenaltyLevel;
use crate::rate_limiter::RateScope;

// =============================================================================
// BAIL_IF MACRO
// =============================================================================

/// Early return if condition is true.
///
/// # Examples
///
/// ```ignore
/// use bulwark::error::{bail_if, Error, Result};
///
/// fn check(attempts: u32) -> Result<()> {
///     bail_if!(attempts == 0, Error::config_invalid_value("max_attempts", "must be at least 1"));
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! bail_if {
    ($cond:expr, $err:expr) => {
        if $cond {
            return Err($err);
        }
    };
}

// Re-export for convenience
pub use bail_if;

// =============================================================================
// ERROR TYPE
// =============================================================================

/// The main error type for Bulwark.
///
/// Each variant includes an error code prefix for easy identification.
/// Use [`Error::http_status`] to map an error onto a response and
/// [`Error::client_message`] for the text that may be shown to a caller.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // CONFIGURATION ERRORS (B001-B009)
    // =========================================================================
    /// Configuration file not found.
    #[error("[B001] Configuration file not found: {path}")]
    ConfigFileNotFound {
        path: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file has invalid format.
    #[error("[B002] Invalid configuration format in {path}: {details}")]
    ConfigInvalidFormat { path: String, details: String },

    /// Configuration value is invalid.
    #[error("[B003] Invalid configuration value for '{key}': {details}")]
    ConfigInvalidValue { key: String, details: String },

    /// Outbound call to a service that was never registered.
    #[error("[B004] Service not registered: {service}")]
    ServiceNotRegistered { service: String },

    /// A service id was registered twice.
    #[error("[B005] Service already registered: {service}")]
    ServiceAlreadyRegistered { service: String },

    // =========================================================================
    // STATE STORE ERRORS (B010-B019)
    // =========================================================================
    /// Compare-and-swap kept losing against concurrent writers.
    #[error("[B011] Contention on key '{key}' after {attempts} compare-and-swap attempts")]
    StoreContention { key: String, attempts: u32 },

    // =========================================================================
    // RATE LIMITING ERRORS (B020-B029)
    // =========================================================================
    /// A token bucket denied the request.
    #[error(
        "[B020] Rate limit exceeded at {scope} scope (limit {limit}, remaining {remaining}), \
         retry after {retry_after_secs:.1}s"
    )]
    RateLimited {
        scope: RateScope,
        limit: u32,
        remaining: u32,
        reset_secs: u64,
        retry_after_secs: f64,
    },

    /// An active penalty gates the caller.
    #[error("[B021] Access suspended by {level} penalty: {reason}")]
    PenaltyActive {
        level: PenaltyLevel,
        reason: String,
        retry_after_secs: Option<f64>,
    },

    // =========================================================================
    // CIRCUIT BREAKER / CONNECTIVITY ERRORS (B030-B039)
    // =========================================================================
    /// The breaker for the service is open; no call was attempted.
    #[error("[B030] Circuit open for service '{service}' after {failure_count} failures")]
    CircuitOpen {
        service: String,
        failure_count: u32,
        next_attempt_time: Option<DateTime<Utc>>,
        /// Whole seconds until the next probe, fixed when the call was rejected.
        retry_after_secs: Option<u64>,
    },

    /// All attempts against the service failed.
    #[error("[B031] Service '{service}' unreachable after {attempts} attempts: {last_error}")]
    Connectivity {
        service: String,
        attempts: u32,
        last_error: String,
    },

    /// A caller-supplied deadline elapsed.
    #[error("[B032] Request to '{service}' timed out after {timeout_ms}ms")]
    Timeout { service: String, timeout_ms: u64 },

    /// The operation was cancelled by the caller.
    #[error("[B033] Operation cancelled")]
    Cancelled,

    /// HTTP client error.
    #[error("[B034] HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // PENALTY ERRORS (B040-B049)
    // =========================================================================
    /// A weaker penalty cannot replace an active stronger one.
    #[error("[B040] A {active} penalty is active; {requested} would weaken it")]
    PenaltyDowngrade {
        active: PenaltyLevel,
        requested: PenaltyLevel,
    },

    // =========================================================================
    // I/O ERRORS (B070-B079)
    // =========================================================================
    /// General I/O error.
    #[error("[B070] I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // SERIALIZATION ERRORS (B080-B089)
    // =========================================================================
    /// JSON serialization/deserialization error.
    #[error("[B080] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error.
    #[error("[B081] YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // INTERNAL ERRORS (B090-B099)
    // =========================================================================
    /// An unexpected internal error occurred.
    #[error("[B090] Internal error: {message}")]
    Internal { message: String },
}

// =============================================================================
// CONSTRUCTOR METHODS
// =============================================================================

impl Error {
    /// Create a config file not found error.
    pub fn config_file_not_found(path: impl Into<String>) -> Self {
        Self::ConfigFileNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config file not found error with source.
    pub fn config_file_not_found_with_source(
        path: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::ConfigFileNotFound {
            path: path.into(),
            source: Some(source),
        }
    }

    /// Create an invalid config format error.
    pub fn config_invalid_format(path: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ConfigInvalidFormat {
            path: path.into(),
            details: details.into(),
        }
    }

    /// Create an invalid config value error.
    pub fn config_invalid_value(key: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ConfigInvalidValue {
            key: key.into(),
            details: details.into(),
        }
    }

    /// Create a service not registered error.
    pub fn service_not_registered(service: impl Into<String>) -> Self {
        Self::ServiceNotRegistered {
            service: service.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

// =============================================================================
// ERROR METADATA
// =============================================================================

impl Error {
    /// Get the error code (e.g., "B020").
    pub fn code(&self) -> &'static str {
        match self {
            // Configuration
            Self::ConfigFileNotFound { .. } => "B001",
            Self::ConfigInvalidFormat { .. } => "B002",
            Self::ConfigInvalidValue { .. } => "B003",
            Self::ServiceNotRegistered { .. } => "B004",
            Self::ServiceAlreadyRegistered { .. } => "B005",

            // Store
            Self::StoreContention { .. } => "B011",

            // Rate limiting
            Self::RateLimited { .. } => "B020",
            Self::PenaltyActive { .. } => "B021",

            // Circuit / connectivity
            Self::CircuitOpen { .. } => "B030",
            Self::Connectivity { .. } => "B031",
            Self::Timeout { .. } => "B032",
            Self::Cancelled => "B033",
            Self::Http(_) => "B034",

            // Penalty
            Self::PenaltyDowngrade { .. } => "B040",

            // I/O and serialization
            Self::Io(_) => "B070",
            Self::Json(_) => "B080",
            Self::Yaml(_) => "B081",

            // Internal
            Self::Internal { .. } => "B090",
        }
    }

    /// Get a suggestion for how to resolve the error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ConfigFileNotFound { .. } => {
                Some("Create the configuration file or pass an explicit path")
            }
            Self::ConfigInvalidFormat { .. } => Some("Check the YAML syntax of the configuration"),
            Self::ConfigInvalidValue { .. } => {
                Some("Check the value against the documented range for this key")
            }
            Self::ServiceNotRegistered { .. } => {
                Some("Register the service (config `services:` list) before calling it")
            }
            Self::ServiceAlreadyRegistered { .. } => Some("Service ids must be unique"),
            Self::StoreContention { .. } => {
                Some("Check the health of the backing state store")
            }
            Self::RateLimited { .. } => Some("Wait for the Retry-After interval, then retry"),
            Self::PenaltyActive { .. } => {
                Some("Wait for the penalty to expire or contact an administrator")
            }
            Self::CircuitOpen { .. } => {
                Some("The downstream service is failing; retry after the recovery timeout")
            }
            Self::Connectivity { .. } | Self::Http(_) => {
                Some("Check that the downstream service is reachable")
            }
            Self::Timeout { .. } => Some("Increase the deadline or check downstream latency"),
            Self::Cancelled => None,
            Self::PenaltyDowngrade { .. } => {
                Some("Clear the active penalty first if a weaker one is intended")
            }
            Self::Io(_) => Some("Check file permissions and disk space"),
            Self::Json(_) => Some("Check the JSON syntax for errors"),
            Self::Yaml(_) => Some("Check the YAML syntax for errors"),
            Self::Internal { .. } => Some("This is an internal error; please report it"),
        }
    }

    /// The conventional HTTP status for this error.
    ///
    /// Rate and penalty denials map to 429, an open circuit to 503.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RateLimited { .. } | Self::PenaltyActive { .. } => 429,
            Self::CircuitOpen { .. } => 503,
            Self::Connectivity { .. } | Self::Http(_) => 502,
            Self::Timeout { .. } => 504,
            Self::ServiceNotRegistered { .. } => 404,
            Self::PenaltyDowngrade { .. } => 409,
            Self::Cancelled => 499,
            _ => 500,
        }
    }

    /// Seconds a caller should wait before retrying, rounded up.
    ///
    /// Used for the `Retry-After` header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(retry_after_secs.max(0.0).ceil() as u64),
            Self::PenaltyActive {
                retry_after_secs, ..
            } => retry_after_secs.map(|s| s.max(0.0).ceil() as u64),
            Self::CircuitOpen {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    /// A message that is safe to return to an external caller.
    pub fn client_message(&self) -> String {
        match self {
            Self::RateLimited { scope, .. } => format!("rate limit exceeded ({scope})"),
            Self::PenaltyActive { level, .. } => format!("access suspended ({level})"),
            Self::CircuitOpen { .. } | Self::Connectivity { .. } | Self::Http(_) => {
                "service temporarily unavailable".to_string()
            }
            Self::Timeout { .. } => "upstream timeout".to_string(),
            _ => "internal error".to_string(),
        }
    }

    /// Check if this error is recoverable (can be retried later).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::CircuitOpen { .. }
                | Self::Connectivity { .. }
                | Self::Timeout { .. }
                | Self::Http(_)
                | Self::StoreContention { .. }
        ) || matches!(
            self,
            Self::PenaltyActive {
                retry_after_secs: Some(_),
                ..
            }
        )
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================

/// A Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// TESTS
// =============================================================================
