//! # Bulwark
//!
//! Resilience and traffic-shaping core for multi-tenant services.
//!
//! ## Overview
//!
//! Bulwark guards both directions of a service:
//!
//! - **Inbound**: every request passes an admission check across user,
//!   workspace, IP and global token buckets. Limits adapt to a per-caller
//!   trust score, and repeated denials feed an abuse detector that issues
//!   graduated penalties.
//! - **Outbound**: calls to downstream services run behind a per-service
//!   circuit breaker with retry and backoff.
//!
//! ## Architecture
//!
//! ```text
//!   request ---> ResilienceCore::check_admission
//!                     |
//!                     v
//! +---------------------------------------------+
//! |            MultiScopeRateLimiter            |
//! |  penalty -> user -> workspace -> ip -> glob |
//! +----------------------+----------------------+
//!                        | denial
//!                        v
//!      +-----------------+-----------------+
//!      | AbuseDetector  ->  PenaltyManager |
//!      +-----------------------------------+
//!
//!   ResilienceCore::execute ---> ConnectivityManager
//!                                    |
//!                       +------------+-----------+
//!                       | RetryPolicy | Breaker  |
//!                       +------------+-----------+
//!                                    |
//!                                Transport (HTTP)
//! ```
//!
//! All mutable state (buckets, behavior profiles, breaker states) lives in
//! a [`StateStore`] updated by compare-and-swap, so several instances can
//! share one store.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bulwark::{Config, ResilienceCore, ServiceRequest, SubscriptionTier};
//!
//! #[tokio::main]
//! async fn main() -> bulwark::Result<()> {
//!     bulwark::setup_logging(bulwark::should_use_json(), "info");
//!
//!     let core = ResilienceCore::builder().config(Config::load()?).build().await?;
//!     core.start().await;
//!
//!     core.check_admission("user-1", "ws-1", None, SubscriptionTier::Standard, 256)
//!         .await
//!         .into_result()?;
//!     let invoices = core.execute("billing", ServiceRequest::get("/invoices")).await?;
//!     println!("{}", invoices.text());
//!
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod abuse;
pub mod audit;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod constants;
pub mod error;
pub mod penalty;
pub mod rate_limiter;
pub mod resilience;
pub mod retry;
pub mod store;
pub mod sweeper;
pub mod tiers;
pub mod token_bucket;
pub mod tracing_setup;
pub mod trust;

// Re-exports for convenient access
pub use abuse::{AbuseConfig, AbuseDetectionResult, AbuseDetector, AbuseType, RecommendedAction};
pub use audit::{
    AuditDispatcher, AuditSink, ChannelAuditSink, TracingAuditSink, ViolationEvent, ViolationKind,
};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, CircuitState,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use connectivity::{
    ConnectivityManager, HttpMethod, HttpTransport, ServiceConfig, ServiceHealth, ServiceRequest,
    ServiceResponse, ServiceTimeouts, Transport,
};
pub use constants::*;
pub use error::{Error, Result};
pub use penalty::{PenaltyConfig, PenaltyGate, PenaltyLevel, PenaltyManager, PenaltyRecord};
pub use rate_limiter::{
    AdmissionDecision, CallerStatus, MultiScopeRateLimiter, RateLimitConfig, RateScope,
    ScopeUsage, UsageSnapshot, ViolationInfo,
};
pub use resilience::{FixedTierResolver, ResilienceCore, ResilienceCoreBuilder, TierResolver};
pub use retry::{BackoffStrategy, RetryPolicy, Scheduler, TokioScheduler};
pub use store::{MemoryStore, StateStore, Versioned};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig};
pub use tiers::{ScopeLimits, SubscriptionTier, TierLimits, TierTable};
pub use token_bucket::{BucketOutcome, TokenBucket};
pub use tracing_setup::{setup_logging, should_use_json};
pub use trust::{BehaviorProfile, ViolationRecord};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
