//! Background eviction of idle buckets and profiles.
//!
//! Entries are removed with [`StateStore::remove_if_version`], so a bucket
//! or profile touched between the staleness check and the removal survives.
//! Profiles carrying an active penalty are never evicted.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_secs, SharedClock};
use crate::constants::{DEFAULT_BUCKET_IDLE_SECS, DEFAULT_PROFILE_IDLE_SECS};
use crate::store::StateStore;
use crate::token_bucket::TokenBucket;
use crate::trust::BehaviorProfile;
use crate::{bail_if, Error, Result};

fn default_interval_secs() -> u64 {
    300
}

fn default_bucket_idle_secs() -> u64 {
    DEFAULT_BUCKET_IDLE_SECS
}

fn default_profile_idle_secs() -> u64 {
    DEFAULT_PROFILE_IDLE_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_bucket_idle_secs")]
    pub bucket_idle_secs: u64,
    #[serde(default = "default_profile_idle_secs")]
    pub profile_idle_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            bucket_idle_secs: default_bucket_idle_secs(),
            profile_idle_secs: default_profile_idle_secs(),
        }
    }
}

impl SweeperConfig {
    pub fn validate(&self) -> Result<()> {
        bail_if!(
            self.interval_secs == 0,
            Error::config_invalid_value("sweeper.interval_secs", "must be positive")
        );
        Ok(())
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub buckets_removed: usize,
    pub profiles_removed: usize,
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    buckets: Arc<dyn StateStore<TokenBucket>>,
    profiles: Arc<dyn StateStore<BehaviorProfile>>,
    clock: SharedClock,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(
        buckets: Arc<dyn StateStore<TokenBucket>>,
        profiles: Arc<dyn StateStore<BehaviorProfile>>,
        clock: SharedClock,
        config: SweeperConfig,
    ) -> Self {
        Self {
            buckets,
            profiles,
            clock,
            config,
        }
    }

    /// Run one eviction pass.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for key in self.buckets.keys().await? {
            let Some(entry) = self.buckets.get(&key).await? else {
                continue;
            };
            if entry.value.is_idle(now, self.config.bucket_idle_secs)
                && self.buckets.remove_if_version(&key, entry.version).await?
            {
                report.buckets_removed += 1;
            }
        }

        let idle = self.config.profile_idle_secs as f64;
        for key in self.profiles.keys().await? {
            let Some(entry) = self.profiles.get(&key).await? else {
                continue;
            };
            let profile = &entry.value;
            if profile.active_penalty(now).is_some() {
                continue;
            }
            if elapsed_secs(profile.last_activity, now) >= idle
                && self.profiles.remove_if_version(&key, entry.version).await?
            {
                report.profiles_removed += 1;
            }
        }

        debug!(
            buckets_removed = report.buckets_removed,
            profiles_removed = report.profiles_removed,
            "sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `interval_secs` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            info!(interval_secs = self.config.interval_secs, "sweeper started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            warn!("sweep failed: {}", e);
                        }
                    }
                }
            }
            info!("sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::penalty::{PenaltyLevel, PenaltyRecord};
    use crate::store::MemoryStore;
    use crate::trust::profile_key;

    struct Fixture {
        sweeper: Sweeper,
        buckets: Arc<MemoryStore<TokenBucket>>,
        profiles: Arc<MemoryStore<BehaviorProfile>>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let buckets = Arc::new(MemoryStore::new());
        let profiles = Arc::new(MemoryStore::new());
        let sweeper = Sweeper::new(
            buckets.clone(),
            profiles.clone(),
            clock.clone(),
            SweeperConfig {
                interval_secs: 1,
                bucket_idle_secs: 60,
                profile_idle_secs: 600,
            },
        );
        Fixture {
            sweeper,
            buckets,
            profiles,
            clock,
        }
    }

    #[tokio::test]
    async fn test_idle_bucket_removed_fresh_kept() {
        let f = fixture();
        let t0 = f.clock.now();
        f.buckets
            .set("user:w:old", TokenBucket::new("user:w:old", 5.0, 1.0, t0))
            .await
            .unwrap();
        f.clock.advance_secs(90);
        let now = f.clock.now();
        f.buckets
            .set("user:w:new", TokenBucket::new("user:w:new", 5.0, 1.0, now))
            .await
            .unwrap();

        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.buckets_removed, 1);
        assert!(f.buckets.get("user:w:old").await.unwrap().is_none());
        assert!(f.buckets.get("user:w:new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_penalized_profile_survives() {
        let f = fixture();
        let t0 = f.clock.now();
        let mut penalized = BehaviorProfile::new("bad", "w", t0);
        penalized.current_penalty = Some(PenaltyRecord {
            level: PenaltyLevel::PermanentBan,
            reason: "fraud".into(),
            applied_at: t0,
            until: None,
        });
        f.profiles.set(&profile_key("w", "bad"), penalized).await.unwrap();
        f.profiles
            .set(&profile_key("w", "quiet"), BehaviorProfile::new("quiet", "w", t0))
            .await
            .unwrap();

        f.clock.advance_secs(3_600);
        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.profiles_removed, 1);
        assert!(f.profiles.get(&profile_key("w", "bad")).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_stops_on_cancel() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let handle = f.sweeper.clone().spawn(cancel.clone());
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
