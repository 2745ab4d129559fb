//! Radar module - token tier classification and progression tracking.
//!
//! Raw feed payloads flow through the normalizer and aggregator into the
//! progression tracker. The refresh scheduler owns the tracker and publishes
//! immutable dashboard snapshots after every cycle.

pub mod types;
pub mod normalizer;
pub mod aggregator;
pub mod classifier;
pub mod progression;
pub mod storage;
pub mod circuit_breaker;
pub mod retry;
pub mod data_sources;
pub mod push_feed;
pub mod synthetic;
pub mod scheduler;

// Re-export the main entry points
pub use scheduler::{RadarHandle, RefreshScheduler, SchedulerCommand};
pub use types::{
    CycleError, CycleReport, DashboardSnapshot, FeedStatus, ProgressionRules, PushConfig, RadarConfig,
    RadarMetrics, SchedulerConfig, SourceConfig, TierRules,
};

pub use aggregator::{aggregate_outcomes, merge_records, SourceOutcome};
pub use classifier::{classify, TierClassifier};
pub use data_sources::{RestSource, TokenSource};
pub use normalizer::{normalize, NormalizeContext, RawSourcePayload};
pub use progression::ProgressionTracker;
pub use push_feed::{PushFeed, PushFeedExit};
pub use storage::{ProgressionStore, SqliteProgressionStore};

use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// Radar builder for convenient construction with sensible defaults.
pub struct RadarBuilder {
    config: RadarConfig,
}

impl RadarBuilder {
    pub fn new() -> Self {
        Self {
            config: RadarConfig::default(),
        }
    }

    /// Start from an existing configuration, e.g. one loaded from a file.
    pub fn from_config(config: RadarConfig) -> Self {
        Self { config }
    }

    pub fn with_tier_rules(mut self, rules: TierRules) -> Self {
        self.config.tiers = rules;
        self
    }

    pub fn with_progression_rules(mut self, rules: ProgressionRules) -> Self {
        self.config.progression = rules;
        self
    }

    /// Replace the polled REST sources.
    pub fn with_sources(mut self, sources: Vec<SourceConfig>) -> Self {
        self.config.sources = sources;
        self
    }

    /// Set the push endpoints, tried in order.
    pub fn with_push_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.config.push.endpoints = endpoints;
        self
    }

    pub fn with_refresh_interval(mut self, seconds: u64) -> Self {
        self.config.scheduler.refresh_interval_secs = seconds;
        self
    }

    pub fn with_fetch_timeout(mut self, seconds: u64) -> Self {
        self.config.scheduler.fetch_timeout_secs = seconds;
        self
    }

    pub fn with_roster_capacity(mut self, capacity: usize) -> Self {
        self.config.progression.roster_capacity = capacity;
        self
    }

    /// SOL/USD rate used for SOL-denominated market caps.
    pub fn with_sol_usd_price(mut self, price: f64) -> Self {
        self.config.scheduler.sol_usd_price = Some(price);
        self
    }

    /// Publish labeled placeholder data when all sources fail.
    pub fn with_synthetic_fallback(mut self, enabled: bool) -> Self {
        self.config.scheduler.synthetic_fallback = enabled;
        self
    }

    pub fn with_circuit_breaker(mut self, failure_threshold: u32, cooldown_seconds: u64) -> Self {
        self.config.scheduler.circuit_breaker_failure_threshold = failure_threshold;
        self.config.scheduler.circuit_breaker_cooldown_seconds = cooldown_seconds;
        self
    }

    pub fn with_store_path(mut self, path: impl Into<String>) -> Self {
        self.config.store_path = path.into();
        self
    }

    pub fn build_config(self) -> RadarConfig {
        self.config
    }

    /// Build a scheduler polling the configured REST sources and persisting
    /// to the configured SQLite file.
    pub async fn build(self) -> Result<(RefreshScheduler, RadarHandle)> {
        let store = SqliteProgressionStore::new(&self.config.store_path).await?;
        let sources = rest_sources(&self.config)?;
        Ok(RefreshScheduler::new(self.config, sources, store).await)
    }

    /// Build a scheduler with caller-supplied sources and store.
    pub async fn build_with(
        self,
        sources: Vec<Arc<dyn TokenSource>>,
        store: Arc<dyn ProgressionStore>,
    ) -> (RefreshScheduler, RadarHandle) {
        RefreshScheduler::new(self.config, sources, store).await
    }
}

impl Default for RadarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One [`RestSource`] per configured source, sharing an HTTP client.
pub fn rest_sources(config: &RadarConfig) -> Result<Vec<Arc<dyn TokenSource>>> {
    let scheduler = &config.scheduler;
    let http_client = Client::builder()
        .user_agent(concat!("tier-radar/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    Ok(config
        .sources
        .iter()
        .map(|source| {
            Arc::new(RestSource::new(
                source.clone(),
                http_client.clone(),
                scheduler.rate_limit_requests_per_second,
                Duration::from_secs(scheduler.fetch_timeout_secs),
                scheduler.fetch_retry_attempts,
            )) as Arc<dyn TokenSource>
        })
        .collect())
}
