//! Configuration, cycle reports and dashboard snapshot types.

use crate::types::{AdmissionKind, ProgressionState, RemovalReason, Tier, TokenRecord, TrackedToken};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::circuit_breaker::SourceHealth;

/// Market cap, age and engagement boundaries for tier admission.
///
/// Strict bounds decide classification. Relaxed bounds only apply when a tier
/// is under capacity and its strict candidates are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierRules {
    /// Exclusive lower bound
    pub highest_gainer_min_market_cap: f64,
    /// Exclusive lower bound used for backfill
    pub highest_gainer_relaxed_min_market_cap: f64,
    pub highest_gainer_max_age_hours: f64,
    /// Exclusive lower bound
    pub highest_gainer_min_engagement: u64,

    /// Inclusive lower bound
    pub fastest_runner_min_market_cap: f64,
    pub fastest_runner_relaxed_min_market_cap: f64,
    /// Inclusive upper bound
    pub fastest_runner_max_market_cap: f64,
    pub fastest_runner_max_age_hours: f64,
    /// Exclusive lower bound
    pub fastest_runner_min_engagement: u64,

    /// Exclusive upper bound
    pub gamble_box_max_market_cap: f64,
    pub gamble_box_relaxed_max_market_cap: f64,
    pub gamble_box_max_age_hours: f64,
}

impl Default for TierRules {
    fn default() -> Self {
        Self {
            highest_gainer_min_market_cap: 50_000.0,
            highest_gainer_relaxed_min_market_cap: 30_000.0,
            highest_gainer_max_age_hours: 48.0,
            highest_gainer_min_engagement: 30,
            fastest_runner_min_market_cap: 5_000.0,
            fastest_runner_relaxed_min_market_cap: 3_000.0,
            fastest_runner_max_market_cap: 50_000.0,
            fastest_runner_max_age_hours: 24.0,
            fastest_runner_min_engagement: 15,
            gamble_box_max_market_cap: 5_000.0,
            gamble_box_relaxed_max_market_cap: 7_500.0,
            gamble_box_max_age_hours: 12.0,
        }
    }
}

/// Promotion and removal thresholds plus roster sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressionRules {
    pub gamble_box_promote_gain: f64,
    pub gamble_box_promote_days: f64,
    pub fastest_runner_promote_gain: f64,
    pub fastest_runner_promote_days: f64,

    pub gamble_box_remove_gain: f64,
    pub gamble_box_remove_days: f64,
    pub fastest_runner_remove_gain: f64,
    pub fastest_runner_remove_days: f64,
    pub highest_gainer_remove_gain: f64,
    pub highest_gainer_remove_days: f64,

    /// Tracked tokens per tier
    pub roster_capacity: usize,
    /// Tokens shown per tier at once
    pub featured_slots: usize,
    /// Archived tokens kept, oldest dropped first
    pub archive_capacity: usize,
    /// Time a token must spend in a tier before its next promotion,
    /// compared strictly. Defaults to one refresh interval.
    pub min_tier_dwell_secs: u64,
}

impl ProgressionRules {
    /// `(min gain, min days)` for promotion out of `tier`.
    pub fn promotion_rule(&self, tier: Tier) -> Option<(f64, f64)> {
        match tier {
            Tier::GambleBox => Some((self.gamble_box_promote_gain, self.gamble_box_promote_days)),
            Tier::FastestRunner => Some((self.fastest_runner_promote_gain, self.fastest_runner_promote_days)),
            Tier::HighestGainer => None,
        }
    }

    /// `(max gain, max days)` past which a token in `tier` is removed.
    pub fn removal_rule(&self, tier: Tier) -> (f64, f64) {
        match tier {
            Tier::GambleBox => (self.gamble_box_remove_gain, self.gamble_box_remove_days),
            Tier::FastestRunner => (self.fastest_runner_remove_gain, self.fastest_runner_remove_days),
            Tier::HighestGainer => (self.highest_gainer_remove_gain, self.highest_gainer_remove_days),
        }
    }
}

impl Default for ProgressionRules {
    fn default() -> Self {
        Self {
            gamble_box_promote_gain: 1.5,
            gamble_box_promote_days: 0.25,
            fastest_runner_promote_gain: 2.5,
            fastest_runner_promote_days: 0.5,
            gamble_box_remove_gain: 0.3,
            gamble_box_remove_days: 3.0,
            fastest_runner_remove_gain: 0.2,
            fastest_runner_remove_days: 10.0,
            highest_gainer_remove_gain: 0.1,
            highest_gainer_remove_days: 30.0,
            roster_capacity: 12,
            featured_slots: 3,
            archive_capacity: 200,
            min_tier_dwell_secs: 30,
        }
    }
}

/// Refresh cadence, fetch bounds and source health settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub refresh_interval_secs: u64,
    /// Upper bound on one source fetch, retries included
    pub fetch_timeout_secs: u64,
    pub fetch_retry_attempts: usize,
    pub rate_limit_requests_per_second: u32,
    /// Minimum spacing between push-triggered cycles
    pub min_push_cycle_interval_secs: u64,
    pub push_cache_ttl_secs: u64,
    pub push_cache_capacity: u64,
    pub command_buffer: usize,
    /// SOL/USD rate for SOL-denominated market caps. Without it those caps
    /// are treated as unknown.
    pub sol_usd_price: Option<f64>,
    /// Publish labeled placeholder data when every source fails
    pub synthetic_fallback: bool,
    pub synthetic_batch_size: usize,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_cooldown_seconds: u64,
    pub source_success_sample_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
            fetch_timeout_secs: 12,
            fetch_retry_attempts: 2,
            rate_limit_requests_per_second: 2,
            min_push_cycle_interval_secs: 5,
            push_cache_ttl_secs: 600,
            push_cache_capacity: 5_000,
            command_buffer: 256,
            sol_usd_price: None,
            synthetic_fallback: false,
            synthetic_batch_size: 9,
            circuit_breaker_failure_threshold: 3,
            circuit_breaker_cooldown_seconds: 60,
            source_success_sample_size: 20,
        }
    }
}

/// Websocket push feed settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Tried in order; the next one takes over when one exhausts its retries
    pub endpoints: Vec<String>,
    /// Subscription methods sent after connecting
    pub subscriptions: Vec<String>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["wss://pumpportal.fun/api/data".to_string()],
            subscriptions: vec!["subscribeNewToken".to_string(), "subscribeMigration".to_string()],
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter_ms: 250,
            connect_timeout_secs: 10,
        }
    }
}

/// Shape of a polled REST endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestFeedKind {
    PumpCoins,
    DexPairs,
}

/// One polled REST source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub feed: RestFeedKind,
    pub url: String,
}

/// Full radar configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadarConfig {
    pub tiers: TierRules,
    pub progression: ProgressionRules,
    pub scheduler: SchedulerConfig,
    pub push: PushConfig,
    pub sources: Vec<SourceConfig>,
    /// SQLite file holding the persisted progression state
    pub store_path: String,
}

impl RadarConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            tiers: TierRules::default(),
            progression: ProgressionRules::default(),
            scheduler: SchedulerConfig::default(),
            push: PushConfig::default(),
            sources: vec![
                SourceConfig {
                    name: "pump_coins".to_string(),
                    feed: RestFeedKind::PumpCoins,
                    url: "https://frontend-api.pump.fun/coins?offset=0&limit=50&sort=created_timestamp&order=DESC&includeNsfw=false".to_string(),
                },
                SourceConfig {
                    name: "dex_pairs".to_string(),
                    feed: RestFeedKind::DexPairs,
                    url: "https://api.dexscreener.com/latest/dex/search?q=pump".to_string(),
                },
            ],
            store_path: "./tier_radar.db".to_string(),
        }
    }
}

/// A token entering tracking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub identity: String,
    pub tier: Tier,
    pub kind: AdmissionKind,
}

/// A forward tier move.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Promotion {
    pub identity: String,
    pub from: Tier,
    pub to: Tier,
}

/// A token leaving tracking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Removal {
    pub identity: String,
    pub tier: Tier,
    pub reason: RemovalReason,
}

/// What one progression cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub admitted: Vec<Admission>,
    pub promoted: Vec<Promotion>,
    pub removed: Vec<Removal>,
    /// Tracked tokens that received fresh market data
    pub refreshed: usize,
}

impl CycleReport {
    /// True when no token changed tier or tracking status.
    pub fn is_quiet(&self) -> bool {
        self.admitted.is_empty() && self.promoted.is_empty() && self.removed.is_empty()
    }
}

/// A single source that failed during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub reason: String,
}

/// Cycle-level failures surfaced to the scheduler's callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CycleError {
    #[error("all {attempted} upstream sources failed")]
    AllSourcesFailed {
        attempted: usize,
        failures: Vec<SourceFailure>,
    },
    #[error("upstream sources returned no usable tokens")]
    NoTokens,
    #[error("refresh scheduler is not running")]
    SchedulerClosed,
}

/// Data availability as shown to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeedStatus {
    /// No cycle has finished yet
    Starting,
    /// Last cycle used live data
    Live,
    /// Last cycle had no usable data; rosters are from the last good cycle
    NoDataAvailable { reason: String },
    /// Last cycle failed and labeled placeholder data is being shown
    SyntheticFallback { reason: String },
}

/// Running counters for the radar.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RadarMetrics {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub tokens_admitted: u64,
    pub tokens_promoted: u64,
    pub tokens_removed: u64,
    pub records_dropped: u64,
    pub push_events: u64,
    pub source_failures: u64,
}

impl RadarMetrics {
    pub fn record_cycle(&mut self, report: &CycleReport) {
        self.cycles_completed += 1;
        self.tokens_admitted += report.admitted.len() as u64;
        self.tokens_promoted += report.promoted.len() as u64;
        self.tokens_removed += report.removed.len() as u64;
    }
}

/// Immutable view published after every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub state: Arc<ProgressionState>,
    pub status: FeedStatus,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub source_health: Vec<SourceHealth>,
    pub metrics: RadarMetrics,
    /// Synthetic records, only populated in fallback mode
    pub placeholder: Vec<TokenRecord>,
    pub featured_slots: usize,
    /// Advances once per successful cycle
    pub rotation: usize,
}

impl DashboardSnapshot {
    pub fn starting(state: Arc<ProgressionState>, featured_slots: usize) -> Self {
        Self {
            state,
            status: FeedStatus::Starting,
            last_cycle_at: None,
            source_health: Vec::new(),
            metrics: RadarMetrics::default(),
            placeholder: Vec::new(),
            featured_slots,
            rotation: 0,
        }
    }

    /// Tokens currently on display for `tier`.
    pub fn featured(&self, tier: Tier) -> Vec<&TrackedToken> {
        self.state.featured(tier, self.featured_slots, self.rotation)
    }
}
