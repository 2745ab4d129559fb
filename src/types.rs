//! Core types and data structures for the tier radar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Supply assumed when a source omits it. Pump-style bonding curve tokens
/// launch with one billion units.
pub const DEFAULT_TOTAL_SUPPLY: f64 = 1_000_000_000.0;

/// Smallest baseline market cap used as a gain denominator.
pub const MIN_BASELINE_MARKET_CAP_USD: f64 = 1.0;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Upstream feed that contributed to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// REST batch of bonding-curve coins
    PumpRest,
    /// REST pair listing from a DEX aggregator
    DexRest,
    /// Websocket push events
    WebSocketPush,
    /// Server-sent events
    SsePush,
    /// Generated placeholder data
    Synthetic,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::PumpRest => "pump_rest",
            SourceKind::DexRest => "dex_rest",
            SourceKind::WebSocketPush => "websocket_push",
            SourceKind::SsePush => "sse_push",
            SourceKind::Synthetic => "synthetic",
        }
    }
}

/// Whether a record came from a real feed or was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
    #[default]
    Live,
    Synthetic,
}

/// Optional social links for a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialLinks {
    pub twitter: Option<String>,
    pub website: Option<String>,
    pub telegram: Option<String>,
}

impl SocialLinks {
    pub fn is_empty(&self) -> bool {
        self.twitter.is_none() && self.website.is_none() && self.telegram.is_none()
    }
}

/// A metric reported over several time horizons.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowedMetrics {
    pub m5: Option<f64>,
    pub h1: Option<f64>,
    pub h6: Option<f64>,
    pub h24: Option<f64>,
}

/// Canonical snapshot of one token's market data.
///
/// Every field except `identity`, `total_supply` and `observed_at` may be
/// unknown. Unknown is `None`, never a zero value, so merging can tell
/// "not reported" apart from "reported as zero".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Mint or contract address
    pub identity: String,
    pub display_name: Option<String>,
    pub symbol: Option<String>,
    /// Token genesis time
    pub created_at: Option<DateTime<Utc>>,
    pub market_cap_usd: Option<f64>,
    #[serde(default)]
    pub social_links: SocialLinks,
    /// Reply/comment count used as an activity proxy
    pub engagement_count: Option<u64>,
    #[serde(default)]
    pub volume: WindowedMetrics,
    #[serde(default)]
    pub price_change: WindowedMetrics,
    pub liquidity_usd: Option<f64>,
    pub total_supply: f64,
    /// False while `total_supply` is the default rather than a source value
    #[serde(default)]
    pub supply_reported: bool,
    /// Graduated off the bonding curve
    pub is_complete: Option<bool>,
    /// Still actively quoted
    pub is_live: Option<bool>,
    #[serde(default)]
    pub sources: BTreeSet<SourceKind>,
    /// When the contributing source produced this snapshot
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub origin: DataOrigin,
}

impl TokenRecord {
    /// Create an otherwise empty record for `identity` seen by `source`.
    pub fn new(identity: impl Into<String>, source: SourceKind, observed_at: DateTime<Utc>) -> Self {
        let mut sources = BTreeSet::new();
        sources.insert(source);
        Self {
            identity: identity.into(),
            display_name: None,
            symbol: None,
            created_at: None,
            market_cap_usd: None,
            social_links: SocialLinks::default(),
            engagement_count: None,
            volume: WindowedMetrics::default(),
            price_change: WindowedMetrics::default(),
            liquidity_usd: None,
            total_supply: DEFAULT_TOTAL_SUPPLY,
            supply_reported: false,
            is_complete: None,
            is_live: None,
            sources,
            observed_at,
            origin: if source == SourceKind::Synthetic {
                DataOrigin::Synthetic
            } else {
                DataOrigin::Live
            },
        }
    }

    /// Hours since genesis, clamped at zero for clock skew.
    pub fn age_hours(&self, now: DateTime<Utc>) -> Option<f64> {
        self.created_at
            .map(|created| ((now - created).num_milliseconds() as f64 / MILLIS_PER_HOUR).max(0.0))
    }

    pub fn is_synthetic(&self) -> bool {
        self.origin == DataOrigin::Synthetic
    }
}

/// Risk/reward tier, ordered from entry level to most selective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    GambleBox,
    FastestRunner,
    HighestGainer,
}

impl Tier {
    /// Entry tier first.
    pub const ALL: [Tier; 3] = [Tier::GambleBox, Tier::FastestRunner, Tier::HighestGainer];

    /// Most selective first, the order admission checks run in.
    pub const BY_SELECTIVITY: [Tier; 3] = [Tier::HighestGainer, Tier::FastestRunner, Tier::GambleBox];

    /// The tier a promotion leads to. There is no skip from GambleBox.
    pub fn next(&self) -> Option<Tier> {
        match self {
            Tier::GambleBox => Some(Tier::FastestRunner),
            Tier::FastestRunner => Some(Tier::HighestGainer),
            Tier::HighestGainer => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::GambleBox => "gamble_box",
            Tier::FastestRunner => "fastest_runner",
            Tier::HighestGainer => "highest_gainer",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a token got into its first tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionKind {
    /// Cleared the tier's strict rules
    Strict,
    /// Backfilled under a relaxed market cap boundary
    Relaxed,
}

/// A token under progression tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedToken {
    pub record: TokenRecord,
    pub tier: Tier,
    /// Baseline timestamp, fixed at admission
    pub first_observed_at: DateTime<Utc>,
    /// Baseline market cap, fixed at admission and floored at
    /// [`MIN_BASELINE_MARKET_CAP_USD`]
    pub first_observed_market_cap: f64,
    pub current_gain_multiple: f64,
    pub peak_gain_multiple: f64,
    /// When the token entered its current tier
    pub tier_entered_at: DateTime<Utc>,
    pub admission: AdmissionKind,
}

impl TrackedToken {
    /// Start tracking `record` in `tier`, capturing the baseline.
    pub fn admit(record: TokenRecord, tier: Tier, now: DateTime<Utc>, admission: AdmissionKind) -> Self {
        let baseline = record
            .market_cap_usd
            .unwrap_or(MIN_BASELINE_MARKET_CAP_USD)
            .max(MIN_BASELINE_MARKET_CAP_USD);
        let gain = record
            .market_cap_usd
            .map(|cap| (cap / baseline).max(0.0))
            .unwrap_or(1.0);

        Self {
            record,
            tier,
            first_observed_at: now,
            first_observed_market_cap: baseline,
            current_gain_multiple: gain,
            peak_gain_multiple: gain,
            tier_entered_at: now,
            admission,
        }
    }

    pub fn identity(&self) -> &str {
        &self.record.identity
    }

    /// Replace the market snapshot and recompute gain metrics. The baseline
    /// is left untouched.
    pub fn observe(&mut self, record: TokenRecord) {
        self.record = record;
        if let Some(cap) = self.record.market_cap_usd {
            let baseline = self.first_observed_market_cap.max(MIN_BASELINE_MARKET_CAP_USD);
            self.current_gain_multiple = (cap / baseline).max(0.0);
            self.peak_gain_multiple = self.peak_gain_multiple.max(self.current_gain_multiple);
        }
    }

    /// Fractional days since admission.
    pub fn days_since_first_observed(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.first_observed_at).num_milliseconds() as f64 / MILLIS_PER_DAY).max(0.0)
    }

    /// Token age at `now`, derived from its genesis time.
    pub fn age_at_observation(&self, now: DateTime<Utc>) -> Option<f64> {
        self.record.age_hours(now)
    }
}

/// Why a token left tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemovalReason {
    /// Gain fell to or below the tier's floor
    GainCollapse { gain_multiple: f64 },
    /// Tracked longer than the tier allows
    Expired { days_tracked: f64 },
}

/// A removed token with its final metrics frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedToken {
    pub token: TrackedToken,
    pub removed_at: DateTime<Utc>,
    pub reason: RemovalReason,
}

/// Everything that survives across refresh cycles: three tier rosters and
/// the archive of removed tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressionState {
    #[serde(default)]
    pub gamble_box: Vec<TrackedToken>,
    #[serde(default)]
    pub fastest_runner: Vec<TrackedToken>,
    #[serde(default)]
    pub highest_gainer: Vec<TrackedToken>,
    #[serde(default)]
    pub archive: Vec<ArchivedToken>,
}

impl ProgressionState {
    pub fn roster(&self, tier: Tier) -> &[TrackedToken] {
        match tier {
            Tier::GambleBox => &self.gamble_box,
            Tier::FastestRunner => &self.fastest_runner,
            Tier::HighestGainer => &self.highest_gainer,
        }
    }

    pub fn roster_mut(&mut self, tier: Tier) -> &mut Vec<TrackedToken> {
        match tier {
            Tier::GambleBox => &mut self.gamble_box,
            Tier::FastestRunner => &mut self.fastest_runner,
            Tier::HighestGainer => &mut self.highest_gainer,
        }
    }

    /// Find a tracked token in any tier.
    pub fn find(&self, identity: &str) -> Option<&TrackedToken> {
        Tier::ALL
            .iter()
            .flat_map(|tier| self.roster(*tier).iter())
            .find(|token| token.identity() == identity)
    }

    pub fn is_tracked(&self, identity: &str) -> bool {
        self.find(identity).is_some()
    }

    pub fn is_archived(&self, identity: &str) -> bool {
        self.archive.iter().any(|entry| entry.token.identity() == identity)
    }

    pub fn total_tracked(&self) -> usize {
        self.gamble_box.len() + self.fastest_runner.len() + self.highest_gainer.len()
    }

    /// Display window of `slots` tokens for a tier, rotating through the
    /// roster as `rotation` advances.
    pub fn featured(&self, tier: Tier, slots: usize, rotation: usize) -> Vec<&TrackedToken> {
        let roster = self.roster(tier);
        if slots == 0 || roster.is_empty() {
            return Vec::new();
        }
        if roster.len() <= slots {
            return roster.iter().collect();
        }

        let start = rotation.wrapping_mul(slots) % roster.len();
        roster.iter().cycle().skip(start).take(slots).collect()
    }
}
