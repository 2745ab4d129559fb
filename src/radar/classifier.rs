//! Tier classifier - pure admission rules.
//!
//! Classification only proposes where an untracked token would enter. Tokens
//! already tracked are never reclassified; the progression tracker owns them.

use crate::radar::types::TierRules;
use crate::types::{Tier, TokenRecord};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// Strict rules decide classification; relaxed rules only backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    Strict,
    Relaxed,
}

/// Admission rules for all three tiers.
#[derive(Debug, Clone, Default)]
pub struct TierClassifier {
    rules: TierRules,
}

impl TierClassifier {
    pub fn new(rules: TierRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &TierRules {
        &self.rules
    }

    /// Tier a new record would enter, checked most selective first.
    /// `None` means unclassified.
    pub fn classify(&self, record: &TokenRecord, now: DateTime<Utc>) -> Option<Tier> {
        Tier::BY_SELECTIVITY
            .into_iter()
            .find(|tier| self.qualifies(*tier, record, now, Strictness::Strict))
    }

    /// Whether `record` may backfill `tier` under relaxed bounds. A token that
    /// strictly classifies anywhere is never borrowed.
    pub fn qualifies_for_backfill(&self, tier: Tier, record: &TokenRecord, now: DateTime<Utc>) -> bool {
        self.classify(record, now).is_none() && self.qualifies(tier, record, now, Strictness::Relaxed)
    }

    /// Check one tier's market cap, age and engagement rules.
    pub fn qualifies(&self, tier: Tier, record: &TokenRecord, now: DateTime<Utc>, strictness: Strictness) -> bool {
        let (Some(market_cap), Some(age_hours)) = (record.market_cap_usd, record.age_hours(now)) else {
            return false;
        };
        let engagement = record.engagement_count.unwrap_or(0);
        let rules = &self.rules;
        let relaxed = strictness == Strictness::Relaxed;

        match tier {
            Tier::HighestGainer => {
                let floor = if relaxed {
                    rules.highest_gainer_relaxed_min_market_cap
                } else {
                    rules.highest_gainer_min_market_cap
                };
                market_cap > floor
                    && age_hours < rules.highest_gainer_max_age_hours
                    && engagement > rules.highest_gainer_min_engagement
            }
            Tier::FastestRunner => {
                let floor = if relaxed {
                    rules.fastest_runner_relaxed_min_market_cap
                } else {
                    rules.fastest_runner_min_market_cap
                };
                market_cap >= floor
                    && market_cap <= rules.fastest_runner_max_market_cap
                    && age_hours < rules.fastest_runner_max_age_hours
                    && engagement > rules.fastest_runner_min_engagement
            }
            Tier::GambleBox => {
                let ceiling = if relaxed {
                    rules.gamble_box_relaxed_max_market_cap
                } else {
                    rules.gamble_box_max_market_cap
                };
                market_cap < ceiling && age_hours < rules.gamble_box_max_age_hours
            }
        }
    }
}

/// Classify with the default tier rules.
pub fn classify(record: &TokenRecord, now: DateTime<Utc>) -> Option<Tier> {
    TierClassifier::default().classify(record, now)
}

/// Preferred admission order within a tier: higher market cap for the two
/// upper tiers, newest genesis for GambleBox.
pub fn admission_order(tier: Tier, a: &TokenRecord, b: &TokenRecord) -> Ordering {
    let primary = match tier {
        Tier::GambleBox => b.created_at.cmp(&a.created_at),
        Tier::FastestRunner | Tier::HighestGainer => b
            .market_cap_usd
            .unwrap_or(0.0)
            .total_cmp(&a.market_cap_usd.unwrap_or(0.0)),
    };
    primary.then_with(|| a.identity.cmp(&b.identity))
}
