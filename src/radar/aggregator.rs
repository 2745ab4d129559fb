//! Aggregator: merges per-source records into one record per token.
//!
//! Merging is field by field. The fresher observation wins when both sides
//! know a value, and a known value is never replaced by an unknown one.

use crate::radar::types::{CycleError, SourceFailure};
use crate::types::{DataOrigin, SocialLinks, TokenRecord, WindowedMetrics};
use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

/// Result of asking one source for data during a cycle.
#[derive(Debug, Clone)]
pub enum SourceOutcome {
    Fetched { source: String, records: Vec<TokenRecord> },
    Failed(SourceFailure),
}

/// Pick between two optional values. `incoming_fresher` decides ties
/// between two known values; absence never wins.
fn pick<T: Clone>(base: &Option<T>, incoming: &Option<T>, incoming_fresher: bool) -> Option<T> {
    match (base, incoming) {
        (Some(_), Some(value)) if incoming_fresher => Some(value.clone()),
        (Some(value), _) => Some(value.clone()),
        (None, value) => value.clone(),
    }
}

fn merge_links(base: &SocialLinks, incoming: &SocialLinks, incoming_fresher: bool) -> SocialLinks {
    SocialLinks {
        twitter: pick(&base.twitter, &incoming.twitter, incoming_fresher),
        website: pick(&base.website, &incoming.website, incoming_fresher),
        telegram: pick(&base.telegram, &incoming.telegram, incoming_fresher),
    }
}

fn merge_windows(base: &WindowedMetrics, incoming: &WindowedMetrics, incoming_fresher: bool) -> WindowedMetrics {
    WindowedMetrics {
        m5: pick(&base.m5, &incoming.m5, incoming_fresher),
        h1: pick(&base.h1, &incoming.h1, incoming_fresher),
        h6: pick(&base.h6, &incoming.h6, incoming_fresher),
        h24: pick(&base.h24, &incoming.h24, incoming_fresher),
    }
}

/// Merge two records for the same identity.
///
/// Genesis time keeps the earliest known value. Completion is sticky once
/// any source reports it. Sources are unioned.
pub fn merge_records(base: &TokenRecord, incoming: &TokenRecord) -> TokenRecord {
    debug_assert_eq!(base.identity, incoming.identity);
    let fresher = incoming.observed_at >= base.observed_at;

    let created_at = match (base.created_at, incoming.created_at) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let is_complete = match (base.is_complete, incoming.is_complete) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (a, b) => pick(&a, &b, fresher),
    };
    // A reported supply beats the default regardless of freshness
    let supply_from_incoming = match (base.supply_reported, incoming.supply_reported) {
        (true, false) => false,
        (false, true) => true,
        _ => fresher,
    };
    let origin = if base.is_synthetic() || incoming.is_synthetic() {
        DataOrigin::Synthetic
    } else {
        DataOrigin::Live
    };

    TokenRecord {
        identity: base.identity.clone(),
        display_name: pick(&base.display_name, &incoming.display_name, fresher),
        symbol: pick(&base.symbol, &incoming.symbol, fresher),
        created_at,
        market_cap_usd: pick(&base.market_cap_usd, &incoming.market_cap_usd, fresher),
        social_links: merge_links(&base.social_links, &incoming.social_links, fresher),
        engagement_count: pick(&base.engagement_count, &incoming.engagement_count, fresher),
        volume: merge_windows(&base.volume, &incoming.volume, fresher),
        price_change: merge_windows(&base.price_change, &incoming.price_change, fresher),
        liquidity_usd: pick(&base.liquidity_usd, &incoming.liquidity_usd, fresher),
        total_supply: if supply_from_incoming { incoming.total_supply } else { base.total_supply },
        supply_reported: base.supply_reported || incoming.supply_reported,
        is_complete,
        is_live: pick(&base.is_live, &incoming.is_live, fresher),
        sources: base.sources.union(&incoming.sources).copied().collect(),
        observed_at: base.observed_at.max(incoming.observed_at),
        origin,
    }
}

/// Collapse records into one per identity, in downstream order.
pub fn dedup_records(records: impl IntoIterator<Item = TokenRecord>, now: DateTime<Utc>) -> Vec<TokenRecord> {
    let mut merged: HashMap<String, TokenRecord> = HashMap::new();

    for record in records {
        match merged.get_mut(&record.identity) {
            Some(existing) => *existing = merge_records(existing, &record),
            None => {
                merged.insert(record.identity.clone(), record);
            }
        }
    }

    let mut records: Vec<TokenRecord> = merged.into_values().collect();
    records.sort_by(|a, b| freshness_order(a, b, now));
    records
}

/// Aggregate one cycle's source outcomes.
///
/// Fails when every source failed (or none was attempted) and when the
/// sources that answered produced no records at all.
pub fn aggregate_outcomes(
    outcomes: Vec<SourceOutcome>,
    now: DateTime<Utc>,
) -> Result<NonEmpty<TokenRecord>, CycleError> {
    let attempted = outcomes.len();
    let mut failures = Vec::new();
    let mut records = Vec::new();
    let mut any_success = false;

    for outcome in outcomes {
        match outcome {
            SourceOutcome::Fetched { source, records: batch } => {
                debug!("Source {} contributed {} records", source, batch.len());
                any_success = true;
                records.extend(batch);
            }
            SourceOutcome::Failed(failure) => failures.push(failure),
        }
    }

    if !any_success {
        return Err(CycleError::AllSourcesFailed { attempted, failures });
    }

    NonEmpty::from_vec(dedup_records(records, now)).ok_or(CycleError::NoTokens)
}

/// Whole hours since genesis; unknown genesis sorts last.
fn freshness_bucket(record: &TokenRecord, now: DateTime<Utc>) -> i64 {
    record
        .age_hours(now)
        .map(|hours| hours.floor() as i64)
        .unwrap_or(i64::MAX)
}

/// Newest hour bucket first, then higher engagement, then higher market
/// cap, then identity so the order is total.
pub fn freshness_order(a: &TokenRecord, b: &TokenRecord, now: DateTime<Utc>) -> Ordering {
    freshness_bucket(a, now)
        .cmp(&freshness_bucket(b, now))
        .then_with(|| b.engagement_count.unwrap_or(0).cmp(&a.engagement_count.unwrap_or(0)))
        .then_with(|| {
            b.market_cap_usd
                .unwrap_or(0.0)
                .total_cmp(&a.market_cap_usd.unwrap_or(0.0))
        })
        .then_with(|| a.identity.cmp(&b.identity))
}
