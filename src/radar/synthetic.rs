//! Placeholder records shown when every upstream source is down.
//!
//! Generated records are always labeled [`DataOrigin::Synthetic`] and never
//! reach the progression tracker.

use crate::types::{DataOrigin, SourceKind, TokenRecord};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Rough shape of a generated token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticProfile {
    /// Large, busy and a few days old (5%)
    Gainer,
    /// Mid cap and active (25%)
    Runner,
    /// Fresh and tiny (70%)
    Fresh,
}

impl SyntheticProfile {
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        match rng.gen_range(1..=100) {
            1..=5 => SyntheticProfile::Gainer,
            6..=30 => SyntheticProfile::Runner,
            _ => SyntheticProfile::Fresh,
        }
    }
}

/// Generate `count` labeled placeholder records.
pub fn generate_batch<R: Rng>(rng: &mut R, count: usize, now: DateTime<Utc>) -> Vec<TokenRecord> {
    (0..count)
        .map(|index| generate_record(rng, index, now))
        .collect()
}

fn generate_record<R: Rng>(rng: &mut R, index: usize, now: DateTime<Utc>) -> TokenRecord {
    let profile = SyntheticProfile::random(rng);
    let (market_cap, age_minutes, engagement) = match profile {
        SyntheticProfile::Gainer => (
            rng.gen_range(50_000.0..400_000.0),
            rng.gen_range(60..2_800),
            rng.gen_range(31..400),
        ),
        SyntheticProfile::Runner => (
            rng.gen_range(5_000.0..50_000.0),
            rng.gen_range(10..1_400),
            rng.gen_range(16..120),
        ),
        SyntheticProfile::Fresh => (
            rng.gen_range(500.0..5_000.0),
            rng.gen_range(1..700),
            rng.gen_range(0..20),
        ),
    };

    let suffix: u32 = rng.gen();
    let mut record = TokenRecord::new(format!("synthetic-{:08x}", suffix), SourceKind::Synthetic, now);
    record.display_name = Some(format!("Placeholder {}", index + 1));
    record.symbol = Some(format!("PH{}", index + 1));
    record.created_at = Some(now - Duration::minutes(age_minutes));
    record.market_cap_usd = Some(market_cap);
    record.engagement_count = Some(engagement);
    record.is_live = Some(true);
    record.is_complete = Some(false);
    record.origin = DataOrigin::Synthetic;
    record
}
