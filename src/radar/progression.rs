//! Progression tracker - the tier state machine.
//!
//! Tokens move GambleBox -> FastestRunner -> HighestGainer and leave only by
//! removal into the archive. Each cycle runs, in order: metric refresh,
//! removal, promotion, admission. A cycle is a single synchronous mutation
//! of the owned [`ProgressionState`].

use crate::radar::aggregator::merge_records;
use crate::radar::classifier::{admission_order, TierClassifier};
use crate::radar::types::{Admission, CycleReport, ProgressionRules, Promotion, Removal};
use crate::types::{AdmissionKind, ArchivedToken, ProgressionState, RemovalReason, Tier, TokenRecord, TrackedToken};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Owns the progression state and applies one cycle at a time.
pub struct ProgressionTracker {
    state: ProgressionState,
    rules: ProgressionRules,
    classifier: TierClassifier,
}

impl ProgressionTracker {
    /// Create a tracker around previously loaded (or empty) state.
    pub fn new(state: ProgressionState, rules: ProgressionRules, classifier: TierClassifier) -> Self {
        Self { state, rules, classifier }
    }

    pub fn state(&self) -> &ProgressionState {
        &self.state
    }

    pub fn rules(&self) -> &ProgressionRules {
        &self.rules
    }

    pub fn classifier(&self) -> &TierClassifier {
        &self.classifier
    }

    pub fn into_state(self) -> ProgressionState {
        self.state
    }

    /// Apply one progression cycle against the aggregated records.
    ///
    /// Running this twice with the same records and clock leaves the state
    /// unchanged after the first run.
    pub fn run_cycle(&mut self, records: &[TokenRecord], now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();
        let index: HashMap<&str, &TokenRecord> = records
            .iter()
            .map(|record| (record.identity.as_str(), record))
            .collect();

        report.refreshed = self.refresh_metrics(&index);
        self.apply_removals(now, &mut report);
        self.apply_promotions(now, &mut report);
        self.apply_admissions(records, now, &mut report);
        self.sort_rosters();
        self.trim_archive();

        if !report.is_quiet() {
            info!(
                "Progression cycle: {} admitted, {} promoted, {} removed, {} refreshed",
                report.admitted.len(),
                report.promoted.len(),
                report.removed.len(),
                report.refreshed
            );
        }

        report
    }

    fn refresh_metrics(&mut self, index: &HashMap<&str, &TokenRecord>) -> usize {
        let mut refreshed = 0;
        for tier in Tier::ALL {
            for token in self.state.roster_mut(tier).iter_mut() {
                if let Some(record) = index.get(token.identity()) {
                    let merged = merge_records(&token.record, record);
                    token.observe(merged);
                    refreshed += 1;
                }
            }
        }
        refreshed
    }

    /// Removal reason for a token, if any. The gain floor is checked before
    /// the age ceiling.
    pub fn removal_reason(&self, token: &TrackedToken, now: DateTime<Utc>) -> Option<RemovalReason> {
        let (max_gain, max_days) = self.rules.removal_rule(token.tier);
        let days = token.days_since_first_observed(now);

        if token.current_gain_multiple <= max_gain {
            Some(RemovalReason::GainCollapse {
                gain_multiple: token.current_gain_multiple,
            })
        } else if days >= max_days {
            Some(RemovalReason::Expired { days_tracked: days })
        } else {
            None
        }
    }

    fn apply_removals(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        for tier in Tier::ALL {
            let roster = std::mem::take(self.state.roster_mut(tier));
            let mut kept = Vec::with_capacity(roster.len());

            for token in roster {
                match self.removal_reason(&token, now) {
                    Some(reason) => {
                        debug!("Removing {} from {}: {:?}", token.identity(), tier, reason);
                        report.removed.push(Removal {
                            identity: token.identity().to_string(),
                            tier,
                            reason: reason.clone(),
                        });
                        self.state.archive.push(ArchivedToken {
                            token,
                            removed_at: now,
                            reason,
                        });
                    }
                    None => kept.push(token),
                }
            }

            *self.state.roster_mut(tier) = kept;
        }
    }

    /// Whether a token has met its tier's promotion rule.
    ///
    /// The token must also have been observed after entering its current
    /// tier and have stayed there longer than the minimum dwell, so a rerun
    /// on the same data never climbs a second step.
    pub fn is_promotable(&self, token: &TrackedToken, now: DateTime<Utc>) -> bool {
        let Some((min_gain, min_days)) = self.rules.promotion_rule(token.tier) else {
            return false;
        };
        let dwell = now - token.tier_entered_at;
        let min_dwell = Duration::seconds(self.rules.min_tier_dwell_secs as i64);

        token.current_gain_multiple >= min_gain
            && token.days_since_first_observed(now) >= min_days
            && token.record.observed_at > token.tier_entered_at
            && dwell > min_dwell
    }

    /// Promote upper tiers first so a token can climb at most one step per
    /// cycle. Promotions into a full tier wait for capacity.
    fn apply_promotions(&mut self, now: DateTime<Utc>, report: &mut CycleReport) {
        for from in [Tier::FastestRunner, Tier::GambleBox] {
            let Some(to) = from.next() else { continue };
            let open = self.rules.roster_capacity.saturating_sub(self.state.roster(to).len());

            let mut eligible: Vec<(String, f64)> = self
                .state
                .roster(from)
                .iter()
                .filter(|token| self.is_promotable(token, now))
                .map(|token| (token.identity().to_string(), token.current_gain_multiple))
                .collect();
            if eligible.is_empty() {
                continue;
            }

            eligible.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            if eligible.len() > open {
                debug!(
                    "{} promotions from {} deferred, {} is full",
                    eligible.len() - open,
                    from,
                    to
                );
            }
            let chosen: HashSet<String> = eligible.into_iter().take(open).map(|(id, _)| id).collect();
            if chosen.is_empty() {
                continue;
            }

            let (moving, staying): (Vec<TrackedToken>, Vec<TrackedToken>) = std::mem::take(self.state.roster_mut(from))
                .into_iter()
                .partition(|token| chosen.contains(token.identity()));
            *self.state.roster_mut(from) = staying;

            for mut token in moving {
                token.tier = to;
                token.tier_entered_at = now;
                report.promoted.push(Promotion {
                    identity: token.identity().to_string(),
                    from,
                    to,
                });
                self.state.roster_mut(to).push(token);
            }
        }
    }

    /// Fill open capacity, most selective tier first. Strict candidates go
    /// before relaxed backfill. Tracked and archived tokens are skipped.
    fn apply_admissions(&mut self, records: &[TokenRecord], now: DateTime<Utc>, report: &mut CycleReport) {
        let mut taken: HashSet<String> = HashSet::new();

        for tier in Tier::BY_SELECTIVITY {
            let mut open = self.rules.roster_capacity.saturating_sub(self.state.roster(tier).len());
            if open == 0 {
                continue;
            }

            let candidates: Vec<&TokenRecord> = records
                .iter()
                .filter(|record| !record.is_synthetic())
                .filter(|record| !taken.contains(&record.identity))
                .filter(|record| !self.state.is_tracked(&record.identity))
                .filter(|record| !self.state.is_archived(&record.identity))
                .collect();

            for kind in [AdmissionKind::Strict, AdmissionKind::Relaxed] {
                if open == 0 {
                    break;
                }

                let mut eligible: Vec<&TokenRecord> = candidates
                    .iter()
                    .copied()
                    .filter(|record| !taken.contains(&record.identity))
                    .filter(|record| match kind {
                        AdmissionKind::Strict => self.classifier.classify(record, now) == Some(tier),
                        AdmissionKind::Relaxed => self.classifier.qualifies_for_backfill(tier, record, now),
                    })
                    .collect();
                eligible.sort_by(|a, b| admission_order(tier, a, b));

                for record in eligible.into_iter().take(open) {
                    taken.insert(record.identity.clone());
                    report.admitted.push(Admission {
                        identity: record.identity.clone(),
                        tier,
                        kind,
                    });
                    self.state
                        .roster_mut(tier)
                        .push(TrackedToken::admit(record.clone(), tier, now, kind));
                    open -= 1;
                }
            }
        }
    }

    fn sort_rosters(&mut self) {
        for tier in Tier::ALL {
            self.state
                .roster_mut(tier)
                .sort_by(|a, b| admission_order(tier, &a.record, &b.record));
        }
    }

    fn trim_archive(&mut self) {
        let capacity = self.rules.archive_capacity;
        let archive = &mut self.state.archive;
        if archive.len() > capacity {
            let excess = archive.len() - capacity;
            archive.drain(..excess);
        }
    }
}
