//! Circuit breaker for upstream source health.
//!
//! Sources that keep failing are quarantined for a cooldown period and then
//! retried in a degraded state.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Breaker state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// Source is healthy and polled every cycle
    Healthy,
    /// Source is failing but still polled
    Degraded,
    /// Source is skipped until its cooldown expires
    CoolingDown,
}

#[derive(Debug, Clone)]
struct SourceTracker {
    state: SourceState,
    consecutive_failures: u32,
    recent_attempts: VecDeque<bool>,
    cooldown_start: Option<Instant>,
    last_error: Option<String>,
}

impl SourceTracker {
    fn new() -> Self {
        Self {
            state: SourceState::Healthy,
            consecutive_failures: 0,
            recent_attempts: VecDeque::new(),
            cooldown_start: None,
            last_error: None,
        }
    }

    fn push_attempt(&mut self, success: bool, window: usize) {
        self.recent_attempts.push_back(success);
        while self.recent_attempts.len() > window.max(1) {
            self.recent_attempts.pop_front();
        }
    }

    fn success_rate(&self) -> f64 {
        if self.recent_attempts.is_empty() {
            return 1.0;
        }
        let successes = self.recent_attempts.iter().filter(|&&ok| ok).count();
        successes as f64 / self.recent_attempts.len() as f64
    }
}

/// Health of one source as published in dashboard snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHealth {
    pub source: String,
    pub state: SourceState,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub total_attempts: usize,
    pub last_error: Option<String>,
}

/// Tracks health per source name.
pub struct CircuitBreaker {
    sources: BTreeMap<String, SourceTracker>,
    /// Consecutive failures before a healthy source is degraded
    failure_threshold: u32,
    cooldown_duration: Duration,
    /// Rolling window for the success rate
    sample_size: usize,
    /// Below this rate a full window sends a degraded source to cooldown
    min_success_rate: f64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_seconds: u64, sample_size: usize) -> Self {
        Self {
            sources: BTreeMap::new(),
            failure_threshold: failure_threshold.max(1),
            cooldown_duration: Duration::from_secs(cooldown_seconds),
            sample_size,
            min_success_rate: 0.3,
        }
    }

    fn tracker(&mut self, source: &str) -> &mut SourceTracker {
        self.sources
            .entry(source.to_string())
            .or_insert_with(SourceTracker::new)
    }

    #[instrument(skip(self), fields(source = %source))]
    pub fn record_success(&mut self, source: &str) {
        let window = self.sample_size;
        let tracker = self.tracker(source);
        tracker.consecutive_failures = 0;
        tracker.push_attempt(true, window);
        self.update_state(source);
    }

    #[instrument(skip(self, error), fields(source = %source))]
    pub fn record_failure(&mut self, source: &str, error: &str) {
        let window = self.sample_size;
        let tracker = self.tracker(source);
        tracker.consecutive_failures += 1;
        tracker.last_error = Some(error.to_string());
        tracker.push_attempt(false, window);
        let failures = tracker.consecutive_failures;
        self.update_state(source);

        warn!("Source {} failed ({} in a row): {}", source, failures, error);
    }

    /// Whether the source should be polled this cycle. An expired cooldown
    /// lets the source back in as degraded.
    pub fn is_available(&mut self, source: &str) -> bool {
        let cooldown = self.cooldown_duration;
        let tracker = self.tracker(source);

        match tracker.state {
            SourceState::Healthy | SourceState::Degraded => true,
            SourceState::CoolingDown => match tracker.cooldown_start {
                Some(start) if start.elapsed() < cooldown => false,
                _ => {
                    tracker.state = SourceState::Degraded;
                    tracker.cooldown_start = None;
                    tracker.consecutive_failures = 0;
                    debug!("Source {} cooldown expired, retrying as degraded", source);
                    true
                }
            },
        }
    }

    pub fn state(&self, source: &str) -> SourceState {
        self.sources
            .get(source)
            .map(|tracker| tracker.state)
            .unwrap_or(SourceState::Healthy)
    }

    fn update_state(&mut self, source: &str) {
        let threshold = self.failure_threshold;
        let sample_size = self.sample_size;
        let min_rate = self.min_success_rate;
        let tracker = self.tracker(source);
        let rate = tracker.success_rate();

        match tracker.state {
            SourceState::Healthy => {
                if tracker.consecutive_failures >= threshold {
                    tracker.state = SourceState::Degraded;
                    debug!("Source {} degraded after {} failures", source, tracker.consecutive_failures);
                }
            }
            SourceState::Degraded => {
                let window_full = tracker.recent_attempts.len() >= sample_size;
                if tracker.consecutive_failures >= threshold * 2 || (window_full && rate < min_rate) {
                    tracker.state = SourceState::CoolingDown;
                    tracker.cooldown_start = Some(Instant::now());
                    warn!("Source {} cooling down, success rate {:.0}%", source, rate * 100.0);
                } else if tracker.consecutive_failures == 0 && rate > 0.7 {
                    tracker.state = SourceState::Healthy;
                    debug!("Source {} recovered", source);
                }
            }
            SourceState::CoolingDown => {}
        }
    }

    /// Snapshot of every source seen so far, ordered by name.
    pub fn health(&self) -> Vec<SourceHealth> {
        self.sources
            .iter()
            .map(|(source, tracker)| SourceHealth {
                source: source.clone(),
                state: tracker.state,
                consecutive_failures: tracker.consecutive_failures,
                success_rate: tracker.success_rate(),
                total_attempts: tracker.recent_attempts.len(),
                last_error: tracker.last_error.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_source_is_healthy() {
        let mut cb = CircuitBreaker::new(3, 60, 20);
        assert!(cb.is_available("pump"));
        assert_eq!(cb.state("pump"), SourceState::Healthy);
    }

    #[test]
    fn test_failures_degrade_then_cool_down() {
        let mut cb = CircuitBreaker::new(2, 60, 20);

        cb.record_failure("dex", "timeout");
        cb.record_failure("dex", "timeout");
        assert_eq!(cb.state("dex"), SourceState::Degraded);
        assert!(cb.is_available("dex"));

        cb.record_failure("dex", "timeout");
        cb.record_failure("dex", "timeout");
        assert_eq!(cb.state("dex"), SourceState::CoolingDown);
        assert!(!cb.is_available("dex"));
    }

    #[test]
    fn test_zero_cooldown_lets_source_back_in() {
        let mut cb = CircuitBreaker::new(1, 0, 20);
        cb.record_failure("dex", "503");
        cb.record_failure("dex", "503");
        assert_eq!(cb.state("dex"), SourceState::CoolingDown);

        assert!(cb.is_available("dex"));
        assert_eq!(cb.state("dex"), SourceState::Degraded);
    }

    #[test]
    fn test_recovery_after_successes() {
        let mut cb = CircuitBreaker::new(3, 60, 20);
        for _ in 0..3 {
            cb.record_failure("pump", "timeout");
        }
        assert_eq!(cb.state("pump"), SourceState::Degraded);

        for _ in 0..10 {
            cb.record_success("pump");
        }
        assert_eq!(cb.state("pump"), SourceState::Healthy);
    }

    #[test]
    fn test_health_snapshot() {
        let mut cb = CircuitBreaker::new(3, 60, 20);
        cb.record_success("b");
        cb.record_failure("a", "bad gateway");
        cb.record_success("a");

        let health = cb.health();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].source, "a");
        assert_eq!(health[0].consecutive_failures, 0);
        assert_eq!(health[0].total_attempts, 2);
        assert!((health[0].success_rate - 0.5).abs() < 1e-9);
        assert_eq!(health[0].last_error.as_deref(), Some("bad gateway"));
    }
}
