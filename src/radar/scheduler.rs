//! Refresh scheduler.
//!
//! One task owns the [`ProgressionTracker`]. Refetch requests and push
//! events arrive as commands and are handled one at a time, so a cycle's
//! mutation always completes before the next snapshot is published.

use crate::radar::aggregator::{aggregate_outcomes, merge_records, SourceOutcome};
use crate::radar::circuit_breaker::CircuitBreaker;
use crate::radar::classifier::TierClassifier;
use crate::radar::data_sources::TokenSource;
use crate::radar::normalizer::{normalize, normalize_batch, NormalizeContext, RawSourcePayload};
use crate::radar::progression::ProgressionTracker;
use crate::radar::storage::{load_or_empty, ProgressionStore};
use crate::radar::synthetic::generate_batch;
use crate::radar::types::{
    CycleError, CycleReport, DashboardSnapshot, FeedStatus, RadarConfig, RadarMetrics, SourceFailure,
};
use crate::types::{ProgressionState, TokenRecord};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use moka::future::Cache;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Name the push cache reports under when it joins a cycle.
pub const PUSH_SOURCE_NAME: &str = "push";

/// Requests handled by the scheduler task.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run a cycle now and report the outcome
    Refetch {
        reply: oneshot::Sender<Result<CycleReport, CycleError>>,
    },
    /// A push event from a streaming source
    Push(RawSourcePayload),
    Shutdown,
}

/// Cheap, cloneable access to a running scheduler.
#[derive(Clone)]
pub struct RadarHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    snapshots: watch::Receiver<Arc<DashboardSnapshot>>,
}

impl RadarHandle {
    /// Run a cycle immediately and wait for its result.
    pub async fn refetch(&self) -> Result<CycleReport, CycleError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SchedulerCommand::Refetch { reply })
            .await
            .map_err(|_| CycleError::SchedulerClosed)?;
        response.await.map_err(|_| CycleError::SchedulerClosed)?
    }

    /// Hand a push payload to the scheduler.
    pub async fn push(&self, payload: RawSourcePayload) -> Result<(), CycleError> {
        self.commands
            .send(SchedulerCommand::Push(payload))
            .await
            .map_err(|_| CycleError::SchedulerClosed)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<DashboardSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver that wakes on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DashboardSnapshot>> {
        self.snapshots.clone()
    }

    pub async fn shutdown(&self) {
        if self.commands.send(SchedulerCommand::Shutdown).await.is_err() {
            debug!("Scheduler already stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Drives aggregation and progression on a timer and on demand.
pub struct RefreshScheduler {
    config: RadarConfig,
    tracker: ProgressionTracker,
    sources: Vec<Arc<dyn TokenSource>>,
    store: Arc<dyn ProgressionStore>,
    breaker: CircuitBreaker,
    push_cache: Cache<String, TokenRecord>,
    /// Identities pushed since the previous cycle
    pushed_since_cycle: BTreeSet<String>,
    metrics: RadarMetrics,
    status: FeedStatus,
    last_cycle_at: Option<DateTime<Utc>>,
    last_cycle_instant: Option<Instant>,
    pending_push_cycle: bool,
    placeholder: Vec<TokenRecord>,
    rotation: usize,
    commands: mpsc::Receiver<SchedulerCommand>,
    snapshots: watch::Sender<Arc<DashboardSnapshot>>,
}

impl RefreshScheduler {
    /// Create a scheduler, restoring saved progression state from `store`.
    pub async fn new(
        config: RadarConfig,
        sources: Vec<Arc<dyn TokenSource>>,
        store: Arc<dyn ProgressionStore>,
    ) -> (Self, RadarHandle) {
        let state = load_or_empty(store.as_ref()).await;
        Self::with_state(config, sources, store, state)
    }

    /// Create a scheduler around an explicit starting state.
    pub fn with_state(
        config: RadarConfig,
        sources: Vec<Arc<dyn TokenSource>>,
        store: Arc<dyn ProgressionStore>,
        state: ProgressionState,
    ) -> (Self, RadarHandle) {
        let scheduler_config = &config.scheduler;
        let (command_tx, command_rx) = mpsc::channel(scheduler_config.command_buffer.max(1));
        let initial = DashboardSnapshot::starting(Arc::new(state.clone()), config.progression.featured_slots);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));

        let breaker = CircuitBreaker::new(
            scheduler_config.circuit_breaker_failure_threshold,
            scheduler_config.circuit_breaker_cooldown_seconds,
            scheduler_config.source_success_sample_size,
        );
        let push_cache = Cache::builder()
            .max_capacity(scheduler_config.push_cache_capacity)
            .time_to_live(Duration::from_secs(scheduler_config.push_cache_ttl_secs))
            .build();
        let tracker = ProgressionTracker::new(
            state,
            config.progression.clone(),
            TierClassifier::new(config.tiers.clone()),
        );

        let scheduler = Self {
            config,
            tracker,
            sources,
            store,
            breaker,
            push_cache,
            pushed_since_cycle: BTreeSet::new(),
            metrics: RadarMetrics::default(),
            status: FeedStatus::Starting,
            last_cycle_at: None,
            last_cycle_instant: None,
            pending_push_cycle: false,
            placeholder: Vec::new(),
            rotation: 0,
            commands: command_rx,
            snapshots: snapshot_tx,
        };
        let handle = RadarHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        };

        (scheduler, handle)
    }

    pub fn state(&self) -> &ProgressionState {
        self.tracker.state()
    }

    pub fn metrics(&self) -> &RadarMetrics {
        &self.metrics
    }

    /// Run until shutdown or until every handle is dropped. The first
    /// cycle starts immediately.
    pub async fn run(mut self) {
        let interval = Duration::from_secs(self.config.scheduler.refresh_interval_secs.max(1));
        let debounce = Duration::from_secs(self.config.scheduler.min_push_cycle_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Refresh scheduler started: {} sources, every {:?}",
            self.sources.len(),
            interval
        );

        loop {
            let push_deadline = self
                .last_cycle_instant
                .map(|at| at + debounce)
                .unwrap_or_else(Instant::now);

            tokio::select! {
                _ = ticker.tick() => {
                    self.run_logged_cycle().await;
                }
                _ = tokio::time::sleep_until(push_deadline), if self.pending_push_cycle => {
                    debug!("Running push-triggered cycle");
                    self.run_logged_cycle().await;
                }
                command = self.commands.recv() => match command {
                    Some(SchedulerCommand::Refetch { reply }) => {
                        let result = self.run_cycle_at(Utc::now()).await;
                        if reply.send(result).is_err() {
                            debug!("Refetch caller went away before the cycle finished");
                        }
                    }
                    Some(SchedulerCommand::Push(payload)) => {
                        if self.ingest_push(payload).await {
                            self.pending_push_cycle = true;
                        }
                    }
                    Some(SchedulerCommand::Shutdown) | None => break,
                },
            }
        }

        info!("Refresh scheduler stopped");
    }

    async fn run_logged_cycle(&mut self) {
        if let Err(e) = self.run_cycle_at(Utc::now()).await {
            warn!("Refresh cycle failed: {}", e);
        }
    }

    /// Normalize a push payload into the push cache. Returns true when it
    /// announces a token that is neither tracked, archived nor already seen.
    pub async fn ingest_push(&mut self, payload: RawSourcePayload) -> bool {
        self.metrics.push_events += 1;
        let ctx = NormalizeContext::new(Utc::now(), self.config.scheduler.sol_usd_price);

        let Some(record) = normalize(&payload, &ctx) else {
            self.metrics.records_dropped += 1;
            debug!("Dropped push payload without identity");
            return false;
        };

        let identity = record.identity.clone();
        let previous = self.push_cache.get(&identity).await;
        let state = self.tracker.state();
        let is_new = previous.is_none() && !state.is_tracked(&identity) && !state.is_archived(&identity);

        let merged = match previous {
            Some(previous) => merge_records(&previous, &record),
            None => record,
        };
        self.push_cache.insert(identity.clone(), merged).await;
        self.pushed_since_cycle.insert(identity.clone());

        if is_new {
            debug!("Push announced new token {}", identity);
        }
        is_new
    }

    /// Run one full cycle with `now` as the clock.
    ///
    /// On failure the progression state is left as it was and the published
    /// status explains why.
    #[instrument(skip(self))]
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        self.pending_push_cycle = false;
        self.last_cycle_instant = Some(Instant::now());

        let mut outcomes = self.fetch_sources(now).await;
        if let Some(push) = self.push_outcome().await {
            outcomes.push(push);
        }

        match aggregate_outcomes(outcomes, now) {
            Ok(records) => {
                let records: Vec<TokenRecord> = records.into();
                let report = self.tracker.run_cycle(&records, now);

                self.metrics.record_cycle(&report);
                self.status = FeedStatus::Live;
                self.placeholder.clear();
                self.last_cycle_at = Some(now);
                self.rotation = self.rotation.wrapping_add(1);
                self.publish();

                if let Err(e) = self.store.save(self.tracker.state()).await {
                    error!("Failed to persist progression state: {:#}", e);
                }
                Ok(report)
            }
            Err(err) => {
                self.metrics.cycles_failed += 1;
                let reason = err.to_string();

                if self.config.scheduler.synthetic_fallback {
                    let batch_size = self.config.scheduler.synthetic_batch_size;
                    self.placeholder = generate_batch(&mut rand::thread_rng(), batch_size, now);
                    self.status = FeedStatus::SyntheticFallback { reason };
                } else {
                    self.placeholder.clear();
                    self.status = FeedStatus::NoDataAvailable { reason };
                }
                self.publish();
                Err(err)
            }
        }
    }

    /// Fetch every available source concurrently, each bounded by the
    /// fetch timeout.
    async fn fetch_sources(&mut self, now: DateTime<Utc>) -> Vec<SourceOutcome> {
        let timeout = Duration::from_secs(self.config.scheduler.fetch_timeout_secs);
        let mut outcomes = Vec::with_capacity(self.sources.len() + 1);
        let mut active = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            if self.breaker.is_available(source.name()) {
                active.push(Arc::clone(source));
            } else {
                outcomes.push(SourceOutcome::Failed(SourceFailure {
                    source: source.name().to_string(),
                    reason: "circuit open, cooling down".to_string(),
                }));
            }
        }

        let fetches = active.into_iter().map(|source| async move {
            let result = tokio::time::timeout(timeout, source.fetch()).await;
            (source, result)
        });

        let ctx = NormalizeContext::new(now, self.config.scheduler.sol_usd_price);
        for (source, result) in join_all(fetches).await {
            let name = source.name().to_string();
            let reason = match result {
                Ok(Ok(payloads)) => {
                    let (records, dropped) = normalize_batch(&payloads, &ctx);
                    self.metrics.records_dropped += dropped as u64;
                    self.breaker.record_success(&name);
                    outcomes.push(SourceOutcome::Fetched { source: name, records });
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!("timed out after {:?}", timeout),
            };

            self.metrics.source_failures += 1;
            self.breaker.record_failure(&name, &reason);
            outcomes.push(SourceOutcome::Failed(SourceFailure { source: name, reason }));
        }

        outcomes
    }

    /// Push records received since the previous cycle as one more source.
    /// Older cache entries only serve novelty checks and never count as
    /// fresh data.
    async fn push_outcome(&mut self) -> Option<SourceOutcome> {
        let pushed = std::mem::take(&mut self.pushed_since_cycle);
        let mut records = Vec::with_capacity(pushed.len());
        for identity in &pushed {
            if let Some(record) = self.push_cache.get(identity).await {
                records.push(record);
            }
        }
        if records.is_empty() {
            return None;
        }
        Some(SourceOutcome::Fetched {
            source: PUSH_SOURCE_NAME.to_string(),
            records,
        })
    }

    fn publish(&self) {
        let snapshot = DashboardSnapshot {
            state: Arc::new(self.tracker.state().clone()),
            status: self.status.clone(),
            last_cycle_at: self.last_cycle_at,
            source_health: self.breaker.health(),
            metrics: self.metrics.clone(),
            placeholder: self.placeholder.clone(),
            featured_slots: self.config.progression.featured_slots,
            rotation: self.rotation,
        };
        self.snapshots.send_replace(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radar::normalizer::PumpCoinRow;
    use crate::radar::storage::SqliteProgressionStore;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedSource {
        name: String,
        rows: Vec<PumpCoinRow>,
    }

    #[async_trait]
    impl TokenSource for FixedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self) -> Result<Vec<RawSourcePayload>> {
            Ok(self.rows.iter().cloned().map(RawSourcePayload::PumpCoin).collect())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl TokenSource for BrokenSource {
        fn name(&self) -> &str {
            "broken"
        }

        async fn fetch(&self) -> Result<Vec<RawSourcePayload>> {
            Err(anyhow!("503 Service Unavailable"))
        }
    }

    fn coin(mint: &str, usd_market_cap: f64, created: DateTime<Utc>) -> PumpCoinRow {
        serde_json::from_value(json!({
            "mint": mint,
            "usd_market_cap": usd_market_cap,
            "created_timestamp": created.timestamp_millis(),
            "reply_count": 0,
        }))
        .unwrap()
    }

    fn broken() -> Vec<Arc<dyn TokenSource>> {
        vec![Arc::new(BrokenSource)]
    }

    async fn scheduler(sources: Vec<Arc<dyn TokenSource>>, config: RadarConfig) -> (RefreshScheduler, RadarHandle) {
        let store = SqliteProgressionStore::in_memory().await.unwrap();
        RefreshScheduler::new(config, sources, store).await
    }

    #[tokio::test]
    async fn test_cycle_publishes_snapshot() {
        let now = Utc::now();
        let source: Arc<dyn TokenSource> = Arc::new(FixedSource {
            name: "pump".into(),
            rows: vec![coin("A", 2_000.0, now - chrono::Duration::hours(1))],
        });
        let broken: Arc<dyn TokenSource> = Arc::new(BrokenSource);
        let (mut scheduler, handle) = scheduler(vec![source, broken], RadarConfig::default()).await;

        let report = scheduler.run_cycle_at(now).await.unwrap();
        assert_eq!(report.admitted.len(), 1);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, FeedStatus::Live);
        assert_eq!(snapshot.state.gamble_box.len(), 1);
        assert_eq!(snapshot.source_health.len(), 2);
        assert_eq!(snapshot.metrics.source_failures, 1);
    }

    #[tokio::test]
    async fn test_all_sources_failing_keeps_state() {
        let (mut scheduler, handle) = scheduler(broken(), RadarConfig::default()).await;

        let result = scheduler.run_cycle_at(Utc::now()).await;
        assert!(matches!(result, Err(CycleError::AllSourcesFailed { attempted: 1, .. })));

        let snapshot = handle.snapshot();
        assert!(matches!(snapshot.status, FeedStatus::NoDataAvailable { .. }));
        assert!(snapshot.placeholder.is_empty());
        assert_eq!(snapshot.state.total_tracked(), 0);
    }

    #[tokio::test]
    async fn test_synthetic_fallback_is_labeled_and_untracked() {
        let mut config = RadarConfig::default();
        config.scheduler.synthetic_fallback = true;
        let (mut scheduler, handle) = scheduler(broken(), config).await;

        assert!(scheduler.run_cycle_at(Utc::now()).await.is_err());

        let snapshot = handle.snapshot();
        assert!(matches!(snapshot.status, FeedStatus::SyntheticFallback { .. }));
        assert_eq!(snapshot.placeholder.len(), 9);
        assert!(snapshot.placeholder.iter().all(|record| record.is_synthetic()));
        assert_eq!(snapshot.state.total_tracked(), 0);
    }

    #[tokio::test]
    async fn test_push_novelty() {
        let (mut scheduler, _handle) = scheduler(Vec::new(), RadarConfig::default()).await;
        let payload = RawSourcePayload::Push {
            channel: crate::radar::normalizer::PushChannel::WebSocket,
            event: serde_json::from_value(json!({ "mint": "NEW", "txType": "create" })).unwrap(),
        };

        assert!(scheduler.ingest_push(payload.clone()).await);
        assert!(!scheduler.ingest_push(payload).await);
        assert_eq!(scheduler.metrics().push_events, 2);
    }

    #[tokio::test]
    async fn test_push_cache_feeds_cycle_without_rest_sources() {
        let (mut scheduler, _handle) = scheduler(Vec::new(), RadarConfig::default()).await;
        assert!(matches!(
            scheduler.run_cycle_at(Utc::now()).await,
            Err(CycleError::AllSourcesFailed { attempted: 0, .. })
        ));

        let payload = RawSourcePayload::Push {
            channel: crate::radar::normalizer::PushChannel::WebSocket,
            event: serde_json::from_value(json!({ "mint": "NEW", "txType": "create" })).unwrap(),
        };
        scheduler.ingest_push(payload).await;

        // No market cap without a SOL rate: the token is seen but not admitted
        let report = scheduler.run_cycle_at(Utc::now()).await.unwrap();
        assert!(report.admitted.is_empty());

        // Nothing pushed since: the cached record is not fresh data
        assert!(matches!(
            scheduler.run_cycle_at(Utc::now()).await,
            Err(CycleError::AllSourcesFailed { attempted: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_push_cache_does_not_hide_source_failure() {
        let mut config = RadarConfig::default();
        config.scheduler.sol_usd_price = Some(150.0);
        let (mut scheduler, handle) = scheduler(broken(), config).await;

        let payload = RawSourcePayload::Push {
            channel: crate::radar::normalizer::PushChannel::WebSocket,
            event: serde_json::from_value(json!({ "mint": "P", "txType": "create", "marketCapSol": 10.0 })).unwrap(),
        };
        scheduler.ingest_push(payload).await;

        let report = scheduler.run_cycle_at(Utc::now()).await.unwrap();
        assert_eq!(report.admitted.len(), 1);
        assert_eq!(handle.snapshot().status, FeedStatus::Live);

        let result = scheduler.run_cycle_at(Utc::now()).await;
        assert!(matches!(result, Err(CycleError::AllSourcesFailed { attempted: 1, .. })));
        assert!(matches!(handle.snapshot().status, FeedStatus::NoDataAvailable { .. }));
        assert!(scheduler.state().is_tracked("P"));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_scheduler() {
        let (scheduler, handle) = scheduler(Vec::new(), RadarConfig::default()).await;
        drop(scheduler);

        assert_eq!(handle.refetch().await, Err(CycleError::SchedulerClosed));
        assert!(handle.is_closed());
    }
}
