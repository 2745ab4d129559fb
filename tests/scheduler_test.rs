//! Tests for the refresh scheduler with in-process sources

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tier_radar::radar::normalizer::{PumpCoinRow, PushChannel};
use tier_radar::radar::storage::ProgressionStore;
use tier_radar::radar::{
    CycleError, FeedStatus, RadarBuilder, RadarConfig, RawSourcePayload, RefreshScheduler, SqliteProgressionStore,
    TokenSource,
};
use tier_radar::types::Tier;

/// Serves a fixed batch until switched off.
struct SwitchableSource {
    online: AtomicBool,
    rows: Vec<PumpCoinRow>,
}

impl SwitchableSource {
    fn new(rows: Vec<PumpCoinRow>) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            rows,
        })
    }

    fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenSource for SwitchableSource {
    fn name(&self) -> &str {
        "switchable"
    }

    async fn fetch(&self) -> Result<Vec<RawSourcePayload>> {
        if self.online.load(Ordering::SeqCst) {
            Ok(self.rows.iter().cloned().map(RawSourcePayload::PumpCoin).collect())
        } else {
            Err(anyhow!("connection refused"))
        }
    }
}

/// Never answers within the fetch timeout.
struct HangingSource;

#[async_trait]
impl TokenSource for HangingSource {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn fetch(&self) -> Result<Vec<RawSourcePayload>> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(Vec::new())
    }
}

fn coins() -> Vec<PumpCoinRow> {
    let created = (Utc::now() - ChronoDuration::hours(1)).timestamp_millis();
    vec![
        serde_json::from_value(json!({ "mint": "GB1", "usd_market_cap": 2_500.0, "created_timestamp": created, "reply_count": 2 }))
            .unwrap(),
        serde_json::from_value(json!({ "mint": "FR1", "usd_market_cap": 12_000.0, "created_timestamp": created, "reply_count": 20 }))
            .unwrap(),
        serde_json::from_value(json!({ "name": "no mint" })).unwrap(),
    ]
}

#[tokio::test]
async fn test_failed_cycle_leaves_state_untouched() {
    let source = SwitchableSource::new(coins());
    let store = SqliteProgressionStore::in_memory().await.unwrap();
    let (mut scheduler, handle) =
        RefreshScheduler::new(RadarConfig::default(), vec![source.clone() as Arc<dyn TokenSource>], store).await;

    let report = scheduler.run_cycle_at(Utc::now()).await.unwrap();
    assert_eq!(report.admitted.len(), 2);
    assert_eq!(handle.snapshot().metrics.records_dropped, 1);
    let before = scheduler.state().clone();

    source.go_offline();
    let result = scheduler.run_cycle_at(Utc::now()).await;

    assert!(matches!(result, Err(CycleError::AllSourcesFailed { attempted: 1, .. })));
    assert_eq!(scheduler.state(), &before);

    let snapshot = handle.snapshot();
    assert!(matches!(snapshot.status, FeedStatus::NoDataAvailable { .. }));
    assert_eq!(snapshot.state.as_ref(), &before);
    assert!(snapshot.placeholder.is_empty());
    assert_eq!(snapshot.metrics.cycles_failed, 1);
}

#[tokio::test]
async fn test_slow_source_times_out_without_blocking_others() {
    let mut config = RadarConfig::default();
    config.scheduler.fetch_timeout_secs = 1;
    let sources: Vec<Arc<dyn TokenSource>> = vec![
        SwitchableSource::new(coins()) as Arc<dyn TokenSource>,
        Arc::new(HangingSource) as Arc<dyn TokenSource>,
    ];
    let store = SqliteProgressionStore::in_memory().await.unwrap();
    let (mut scheduler, handle) = RefreshScheduler::new(config, sources, store).await;

    let report = scheduler.run_cycle_at(Utc::now()).await.unwrap();
    assert_eq!(report.admitted.len(), 2);

    let health = handle.snapshot().source_health.clone();
    let hanging = health.iter().find(|h| h.source == "hanging").unwrap();
    assert_eq!(hanging.consecutive_failures, 1);
    assert!(hanging.last_error.as_deref().unwrap_or_default().contains("timed out"));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let store = SqliteProgressionStore::in_memory().await.unwrap();
    let sources: Vec<Arc<dyn TokenSource>> = vec![SwitchableSource::new(coins()) as Arc<dyn TokenSource>];
    let (mut scheduler, _handle) = RefreshScheduler::new(RadarConfig::default(), sources, store.clone()).await;
    scheduler.run_cycle_at(Utc::now()).await.unwrap();
    let saved = scheduler.state().clone();
    drop(scheduler);

    assert_eq!(store.load().await.unwrap().as_ref(), Some(&saved));

    let (restarted, handle) = RefreshScheduler::new(RadarConfig::default(), Vec::new(), store).await;
    assert_eq!(restarted.state(), &saved);
    assert_eq!(handle.snapshot().state.as_ref(), &saved);
    assert_eq!(saved.roster(Tier::FastestRunner)[0].identity(), "FR1");
}

#[tokio::test]
async fn test_running_scheduler_serves_refetch_and_shutdown() {
    let store = SqliteProgressionStore::in_memory().await.unwrap();
    let sources: Vec<Arc<dyn TokenSource>> = vec![SwitchableSource::new(coins()) as Arc<dyn TokenSource>];
    let (scheduler, handle) = RadarBuilder::new()
        .with_refresh_interval(3_600)
        .build_with(sources, store)
        .await;
    let task = tokio::spawn(scheduler.run());

    let report = handle.refetch().await.unwrap();
    assert!(report.is_quiet() || report.admitted.len() == 2);
    assert_eq!(handle.snapshot().state.total_tracked(), 2);

    handle.shutdown().await;
    task.await.unwrap();
    assert_eq!(handle.refetch().await, Err(CycleError::SchedulerClosed));
}

#[tokio::test]
async fn test_new_push_token_triggers_cycle() {
    let mut config = RadarConfig::default();
    config.scheduler.refresh_interval_secs = 3_600;
    config.scheduler.min_push_cycle_interval_secs = 0;
    config.scheduler.sol_usd_price = Some(150.0);
    let store = SqliteProgressionStore::in_memory().await.unwrap();
    let (scheduler, handle) = RefreshScheduler::new(config, Vec::new(), store).await;
    let mut snapshots = handle.subscribe();
    let task = tokio::spawn(scheduler.run());

    let event = serde_json::from_value(json!({ "mint": "PUSHED", "txType": "create", "marketCapSol": 20.0 })).unwrap();
    handle
        .push(RawSourcePayload::Push { channel: PushChannel::WebSocket, event })
        .await
        .unwrap();

    let admitted = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if snapshots.borrow_and_update().state.is_tracked("PUSHED") {
                return true;
            }
            if snapshots.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false);

    assert!(admitted);
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, FeedStatus::Live);
    assert_eq!(snapshot.state.find("PUSHED").unwrap().tier, Tier::GambleBox);

    handle.shutdown().await;
    task.await.unwrap();
}
