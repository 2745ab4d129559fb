//! Main entry point for the tier radar service
//!
//! Polls the configured sources, listens to the push feed and logs tier
//! changes until interrupted.

use anyhow::Result;
use tier_radar::radar::{PushFeed, RadarBuilder, RadarConfig};
use tier_radar::types::Tier;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => RadarConfig::from_json_file(&path)?,
        None => RadarConfig::default(),
    };
    info!("Starting tier radar with {} REST sources", config.sources.len());

    let push_config = config.push.clone();
    let (scheduler, handle) = RadarBuilder::from_config(config).build().await?;

    let scheduler_task = tokio::spawn(scheduler.run());
    let push_task = tokio::spawn(PushFeed::new(push_config, handle.clone()).run());

    let mut snapshots = handle.subscribe();
    let watcher = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            info!(
                "Status {:?}: {} gamble box, {} fastest runner, {} highest gainer, {} archived",
                snapshot.status,
                snapshot.state.gamble_box.len(),
                snapshot.state.fastest_runner.len(),
                snapshot.state.highest_gainer.len(),
                snapshot.state.archive.len()
            );
            for tier in Tier::ALL {
                let featured: Vec<&str> = snapshot.featured(tier).iter().map(|token| token.identity()).collect();
                if !featured.is_empty() {
                    info!("Featured {}: {}", tier, featured.join(", "));
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    handle.shutdown().await;
    if let Err(e) = scheduler_task.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    push_task.abort();
    watcher.abort();

    Ok(())
}
