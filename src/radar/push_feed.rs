//! Websocket push feed.
//!
//! Subscribes to new-token and migration events and forwards them to the
//! scheduler. Reconnects follow a [`RetryPolicy`]; when an endpoint runs out
//! of attempts the next configured endpoint takes over, and when all of them
//! are exhausted the radar carries on with REST polling only.

use crate::radar::normalizer::{PushChannel, PushEvent, RawSourcePayload};
use crate::radar::retry::{ConnectionEvent, ConnectionState, ConnectionStateMachine, RetryPolicy};
use crate::radar::scheduler::RadarHandle;
use crate::radar::types::PushConfig;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, instrument, warn};

/// Why a push feed stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFeedExit {
    /// The scheduler is gone
    SchedulerClosed,
    /// Every endpoint ran out of reconnect attempts
    Exhausted { endpoints_tried: usize, attempts: u32 },
}

/// How one connection ended.
enum StreamEnd {
    Disconnected,
    SchedulerClosed,
}

pub struct PushFeed {
    config: PushConfig,
    handle: RadarHandle,
}

impl PushFeed {
    pub fn new(config: PushConfig, handle: RadarHandle) -> Self {
        Self { config, handle }
    }

    /// Run until the scheduler closes or every endpoint is exhausted.
    pub async fn run(self) -> PushFeedExit {
        let policy = RetryPolicy::from_config(&self.config);
        let mut endpoints_tried = 0;
        let mut attempts = 0;

        for endpoint in &self.config.endpoints {
            let mut machine = ConnectionStateMachine::new(policy.clone());
            endpoints_tried += 1;
            info!("Push feed using endpoint {}", endpoint);

            loop {
                machine.on_event(ConnectionEvent::Connect);
                attempts += 1;

                match self.stream_endpoint(endpoint, &mut machine).await {
                    Ok(StreamEnd::SchedulerClosed) => return PushFeedExit::SchedulerClosed,
                    Ok(StreamEnd::Disconnected) => {
                        machine.on_event(ConnectionEvent::Closed);
                    }
                    Err(e) => {
                        warn!("Push connection to {} failed: {:#}", endpoint, e);
                        machine.on_event(ConnectionEvent::Failed);
                    }
                }

                match machine.state().clone() {
                    ConnectionState::Backoff { attempt, delay } => {
                        debug!("Reconnecting to {} in {:?} (attempt {})", endpoint, delay, attempt);
                        sleep(delay).await;
                        machine.on_event(ConnectionEvent::BackoffElapsed);
                    }
                    ConnectionState::Exhausted => {
                        warn!("Push endpoint {} exhausted after {} attempts", endpoint, machine.failures());
                        break;
                    }
                    other => {
                        debug!("Unexpected connection state {:?}, resetting", other);
                        machine.reset();
                    }
                }

                if self.handle.is_closed() {
                    return PushFeedExit::SchedulerClosed;
                }
            }
        }

        warn!("All push endpoints exhausted, continuing with REST polling only");
        PushFeedExit::Exhausted { endpoints_tried, attempts }
    }

    #[instrument(skip(self, machine))]
    async fn stream_endpoint(&self, endpoint: &str, machine: &mut ConnectionStateMachine) -> Result<StreamEnd> {
        let (ws_stream, response) = timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            connect_async(endpoint),
        )
        .await
        .context("Connection timeout")?
        .context("Failed to connect to push endpoint")?;

        info!("Connected to {} (HTTP {})", endpoint, response.status());
        machine.on_event(ConnectionEvent::Established);

        let (mut sender, mut receiver) = ws_stream.split();
        for method in &self.config.subscriptions {
            sender
                .send(Message::Text(subscription_message(method)))
                .await
                .with_context(|| format!("Failed to send {} subscription", method))?;
        }

        while let Some(message) = receiver.next().await {
            let text = match message.context("Push stream error")? {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!("Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Ping(payload) => {
                    sender.send(Message::Pong(payload)).await.context("Failed to answer ping")?;
                    continue;
                }
                Message::Close(frame) => {
                    info!("Push endpoint {} closed the connection: {:?}", endpoint, frame);
                    return Ok(StreamEnd::Disconnected);
                }
                _ => continue,
            };

            for event in parse_push_message(&text) {
                let payload = RawSourcePayload::Push {
                    channel: PushChannel::WebSocket,
                    event,
                };
                if self.handle.push(payload).await.is_err() {
                    return Ok(StreamEnd::SchedulerClosed);
                }
            }
        }

        Ok(StreamEnd::Disconnected)
    }
}

fn subscription_message(method: &str) -> String {
    json!({ "method": method }).to_string()
}

/// Decode one push frame into events. Acknowledgements, malformed JSON and
/// events without a mint yield nothing.
pub fn parse_push_message(text: &str) -> Vec<PushEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Dropping malformed push message: {}", e);
            return Vec::new();
        }
    };

    let candidates = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    candidates
        .into_iter()
        .filter(|item| item.get("mint").map_or(false, Value::is_string))
        .filter_map(|item| serde_json::from_value::<PushEvent>(item).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radar::normalizer::PushEventKind;
    use crate::radar::storage::SqliteProgressionStore;
    use crate::radar::{RadarConfig, RefreshScheduler};

    #[test]
    fn test_parse_create_event() {
        let events = parse_push_message(
            r#"{"signature":"sig","mint":"MintA","txType":"create","name":"A","symbol":"AAA","marketCapSol":31.5}"#,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].mint.as_deref(), Some("MintA"));
        assert_eq!(events[0].kind(), PushEventKind::NewToken);
    }

    #[test]
    fn test_parse_ignores_acks_and_garbage() {
        assert!(parse_push_message(r#"{"message":"Successfully subscribed to token creation events."}"#).is_empty());
        assert!(parse_push_message("not json at all").is_empty());
        assert!(parse_push_message(r#"{"mint": 42}"#).is_empty());
    }

    #[test]
    fn test_parse_batched_events() {
        let events = parse_push_message(r#"[{"mint":"A","txType":"buy"},{"nope":true},{"mint":"B","txType":"migrate"}]"#);
        let kinds: Vec<PushEventKind> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![PushEventKind::Trade, PushEventKind::Migration]);
    }

    #[tokio::test]
    async fn test_unreachable_endpoints_fail_over_then_exhaust() {
        let store = SqliteProgressionStore::in_memory().await.unwrap();
        let (_scheduler, handle) = RefreshScheduler::new(RadarConfig::default(), Vec::new(), store).await;
        let config = PushConfig {
            endpoints: vec!["ws://127.0.0.1:1".to_string(), "ws://127.0.0.1:2".to_string()],
            max_attempts: 2,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            jitter_ms: 0,
            connect_timeout_secs: 2,
            ..PushConfig::default()
        };

        let exit = timeout(Duration::from_secs(20), PushFeed::new(config, handle).run())
            .await
            .unwrap();

        assert_eq!(exit, PushFeedExit::Exhausted { endpoints_tried: 2, attempts: 4 });
    }

    #[tokio::test]
    async fn test_feed_stops_when_scheduler_is_gone() {
        let store = SqliteProgressionStore::in_memory().await.unwrap();
        let (scheduler, handle) = RefreshScheduler::new(RadarConfig::default(), Vec::new(), store).await;
        drop(scheduler);
        let config = PushConfig {
            endpoints: vec!["ws://127.0.0.1:1".to_string()],
            max_attempts: 3,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            jitter_ms: 0,
            connect_timeout_secs: 2,
            ..PushConfig::default()
        };

        let exit = timeout(Duration::from_secs(20), PushFeed::new(config, handle).run())
            .await
            .unwrap();

        assert_eq!(exit, PushFeedExit::SchedulerClosed);
    }

    #[test]
    fn test_subscription_message() {
        assert_eq!(subscription_message("subscribeNewToken"), r#"{"method":"subscribeNewToken"}"#);
    }
}
