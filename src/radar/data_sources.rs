//! Polled upstream sources.
//!
//! A source only fetches and unpacks raw payloads. Field coercion happens
//! in the normalizer so every source shares the same rules.

use crate::radar::normalizer::{DexPairRow, PumpCoinRow, RawSourcePayload};
use crate::radar::types::{RestFeedKind, SourceConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio_retry::{strategy::ExponentialBackoff, Retry};
use tracing::{debug, instrument};

/// A source polled once per refresh cycle.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Name used in logs and health reports.
    fn name(&self) -> &str;

    /// Fetch the current batch. Any error counts as this source failing
    /// for the cycle.
    async fn fetch(&self) -> Result<Vec<RawSourcePayload>>;
}

/// JSON REST endpoint with retries and client-side rate limiting.
pub struct RestSource {
    config: SourceConfig,
    http_client: Client,
    limiter: DefaultDirectRateLimiter,
    request_timeout: Duration,
    retry_attempts: usize,
}

impl RestSource {
    pub fn new(
        config: SourceConfig,
        http_client: Client,
        requests_per_second: u32,
        request_timeout: Duration,
        retry_attempts: usize,
    ) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            config,
            http_client,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            request_timeout,
            retry_attempts,
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn fetch_once(&self) -> Result<Value> {
        self.limiter.until_ready().await;

        let response = self
            .http_client
            .get(&self.config.url)
            .header("Accept", "application/json")
            .timeout(self.request_timeout)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", self.config.name))?
            .error_for_status()
            .with_context(|| format!("{} returned an error status", self.config.name))?;

        response
            .json::<Value>()
            .await
            .with_context(|| format!("{} returned invalid JSON", self.config.name))
    }
}

#[async_trait]
impl TokenSource for RestSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self), fields(source = %self.config.name))]
    async fn fetch(&self) -> Result<Vec<RawSourcePayload>> {
        let retry_strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .take(self.retry_attempts);

        let body = Retry::spawn(retry_strategy, || self.fetch_once()).await?;
        let payloads = parse_body(self.config.feed, body);
        debug!("{} returned {} payloads", self.config.name, payloads.len());
        Ok(payloads)
    }
}

/// Unpack a response body. Accepts a bare array or an object wrapping it
/// under `coins`, `pairs` or `data`. Elements that do not deserialize are
/// skipped.
pub fn parse_body(feed: RestFeedKind, body: Value) -> Vec<RawSourcePayload> {
    let rows = match body {
        Value::Array(rows) => rows,
        Value::Object(mut map) => ["coins", "pairs", "data"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(rows)) => Some(rows),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    match feed {
        RestFeedKind::PumpCoins => decode_rows::<PumpCoinRow>(rows)
            .into_iter()
            .map(RawSourcePayload::PumpCoin)
            .collect(),
        RestFeedKind::DexPairs => decode_rows::<DexPairRow>(rows)
            .into_iter()
            .map(RawSourcePayload::DexPair)
            .collect(),
    }
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Vec<T> {
    let total = rows.len();
    let decoded: Vec<T> = rows
        .into_iter()
        .filter_map(|row| serde_json::from_value(row).ok())
        .collect();
    if decoded.len() < total {
        debug!("Skipped {} undecodable rows", total - decoded.len());
    }
    decoded
}
