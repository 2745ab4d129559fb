//! Source normalizer: raw feed payloads into canonical token records.
//!
//! Each upstream shape has its own adapter. Numeric fields are coerced
//! defensively and anything unusable becomes `None`. Payloads without an
//! identity are dropped rather than failing the batch.

use crate::types::{SourceKind, TokenRecord, WindowedMetrics};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Timestamps above this are taken to be milliseconds.
const MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

/// One coin row from a bonding-curve REST listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PumpCoinRow {
    pub mint: Option<String>,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub created_timestamp: Option<Value>,
    pub usd_market_cap: Option<Value>,
    /// Denominated in SOL
    pub market_cap: Option<Value>,
    pub twitter: Option<String>,
    pub website: Option<String>,
    pub telegram: Option<String>,
    pub reply_count: Option<Value>,
    pub complete: Option<Value>,
    pub is_currently_live: Option<Value>,
    pub total_supply: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DexBaseToken {
    pub address: Option<String>,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DexLiquidity {
    pub usd: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DexSocial {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DexWebsite {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DexInfo {
    pub socials: Vec<DexSocial>,
    pub websites: Vec<DexWebsite>,
}

/// One pair row from a DEX aggregator listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DexPairRow {
    pub base_token: Option<DexBaseToken>,
    pub pair_created_at: Option<Value>,
    pub market_cap: Option<Value>,
    pub fdv: Option<Value>,
    pub price_usd: Option<Value>,
    pub volume: HashMap<String, Value>,
    pub price_change: HashMap<String, Value>,
    pub liquidity: Option<DexLiquidity>,
    pub info: Option<DexInfo>,
}

/// A push event as delivered over websocket or SSE.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PushEvent {
    pub mint: Option<String>,
    pub tx_type: Option<String>,
    pub name: Option<String>,
    pub symbol: Option<String>,
    /// Denominated in SOL
    pub market_cap_sol: Option<Value>,
    pub timestamp: Option<Value>,
    pub twitter: Option<String>,
    pub website: Option<String>,
    pub telegram: Option<String>,
    pub reply_count: Option<Value>,
}

/// What a push event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEventKind {
    NewToken,
    Trade,
    Migration,
    Unknown,
}

impl PushEvent {
    pub fn kind(&self) -> PushEventKind {
        match self.tx_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("create") | Some("newtoken") => PushEventKind::NewToken,
            Some("buy") | Some("sell") | Some("trade") => PushEventKind::Trade,
            Some("migrate") | Some("migration") | Some("complete") => PushEventKind::Migration,
            _ => PushEventKind::Unknown,
        }
    }
}

/// Transport a push event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushChannel {
    WebSocket,
    Sse,
}

/// Raw upstream payload, tagged by source shape.
#[derive(Debug, Clone)]
pub enum RawSourcePayload {
    PumpCoin(PumpCoinRow),
    DexPair(DexPairRow),
    Push { channel: PushChannel, event: PushEvent },
}

impl RawSourcePayload {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            RawSourcePayload::PumpCoin(_) => SourceKind::PumpRest,
            RawSourcePayload::DexPair(_) => SourceKind::DexRest,
            RawSourcePayload::Push { channel: PushChannel::WebSocket, .. } => SourceKind::WebSocketPush,
            RawSourcePayload::Push { channel: PushChannel::Sse, .. } => SourceKind::SsePush,
        }
    }
}

/// Values shared by every adapter in one normalization pass.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext {
    pub observed_at: DateTime<Utc>,
    pub sol_usd_price: Option<f64>,
}

impl NormalizeContext {
    pub fn new(observed_at: DateTime<Utc>, sol_usd_price: Option<f64>) -> Self {
        Self { observed_at, sol_usd_price }
    }

    fn sol_to_usd(&self, sol: Option<f64>) -> Option<f64> {
        let rate = self.sol_usd_price.filter(|rate| rate.is_finite() && *rate > 0.0)?;
        sol.map(|amount| amount * rate)
    }
}

/// Normalize one payload, or `None` if it has no usable identity.
pub fn normalize(payload: &RawSourcePayload, ctx: &NormalizeContext) -> Option<TokenRecord> {
    match payload {
        RawSourcePayload::PumpCoin(row) => normalize_pump_coin(row, ctx),
        RawSourcePayload::DexPair(row) => normalize_dex_pair(row, ctx),
        RawSourcePayload::Push { channel, event } => normalize_push_event(*channel, event, ctx),
    }
}

/// Normalize a batch. Returns the records and how many payloads were dropped.
pub fn normalize_batch(payloads: &[RawSourcePayload], ctx: &NormalizeContext) -> (Vec<TokenRecord>, usize) {
    let mut records = Vec::with_capacity(payloads.len());
    let mut dropped = 0;

    for payload in payloads {
        match normalize(payload, ctx) {
            Some(record) => records.push(record),
            None => {
                dropped += 1;
                debug!("Dropped {} payload without identity", payload.source_kind().as_str());
            }
        }
    }

    (records, dropped)
}

fn normalize_pump_coin(row: &PumpCoinRow, ctx: &NormalizeContext) -> Option<TokenRecord> {
    let identity = clean_text(row.mint.as_deref())?;
    let mut record = TokenRecord::new(identity, SourceKind::PumpRest, ctx.observed_at);

    record.display_name = clean_text(row.name.as_deref());
    record.symbol = clean_text(row.symbol.as_deref());
    record.created_at = row.created_timestamp.as_ref().and_then(coerce_timestamp);
    record.market_cap_usd = row
        .usd_market_cap
        .as_ref()
        .and_then(coerce_non_negative)
        .or_else(|| ctx.sol_to_usd(row.market_cap.as_ref().and_then(coerce_non_negative)));
    record.social_links.twitter = clean_text(row.twitter.as_deref());
    record.social_links.website = clean_text(row.website.as_deref());
    record.social_links.telegram = clean_text(row.telegram.as_deref());
    record.engagement_count = row.reply_count.as_ref().and_then(coerce_u64);
    record.is_complete = row.complete.as_ref().and_then(coerce_bool);
    record.is_live = row.is_currently_live.as_ref().and_then(coerce_bool);
    if let Some(supply) = row
        .total_supply
        .as_ref()
        .and_then(coerce_non_negative)
        .filter(|supply| *supply > 0.0)
    {
        record.total_supply = supply;
        record.supply_reported = true;
    }

    Some(record)
}

fn normalize_dex_pair(row: &DexPairRow, ctx: &NormalizeContext) -> Option<TokenRecord> {
    let base = row.base_token.as_ref()?;
    let identity = clean_text(base.address.as_deref())?;
    let mut record = TokenRecord::new(identity, SourceKind::DexRest, ctx.observed_at);

    record.display_name = clean_text(base.name.as_deref());
    record.symbol = clean_text(base.symbol.as_deref());
    record.created_at = row.pair_created_at.as_ref().and_then(coerce_timestamp);

    let price_usd = row.price_usd.as_ref().and_then(coerce_non_negative);
    record.market_cap_usd = row
        .market_cap
        .as_ref()
        .and_then(coerce_non_negative)
        .or_else(|| row.fdv.as_ref().and_then(coerce_non_negative))
        .or_else(|| price_usd.map(|price| price * record.total_supply));

    record.volume = windowed(&row.volume);
    record.price_change = windowed(&row.price_change);
    record.liquidity_usd = row
        .liquidity
        .as_ref()
        .and_then(|liquidity| liquidity.usd.as_ref())
        .and_then(coerce_non_negative);

    if let Some(info) = &row.info {
        for social in &info.socials {
            let url = clean_text(social.url.as_deref());
            match social.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
                Some("twitter") | Some("x") => record.social_links.twitter = url.or(record.social_links.twitter.take()),
                Some("telegram") => record.social_links.telegram = url.or(record.social_links.telegram.take()),
                _ => {}
            }
        }
        record.social_links.website = info
            .websites
            .iter()
            .find_map(|site| clean_text(site.url.as_deref()));
    }

    // Quoted on a DEX means it left the bonding curve and is trading
    record.is_complete = Some(true);
    record.is_live = Some(true);

    Some(record)
}

fn normalize_push_event(channel: PushChannel, event: &PushEvent, ctx: &NormalizeContext) -> Option<TokenRecord> {
    let identity = clean_text(event.mint.as_deref())?;
    let source = match channel {
        PushChannel::WebSocket => SourceKind::WebSocketPush,
        PushChannel::Sse => SourceKind::SsePush,
    };
    let observed_at = event
        .timestamp
        .as_ref()
        .and_then(coerce_timestamp)
        .map_or(ctx.observed_at, |sent| sent.min(ctx.observed_at));
    let mut record = TokenRecord::new(identity, source, observed_at);

    record.display_name = clean_text(event.name.as_deref());
    record.symbol = clean_text(event.symbol.as_deref());
    record.market_cap_usd = ctx.sol_to_usd(event.market_cap_sol.as_ref().and_then(coerce_non_negative));
    record.social_links.twitter = clean_text(event.twitter.as_deref());
    record.social_links.website = clean_text(event.website.as_deref());
    record.social_links.telegram = clean_text(event.telegram.as_deref());
    record.engagement_count = event.reply_count.as_ref().and_then(coerce_u64);

    match event.kind() {
        PushEventKind::NewToken => {
            record.created_at = Some(observed_at);
            record.is_live = Some(true);
            record.is_complete = Some(false);
        }
        PushEventKind::Trade => {
            record.is_live = Some(true);
        }
        PushEventKind::Migration => {
            record.is_complete = Some(true);
        }
        PushEventKind::Unknown => {}
    }

    Some(record)
}

fn windowed(values: &HashMap<String, Value>) -> WindowedMetrics {
    let pick = |key: &str| values.get(key).and_then(coerce_f64);
    WindowedMetrics {
        m5: pick("m5"),
        h1: pick("h1"),
        h6: pick("h6"),
        h24: pick("h24"),
    }
}

/// Trimmed, non-empty text.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// Finite number from a JSON number or numeric string.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn coerce_non_negative(value: &Value) -> Option<f64> {
    coerce_f64(value).filter(|number| *number >= 0.0)
}

pub fn coerce_u64(value: &Value) -> Option<u64> {
    coerce_non_negative(value).map(|number| number.floor() as u64)
}

pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().and_then(|n| match n {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Unix seconds, unix milliseconds, or an RFC 3339 string.
pub fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Value::String(text) = value {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text.trim()) {
            return Some(parsed.with_timezone(&Utc));
        }
    }

    let raw = coerce_f64(value).filter(|n| *n > 0.0)?;
    let millis = if raw >= MILLIS_THRESHOLD { raw } else { raw * 1_000.0 };
    Utc.timestamp_millis_opt(millis as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_TOTAL_SUPPLY;
    use serde_json::json;

    fn ctx() -> NormalizeContext {
        NormalizeContext::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), Some(100.0))
    }

    fn pump(value: Value) -> RawSourcePayload {
        RawSourcePayload::PumpCoin(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_pump_coin_full_row() {
        let payload = pump(json!({
            "mint": "Mint111",
            "name": "Dog Coin",
            "symbol": "DOG",
            "created_timestamp": 1_699_990_000_000u64,
            "usd_market_cap": 4200.5,
            "twitter": "https://x.com/dog",
            "website": "",
            "reply_count": 12,
            "complete": false,
            "is_currently_live": true
        }));

        let record = normalize(&payload, &ctx()).unwrap();
        assert_eq!(record.identity, "Mint111");
        assert_eq!(record.symbol.as_deref(), Some("DOG"));
        assert_eq!(record.market_cap_usd, Some(4200.5));
        assert_eq!(record.engagement_count, Some(12));
        assert_eq!(record.social_links.twitter.as_deref(), Some("https://x.com/dog"));
        assert_eq!(record.social_links.website, None);
        assert_eq!(record.created_at.unwrap().timestamp(), 1_699_990_000);
        assert_eq!(record.is_complete, Some(false));
        assert_eq!(record.total_supply, DEFAULT_TOTAL_SUPPLY);
        assert!(!record.supply_reported);
    }

    #[test]
    fn test_reported_supply_is_flagged() {
        let record = normalize(&pump(json!({"mint": "M", "total_supply": "800000000"})), &ctx()).unwrap();
        assert_eq!(record.total_supply, 800_000_000.0);
        assert!(record.supply_reported);

        let zero = normalize(&pump(json!({"mint": "M", "total_supply": 0})), &ctx()).unwrap();
        assert_eq!(zero.total_supply, DEFAULT_TOTAL_SUPPLY);
        assert!(!zero.supply_reported);
    }

    #[test]
    fn test_missing_identity_is_dropped() {
        let payloads = vec![
            pump(json!({"name": "No Mint", "usd_market_cap": 10})),
            pump(json!({"mint": "   "})),
            pump(json!({"mint": "Good"})),
        ];

        let (records, dropped) = normalize_batch(&payloads, &ctx());
        assert_eq!(records.len(), 1);
        assert_eq!(dropped, 2);
    }

    #[test]
    fn test_non_numeric_becomes_absent_not_zero() {
        let payload = pump(json!({
            "mint": "Mint222",
            "usd_market_cap": "n/a",
            "reply_count": null,
            "created_timestamp": "soon"
        }));

        let record = normalize(&payload, &ctx()).unwrap();
        assert_eq!(record.market_cap_usd, None);
        assert_eq!(record.engagement_count, None);
        assert_eq!(record.created_at, None);
    }

    #[test]
    fn test_numeric_strings_are_accepted() {
        let payload = pump(json!({"mint": "M", "usd_market_cap": " 1500.25 ", "reply_count": "7"}));
        let record = normalize(&payload, &ctx()).unwrap();
        assert_eq!(record.market_cap_usd, Some(1500.25));
        assert_eq!(record.engagement_count, Some(7));
    }

    #[test]
    fn test_sol_market_cap_needs_rate() {
        let payload = pump(json!({"mint": "M", "market_cap": 30}));
        let with_rate = normalize(&payload, &ctx()).unwrap();
        assert_eq!(with_rate.market_cap_usd, Some(3000.0));

        let no_rate = NormalizeContext::new(ctx().observed_at, None);
        assert_eq!(normalize(&payload, &no_rate).unwrap().market_cap_usd, None);
    }

    #[test]
    fn test_dex_pair_windows_and_socials() {
        let row: DexPairRow = serde_json::from_value(json!({
            "baseToken": {"address": "Pair111", "name": "Cat", "symbol": "CAT"},
            "pairCreatedAt": 1_699_999_000_000u64,
            "priceUsd": "0.25",
            "volume": {"m5": 10.0, "h1": "250", "h24": 9000},
            "priceChange": {"h1": -4.5},
            "liquidity": {"usd": 12000},
            "info": {
                "socials": [{"type": "twitter", "url": "https://x.com/cat"}, {"type": "telegram", "url": "https://t.me/cat"}],
                "websites": [{"url": "https://cat.xyz"}]
            }
        }))
        .unwrap();

        let record = normalize(&RawSourcePayload::DexPair(row), &ctx()).unwrap();
        assert_eq!(record.identity, "Pair111");
        assert_eq!(record.market_cap_usd, Some(250_000_000.0));
        assert_eq!(record.volume.h1, Some(250.0));
        assert_eq!(record.volume.h6, None);
        assert_eq!(record.price_change.h1, Some(-4.5));
        assert_eq!(record.liquidity_usd, Some(12_000.0));
        assert_eq!(record.social_links.telegram.as_deref(), Some("https://t.me/cat"));
        assert_eq!(record.social_links.website.as_deref(), Some("https://cat.xyz"));
        assert!(record.sources.contains(&SourceKind::DexRest));
    }

    #[test]
    fn test_push_events_by_kind() {
        let create: PushEvent = serde_json::from_value(json!({
            "mint": "Push1", "txType": "create", "name": "New", "symbol": "NEW", "marketCapSol": 28.5
        }))
        .unwrap();
        let record = normalize(&RawSourcePayload::Push { channel: PushChannel::WebSocket, event: create }, &ctx()).unwrap();
        assert_eq!(record.created_at, Some(ctx().observed_at));
        assert_eq!(record.market_cap_usd, Some(2850.0));
        assert!(record.sources.contains(&SourceKind::WebSocketPush));

        let migrate: PushEvent = serde_json::from_value(json!({"mint": "Push1", "txType": "migrate"})).unwrap();
        let record = normalize(&RawSourcePayload::Push { channel: PushChannel::Sse, event: migrate }, &ctx()).unwrap();
        assert_eq!(record.is_complete, Some(true));
        assert_eq!(record.created_at, None);
        assert!(record.sources.contains(&SourceKind::SsePush));
    }

    #[test]
    fn test_coerce_timestamp_units() {
        let seconds = coerce_timestamp(&json!(1_700_000_000)).unwrap();
        let millis = coerce_timestamp(&json!(1_700_000_000_000u64)).unwrap();
        let rfc = coerce_timestamp(&json!("2023-11-14T22:13:20Z")).unwrap();
        assert_eq!(seconds, millis);
        assert_eq!(seconds, rfc);
        assert_eq!(coerce_timestamp(&json!(-5)), None);
    }

    #[test]
    fn test_push_timestamp_never_after_receive_time() {
        let received = ctx().observed_at;
        let future: PushEvent =
            serde_json::from_value(json!({"mint": "Late", "txType": "buy", "timestamp": 1_800_000_000_000u64})).unwrap();
        let record = normalize(&RawSourcePayload::Push { channel: PushChannel::WebSocket, event: future }, &ctx()).unwrap();
        assert_eq!(record.observed_at, received);

        let past: PushEvent =
            serde_json::from_value(json!({"mint": "Late", "txType": "buy", "timestamp": 1_699_999_000_000u64})).unwrap();
        let record = normalize(&RawSourcePayload::Push { channel: PushChannel::WebSocket, event: past }, &ctx()).unwrap();
        assert_eq!(record.observed_at.timestamp(), 1_699_999_000);
    }
}
