// =============================================================================
// Binance public market data — aggTrade ticks and kline history
// =============================================================================
//
// Public endpoints only; no API key. Each aggregate trade becomes one tick and
// its aggregate trade id is the tick sequence.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use super::source::{CandleRange, ExchangeDataSource, TickStream, UpstreamCursor};
use crate::error::EngineError;
use crate::market_data::{Candle, RawTick};
use crate::types::Timeframe;

const REST_BASE: &str = "https://api.binance.com";
const WS_BASE: &str = "wss://stream.binance.com:9443";
/// Largest `limit` the klines endpoint accepts.
const MAX_KLINES: usize = 1_000;

#[derive(Clone)]
pub struct BinanceSource {
    rest_base: String,
    ws_base: String,
    client: reqwest::Client,
}

impl BinanceSource {
    pub fn new() -> Result<Self> {
        Self::with_endpoints(REST_BASE, WS_BASE)
    }

    pub fn with_endpoints(rest_base: impl Into<String>, ws_base: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            rest_base: rest_base.into(),
            ws_base: ws_base.into(),
            client,
        })
    }

    async fn get_json(&self, path_and_query: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.rest_base, path_and_query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path_and_query} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path_and_query} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {path_and_query} returned {status}: {body}");
        }
        Ok(body)
    }

    /// GET /api/v3/klines between two open times.
    #[instrument(skip(self), name = "binance::get_klines")]
    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: CandleRange,
    ) -> Result<Vec<Candle>> {
        let limit = range.limit.unwrap_or(MAX_KLINES).clamp(1, MAX_KLINES);
        let body = self
            .get_json(&format!(
                "/api/v3/klines?symbol={symbol}&interval={}&startTime={}&endTime={}&limit={limit}",
                timeframe.as_str(),
                range.start,
                range.end
            ))
            .await?;
        let now = chrono::Utc::now().timestamp_millis();
        let candles = parse_klines(&body, symbol, timeframe, now)?;
        debug!(symbol, interval = %timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/aggTrades?limit=1 — the newest aggregate trade.
    #[instrument(skip(self), name = "binance::latest_agg_trade")]
    async fn latest_agg_trade(&self, symbol: &str) -> Result<Option<UpstreamCursor>> {
        let body = self
            .get_json(&format!("/api/v3/aggTrades?symbol={symbol}&limit=1"))
            .await?;
        let Some(last) = body.as_array().and_then(|a| a.last()) else {
            return Ok(None);
        };
        let sequence = last["a"].as_u64().context("missing field a")?;
        let timestamp = last["T"].as_i64().context("missing field T")?;
        Ok(Some(UpstreamCursor {
            sequence,
            timestamp,
        }))
    }
}

impl ExchangeDataSource for BinanceSource {
    async fn fetch_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: CandleRange,
    ) -> Result<Vec<Candle>, EngineError> {
        Ok(self.get_klines(symbol, timeframe, range).await?)
    }

    async fn stream_ticks(&self, symbols: &[String]) -> Result<TickStream, EngineError> {
        let url = build_agg_trade_url(&self.ws_base, symbols);
        info!(url = %url, "connecting to aggTrade WebSocket");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to aggTrade WebSocket")?;
        info!(streams = symbols.len(), "aggTrade WebSocket connected");

        let ticks = ws_stream
            .take_while(|msg| {
                let open = !matches!(msg, Ok(Message::Close(_)));
                async move { open }
            })
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(
                        parse_agg_trade(&text).map_err(|e| EngineError::malformed(format!("{e:#}"))),
                    ),
                    // tungstenite answers pings itself.
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "aggTrade WebSocket read error");
                        Some(Err(EngineError::UpstreamConnection(e.to_string())))
                    }
                }
            });
        Ok(ticks.boxed())
    }

    async fn latest_cursor(&self, symbol: &str) -> Result<Option<UpstreamCursor>, EngineError> {
        Ok(self.latest_agg_trade(symbol).await?)
    }
}

impl std::fmt::Debug for BinanceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceSource")
            .field("rest_base", &self.rest_base)
            .field("ws_base", &self.ws_base)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Wire parsing
// -----------------------------------------------------------------------------

/// Combined-stream URL for the aggTrade streams of all symbols.
fn build_agg_trade_url(ws_base: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@aggTrade", s.to_lowercase()))
        .collect();
    format!("{ws_base}/stream?streams={}", streams.join("/"))
}

/// Parse one aggTrade message, combined envelope or bare payload.
///
/// ```json
/// { "stream": "btcusdt@aggTrade",
///   "data": { "e": "aggTrade", "s": "BTCUSDT", "a": 26129, "p": "0.01633102",
///             "q": "4.70443515", "T": 1498793709153 } }
/// ```
fn parse_agg_trade(text: &str) -> Result<RawTick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    Ok(RawTick {
        symbol: data["s"].as_str().context("missing field s")?.to_string(),
        price: parse_str_f64(&data["p"], "p")?,
        volume: parse_str_f64(&data["q"], "q")?,
        timestamp: data["T"].as_i64().context("missing field T")?,
        sequence: data["a"].as_u64().context("missing field a")?,
    })
}

/// Parse a klines array.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, ...
fn parse_klines(
    body: &serde_json::Value,
    symbol: &str,
    timeframe: Timeframe,
    now_ms: i64,
) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;
    let mut candles = Vec::with_capacity(raw.len());

    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 7 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }
        let start_time = arr[0].as_i64().context("kline open time")?;
        let end_time = arr[6].as_i64().context("kline close time")?;
        candles.push(Candle {
            symbol: symbol.to_string(),
            timeframe,
            open: parse_str_f64(&arr[1], "open")?,
            high: parse_str_f64(&arr[2], "high")?,
            low: parse_str_f64(&arr[3], "low")?,
            close: parse_str_f64(&arr[4], "close")?,
            volume: parse_str_f64(&arr[5], "volume")?,
            start_time,
            end_time,
            is_closed: end_time < now_ms,
        });
    }
    Ok(candles)
}

/// Binance sends most numbers as JSON strings.
fn parse_str_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}
