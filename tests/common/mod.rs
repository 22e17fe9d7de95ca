//! Scripted exchange used by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use ta_pulse::error::EngineError;
use ta_pulse::market_data::{Candle, RawTick};
use ta_pulse::stream::{CandleRange, ExchangeDataSource, TickStream, UpstreamCursor};
use ta_pulse::types::{SeriesKey, Timeframe};

/// Minute-aligned base time for every scripted tick.
pub const T0: i64 = 1_700_000_040_000;

pub fn raw_tick(symbol: &str, seq: u64, ts: i64, price: f64) -> RawTick {
    RawTick {
        symbol: symbol.to_string(),
        price,
        volume: 1.0,
        timestamp: ts,
        sequence: seq,
    }
}

/// Each `stream_ticks` call hands out the next scripted connection; once the
/// script is exhausted the feed stays open and silent.
pub struct MockExchange {
    connections: Mutex<Vec<Vec<RawTick>>>,
    cursor: Mutex<Option<UpstreamCursor>>,
    pub history_requests: Mutex<Vec<(String, Timeframe, CandleRange)>>,
    pub connects: Mutex<u32>,
    /// First connection waits for this before streaming.
    pub gate: Arc<Notify>,
    /// While set, every history request fails.
    pub history_down: AtomicBool,
}

impl MockExchange {
    pub fn new(connections: Vec<Vec<RawTick>>) -> Self {
        Self {
            connections: Mutex::new(connections),
            cursor: Mutex::new(None),
            history_requests: Mutex::new(Vec::new()),
            connects: Mutex::new(0),
            gate: Arc::new(Notify::new()),
            history_down: AtomicBool::new(false),
        }
    }

    pub fn with_cursor(self, sequence: u64, timestamp: i64) -> Self {
        *self.cursor.lock() = Some(UpstreamCursor {
            sequence,
            timestamp,
        });
        self
    }
}

impl ExchangeDataSource for MockExchange {
    /// One candle per bucket of the range; the bucket holding `range.end` is
    /// still open.
    async fn fetch_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: CandleRange,
    ) -> Result<Vec<Candle>, EngineError> {
        self.history_requests
            .lock()
            .push((symbol.to_string(), timeframe, range));
        if self.history_down.load(Ordering::SeqCst) {
            return Err(EngineError::UpstreamConnection("klines endpoint unavailable".into()));
        }
        let key = SeriesKey::new(symbol, timeframe);
        let first = timeframe.bucket_of(range.start);
        let last = timeframe.bucket_of(range.end);
        Ok((first..=last)
            .map(|bucket| {
                let mut c = Candle::open_at(&key, bucket, 200.0 + (bucket - first) as f64, 5.0);
                c.is_closed = bucket < last;
                c
            })
            .collect())
    }

    async fn stream_ticks(&self, _symbols: &[String]) -> Result<TickStream, EngineError> {
        let n = {
            let mut connects = self.connects.lock();
            *connects += 1;
            *connects
        };
        if n == 1 {
            self.gate.notified().await;
        }
        let mut connections = self.connections.lock();
        if connections.is_empty() {
            return Ok(stream::pending().boxed());
        }
        let ticks = connections.remove(0);
        Ok(stream::iter(ticks.into_iter().map(Ok)).boxed())
    }

    async fn latest_cursor(&self, _symbol: &str) -> Result<Option<UpstreamCursor>, EngineError> {
        Ok(*self.cursor.lock())
    }
}
