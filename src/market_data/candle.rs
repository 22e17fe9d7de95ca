use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::{SeriesKey, Timeframe};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle for one (symbol, timeframe) series.
///
/// `start_time` and `end_time` are inclusive millisecond bounds of the bucket.
/// Once `is_closed` is set the candle is never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub start_time: i64,
    pub end_time: i64,
    pub is_closed: bool,
}

impl Candle {
    /// Open a new candle in `bucket`, seeded with a single price.
    pub fn open_at(key: &SeriesKey, bucket: i64, price: f64, volume: f64) -> Self {
        let start_time = key.timeframe.bucket_start(bucket);
        Self {
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            start_time,
            end_time: start_time + key.timeframe.duration_ms() - 1,
            is_closed: false,
        }
    }

    /// A closed, zero-volume candle carrying `prev_close` forward through a
    /// bucket in which no tick arrived.
    pub fn forward_fill(key: &SeriesKey, bucket: i64, prev_close: f64) -> Self {
        let mut candle = Self::open_at(key, bucket, prev_close, 0.0);
        candle.is_closed = true;
        candle
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe)
    }

    pub fn bucket(&self) -> i64 {
        self.timeframe.bucket_of(self.start_time)
    }

    /// Fold one more trade into an open candle.
    pub(crate) fn absorb(&mut self, price: f64, volume: f64) {
        debug_assert!(!self.is_closed, "closed candles are immutable");
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }
}

/// Emitted by the aggregator whenever at least one candle closes.
///
/// `closed` is the first candle to commit; `forward_filled` holds synthetic
/// candles for any empty buckets that follow it, in ascending order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedCandleEvent {
    pub key: SeriesKey,
    pub closed: Candle,
    pub forward_filled: Vec<Candle>,
}

impl ClosedCandleEvent {
    /// Every candle in commit order.
    pub fn candles(&self) -> impl Iterator<Item = &Candle> {
        std::iter::once(&self.closed).chain(self.forward_filled.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.forward_filled.len()
    }
}

// ---------------------------------------------------------------------------
// CandleHistory -- bounded warm-up window per series
// ---------------------------------------------------------------------------

/// Ring buffer of the most recent closed candles for a single series.
///
/// Owned by exactly one pipeline; readers get clones through the pipeline's
/// published view.
#[derive(Debug, Clone)]
pub struct CandleHistory {
    ring: VecDeque<Candle>,
    max_candles: usize,
}

impl CandleHistory {
    pub fn new(max_candles: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(max_candles + 1),
            max_candles,
        }
    }

    /// Append a closed candle and trim the oldest beyond `max_candles`.
    /// Candles that do not advance the series are ignored.
    pub fn push(&mut self, candle: Candle) -> bool {
        if !candle.is_closed {
            return false;
        }
        if let Some(last) = self.ring.back() {
            if candle.start_time <= last.start_time {
                return false;
            }
        }
        self.ring.push_back(candle);
        while self.ring.len() > self.max_candles {
            self.ring.pop_front();
        }
        true
    }

    /// The most recent `count` closed candles, oldest first.
    pub fn recent(&self, count: usize) -> Vec<Candle> {
        let start = self.ring.len().saturating_sub(count);
        self.ring.iter().skip(start).cloned().collect()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.ring.back()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
