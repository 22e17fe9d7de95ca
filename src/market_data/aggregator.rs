// =============================================================================
// Candle Aggregator — buckets ticks into OHLCV candles for one series
// =============================================================================
//
// One aggregator exists per (symbol, timeframe). It owns the single open
// candle of its series and the last candle it closed.
//
//   bucket = floor(timestamp / timeframe)
//
//   same bucket as the open candle  -> update high/low/close/volume
//   later bucket                    -> close the open candle, forward-fill any
//                                      skipped buckets, open a new candle
//   earlier bucket                  -> late tick, dropped and counted
//
// `flush(now)` is driven by the gap scheduler so that a silent market still
// produces one (forward-filled) candle per elapsed bucket. Time is always
// supplied by the caller; the aggregator never reads the wall clock.
// =============================================================================

use tracing::debug;

use crate::error::EngineError;
use crate::market_data::candle::{Candle, ClosedCandleEvent};
use crate::types::{SeriesKey, Tick};

#[derive(Debug, Clone)]
pub struct CandleAggregator {
    key: SeriesKey,
    open: Option<Candle>,
    last_closed: Option<Candle>,
    late_ticks: u64,
}

impl CandleAggregator {
    pub fn new(key: SeriesKey) -> Self {
        Self {
            key,
            open: None,
            last_closed: None,
            late_ticks: 0,
        }
    }

    /// Rebuild an aggregator from the last committed candle, discarding any
    /// in-progress candle.
    pub fn restore(key: SeriesKey, last_closed: Option<Candle>) -> Self {
        Self {
            key,
            open: None,
            last_closed,
            late_ticks: 0,
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn open_candle(&self) -> Option<&Candle> {
        self.open.as_ref()
    }

    pub fn last_closed(&self) -> Option<&Candle> {
        self.last_closed.as_ref()
    }

    pub fn late_ticks(&self) -> u64 {
        self.late_ticks
    }

    /// Fold a tick into the series.
    ///
    /// Returns `Ok(Some(event))` when the tick closed the open candle (or
    /// followed an empty stretch that had to be forward-filled), `Ok(None)`
    /// when it only updated the open candle, and `Err(LateArrival)` when the
    /// tick belongs to a bucket that is already closed.
    pub fn ingest(&mut self, tick: &Tick) -> Result<Option<ClosedCandleEvent>, EngineError> {
        let bucket = self.key.timeframe.bucket_of(tick.timestamp);

        if let Some(open) = self.open.as_mut() {
            let open_bucket = open.bucket();
            if bucket == open_bucket {
                open.absorb(tick.price, tick.volume);
                return Ok(None);
            }
            if bucket < open_bucket {
                return Err(self.late(bucket, open_bucket));
            }
        } else if let Some(last) = &self.last_closed {
            let next_bucket = last.bucket() + 1;
            if bucket < next_bucket {
                return Err(self.late(bucket, next_bucket));
            }
        }

        let event = self.close_through(bucket);
        self.open = Some(Candle::open_at(&self.key, bucket, tick.price, tick.volume));
        Ok(event)
    }

    /// Close every bucket that ended before `now_ms`.
    ///
    /// The open candle is closed once its bucket has fully elapsed, and every
    /// later bucket that elapsed without a tick is forward-filled from the
    /// previous close.
    pub fn flush(&mut self, now_ms: i64) -> Option<ClosedCandleEvent> {
        let current_bucket = self.key.timeframe.bucket_of(now_ms);
        let newest_closed = self
            .open
            .as_ref()
            .or(self.last_closed.as_ref())
            .map(Candle::bucket)?;
        if newest_closed >= current_bucket {
            return None;
        }
        self.close_through(current_bucket)
    }

    /// Accept a closed candle obtained from history (warm-up or gap
    /// backfill). Returns `false` when the candle does not advance the series.
    pub fn adopt_closed(&mut self, candle: &Candle) -> bool {
        let bucket = candle.bucket();
        if let Some(last) = &self.last_closed {
            if bucket <= last.bucket() {
                return false;
            }
        }
        if let Some(open) = &self.open {
            if open.bucket() <= bucket {
                debug!(key = %self.key, bucket, "backfilled candle supersedes open candle");
                self.open = None;
            }
        }
        let mut committed = candle.clone();
        committed.is_closed = true;
        self.last_closed = Some(committed);
        true
    }

    /// Accept the exchange's view of the still-open candle after a backfill.
    pub fn adopt_open(&mut self, candle: &Candle) -> bool {
        let bucket = candle.bucket();
        if let Some(last) = &self.last_closed {
            if bucket <= last.bucket() {
                return false;
            }
        }
        if let Some(open) = &self.open {
            if open.bucket() > bucket {
                return false;
            }
        }
        let mut live = candle.clone();
        live.is_closed = false;
        self.open = Some(live);
        true
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn late(&mut self, bucket: i64, open_bucket: i64) -> EngineError {
        self.late_ticks += 1;
        EngineError::LateArrival {
            key: self.key.clone(),
            bucket,
            open_bucket,
        }
    }

    /// Close the open candle (if any) and forward-fill every empty bucket
    /// strictly before `until_bucket`.
    fn close_through(&mut self, until_bucket: i64) -> Option<ClosedCandleEvent> {
        let mut closed: Vec<Candle> = Vec::new();

        if let Some(mut open) = self.open.take() {
            open.is_closed = true;
            closed.push(open);
        }

        let (mut next_bucket, prev_close) = match closed.last().or(self.last_closed.as_ref()) {
            Some(c) => (c.bucket() + 1, c.close),
            None => return None,
        };
        while next_bucket < until_bucket {
            closed.push(Candle::forward_fill(&self.key, next_bucket, prev_close));
            next_bucket += 1;
        }

        let mut iter = closed.into_iter();
        let first = iter.next()?;
        let forward_filled: Vec<Candle> = iter.collect();
        self.last_closed = Some(forward_filled.last().unwrap_or(&first).clone());

        Some(ClosedCandleEvent {
            key: self.key.clone(),
            closed: first,
            forward_filled,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    const MIN: i64 = 60_000;

    fn key() -> SeriesKey {
        SeriesKey::new("BTCUSDT", Timeframe::M1)
    }

    fn tick(ts: i64, price: f64, seq: u64) -> Tick {
        Tick {
            symbol: "BTCUSDT".into(),
            price,
            volume: 1.0,
            timestamp: ts,
            sequence: seq,
        }
    }

    fn run(ticks: &[Tick]) -> Vec<Candle> {
        let mut agg = CandleAggregator::new(key());
        let mut out = Vec::new();
        for t in ticks {
            if let Ok(Some(ev)) = agg.ingest(t) {
                out.extend(ev.candles().cloned());
            }
        }
        out
    }

    #[test]
    fn same_bucket_updates_open_candle() {
        let mut agg = CandleAggregator::new(key());
        assert!(agg.ingest(&tick(1_000, 10.0, 1)).unwrap().is_none());
        assert!(agg.ingest(&tick(2_000, 12.0, 2)).unwrap().is_none());
        assert!(agg.ingest(&tick(3_000, 8.0, 3)).unwrap().is_none());
        let open = agg.open_candle().unwrap();
        assert_eq!((open.open, open.high, open.low, open.close), (10.0, 12.0, 8.0, 8.0));
        assert!((open.volume - 3.0).abs() < 1e-12);
    }

    #[test]
    fn next_bucket_closes_and_reopens() {
        let mut agg = CandleAggregator::new(key());
        agg.ingest(&tick(1_000, 10.0, 1)).unwrap();
        let ev = agg.ingest(&tick(MIN + 5, 11.0, 2)).unwrap().unwrap();
        assert!(ev.closed.is_closed);
        assert_eq!(ev.closed.close, 10.0);
        assert!(ev.forward_filled.is_empty());
        let open = agg.open_candle().unwrap();
        assert_eq!(open.start_time, MIN);
        assert_eq!((open.open, open.high, open.low, open.close), (11.0, 11.0, 11.0, 11.0));
    }

    #[test]
    fn skipped_buckets_are_forward_filled() {
        let mut agg = CandleAggregator::new(key());
        agg.ingest(&tick(0, 10.0, 1)).unwrap();
        let ev = agg.ingest(&tick(3 * MIN, 13.0, 2)).unwrap().unwrap();
        assert_eq!(ev.len(), 3);
        let starts: Vec<i64> = ev.candles().map(|c| c.start_time).collect();
        assert_eq!(starts, vec![0, MIN, 2 * MIN]);
        for filled in &ev.forward_filled {
            assert_eq!(filled.volume, 0.0);
            assert_eq!(filled.close, 10.0);
        }
        assert_eq!(agg.last_closed().unwrap().start_time, 2 * MIN);
    }

    #[test]
    fn late_tick_is_dropped_and_counted() {
        let mut agg = CandleAggregator::new(key());
        agg.ingest(&tick(0, 10.0, 1)).unwrap();
        let ev = agg.ingest(&tick(MIN, 11.0, 2)).unwrap().unwrap();
        let closed_before = ev.closed.clone();

        let err = agg.ingest(&tick(30_000, 99.0, 3)).unwrap_err();
        assert!(matches!(err, EngineError::LateArrival { bucket: 0, open_bucket: 1, .. }));
        assert_eq!(agg.late_ticks(), 1);
        assert_eq!(agg.last_closed().unwrap(), &closed_before);
    }

    #[test]
    fn late_tick_after_flush_is_rejected() {
        let mut agg = CandleAggregator::new(key());
        agg.ingest(&tick(0, 10.0, 1)).unwrap();
        agg.flush(MIN + 1).unwrap();
        assert!(agg.open_candle().is_none());
        assert!(agg.ingest(&tick(59_000, 5.0, 2)).is_err());
    }

    #[test]
    fn flush_closes_elapsed_open_candle() {
        let mut agg = CandleAggregator::new(key());
        agg.ingest(&tick(0, 10.0, 1)).unwrap();
        assert!(agg.flush(MIN - 1).is_none());
        let ev = agg.flush(MIN).unwrap();
        assert_eq!(ev.len(), 1);
        assert_eq!(ev.closed.start_time, 0);
    }

    #[test]
    fn flush_forward_fills_silence() {
        let mut agg = CandleAggregator::new(key());
        agg.ingest(&tick(0, 10.0, 1)).unwrap();
        agg.flush(MIN).unwrap();

        // Two full buckets of silence, third still in progress.
        let ev = agg.flush(3 * MIN + 10).unwrap();
        assert_eq!(ev.len(), 2);
        assert!(ev.candles().all(|c| c.volume == 0.0 && c.close == 10.0));
        assert!(agg.flush(3 * MIN + 20).is_none());
    }

    #[test]
    fn flush_without_history_does_nothing() {
        let mut agg = CandleAggregator::new(key());
        assert!(agg.flush(10 * MIN).is_none());
    }

    #[test]
    fn tick_after_flush_fills_remaining_gap() {
        let mut agg = CandleAggregator::new(key());
        agg.ingest(&tick(0, 10.0, 1)).unwrap();
        agg.flush(MIN).unwrap();
        let ev = agg.ingest(&tick(3 * MIN, 12.0, 2)).unwrap().unwrap();
        let starts: Vec<i64> = ev.candles().map(|c| c.start_time).collect();
        assert_eq!(starts, vec![MIN, 2 * MIN]);
    }

    #[test]
    fn aggregation_is_deterministic() {
        let ticks: Vec<Tick> = (0..500)
            .map(|i| tick(i * 7_919, 100.0 + ((i * 37) % 17) as f64, i as u64))
            .collect();
        assert_eq!(run(&ticks), run(&ticks));
        assert!(!run(&ticks).is_empty());
    }

    #[test]
    fn adopt_closed_supersedes_open_candle() {
        let mut agg = CandleAggregator::new(key());
        agg.ingest(&tick(0, 10.0, 1)).unwrap();
        let backfilled = Candle::forward_fill(&key(), 0, 10.5);
        assert!(agg.adopt_closed(&backfilled));
        assert!(agg.open_candle().is_none());
        assert!(!agg.adopt_closed(&backfilled));
    }

    #[test]
    fn adopt_open_replaces_in_progress_candle() {
        let mut agg = CandleAggregator::new(key());
        agg.adopt_closed(&Candle::forward_fill(&key(), 0, 10.0));
        let live = Candle::open_at(&key(), 1, 11.0, 4.0);
        assert!(agg.adopt_open(&live));
        agg.ingest(&tick(MIN + 10, 12.0, 9)).unwrap();
        let open = agg.open_candle().unwrap();
        assert_eq!(open.open, 11.0);
        assert_eq!(open.high, 12.0);
        assert!((open.volume - 5.0).abs() < 1e-12);
    }
}
