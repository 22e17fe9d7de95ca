// =============================================================================
// Exchange Data Source — the upstream collaborator of the stream client
// =============================================================================

use std::future::Future;

use futures_util::stream::BoxStream;
use serde::Serialize;

use crate::error::EngineError;
use crate::market_data::{Candle, RawTick};
use crate::types::Timeframe;

/// Live tick feed. Ends (or yields a non-tick error) when the connection is
/// lost; tick-level problems come through as `MalformedTick` items.
pub type TickStream = BoxStream<'static, Result<RawTick, EngineError>>;

/// Inclusive millisecond range of candle start times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CandleRange {
    pub start: i64,
    pub end: i64,
    pub limit: Option<usize>,
}

impl CandleRange {
    pub fn between(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            limit: None,
        }
    }

    /// The `count` most recent buckets up to and including the one at `now`.
    pub fn last(count: usize, timeframe: Timeframe, now_ms: i64) -> Self {
        let current = timeframe.bucket_of(now_ms);
        let first = current - count.saturating_sub(1) as i64;
        Self {
            start: timeframe.bucket_start(first),
            end: now_ms,
            limit: Some(count),
        }
    }
}

/// Upstream's position in a symbol's tick sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpstreamCursor {
    pub sequence: u64,
    pub timestamp: i64,
}

pub trait ExchangeDataSource: Send + Sync + 'static {
    /// Candles in `range`, oldest first. The newest one may still be open.
    fn fetch_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: CandleRange,
    ) -> impl Future<Output = Result<Vec<Candle>, EngineError>> + Send;

    /// Open one live feed covering every symbol in `symbols`.
    fn stream_ticks(
        &self,
        symbols: &[String],
    ) -> impl Future<Output = Result<TickStream, EngineError>> + Send;

    /// Latest sequence the upstream has published for `symbol`.
    fn latest_cursor(
        &self,
        symbol: &str,
    ) -> impl Future<Output = Result<Option<UpstreamCursor>, EngineError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_range_covers_count_buckets() {
        let now = 10 * 60_000 + 30_000;
        let r = CandleRange::last(3, Timeframe::M1, now);
        assert_eq!(r.start, 8 * 60_000);
        assert_eq!(r.end, now);
        assert_eq!(r.limit, Some(3));
    }
}
