// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Every failure the analysis engine can observe is a value of `EngineError`.
// None of them is fatal to the process: upstream errors are retried by the
// stream client, bad ticks are counted and dropped, and overflowing
// subscribers are flagged for resync.
// =============================================================================

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{IndicatorKind, SeriesKey};

/// Indicator that has not yet seen enough closed candles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmupGap {
    pub indicator: IndicatorKind,
    pub have: usize,
    pub need: usize,
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("upstream connection error: {0}")]
    UpstreamConnection(String),

    #[error("malformed tick: {reason}")]
    MalformedTick { reason: String },

    #[error("late tick for {key}: bucket {bucket} precedes open bucket {open_bucket}")]
    LateArrival {
        key: SeriesKey,
        bucket: i64,
        open_bucket: i64,
    },

    #[error("insufficient history for {key}: {} indicator(s) still warming up", pending.len())]
    InsufficientHistory {
        key: SeriesKey,
        pending: Vec<WarmupGap>,
    },

    #[error("subscription {id} overflowed its queue of {capacity}; resync required")]
    SubscriberOverflow { id: Uuid, capacity: usize },

    #[error("stale closed candle for {key}: start {start} is not after last committed {last}")]
    StaleCandle { key: SeriesKey, start: i64, last: i64 },

    #[error("unknown series {0}")]
    UnknownSeries(SeriesKey),

    #[error("unknown subscription {0}")]
    UnknownSubscription(Uuid),

    #[error("backfill failed for {key}: {reason}")]
    Backfill { key: SeriesKey, reason: String },
}

impl EngineError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedTick {
            reason: reason.into(),
        }
    }

    /// Whether the error only affects a single tick (dropped and counted).
    pub fn is_tick_level(&self) -> bool {
        matches!(self, Self::MalformedTick { .. } | Self::LateArrival { .. })
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        Self::UpstreamConnection(format!("{e:#}"))
    }
}
