// =============================================================================
// Indicator Engine — committed and preview snapshots per series
// =============================================================================
//
// One engine per (symbol, timeframe). Committed state advances by exactly one
// step per closed candle; `preview` runs the same step on a scratch copy and
// throws it away.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, WarmupGap};
use crate::market_data::Candle;
use crate::types::{IndicatorKind, SeriesKey};

use super::bollinger::{BollingerBands, BollingerState};
use super::macd::{MacdState, MacdValue};
use super::rsi::RsiState;

// -----------------------------------------------------------------------------
// Parameters
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorParams {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_macd_fast")]
    pub macd_fast: usize,
    #[serde(default = "default_macd_slow")]
    pub macd_slow: usize,
    #[serde(default = "default_macd_signal")]
    pub macd_signal: usize,
    #[serde(default = "default_bb_period")]
    pub bb_period: usize,
    #[serde(default = "default_bb_std")]
    pub bb_std: f64,
}

fn default_rsi_period() -> usize {
    14
}
fn default_macd_fast() -> usize {
    12
}
fn default_macd_slow() -> usize {
    26
}
fn default_macd_signal() -> usize {
    9
}
fn default_bb_period() -> usize {
    20
}
fn default_bb_std() -> f64 {
    2.0
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_period: default_rsi_period(),
            macd_fast: default_macd_fast(),
            macd_slow: default_macd_slow(),
            macd_signal: default_macd_signal(),
            bb_period: default_bb_period(),
            bb_std: default_bb_std(),
        }
    }
}

// -----------------------------------------------------------------------------
// Snapshot
// -----------------------------------------------------------------------------

/// An indicator value, or an explicit marker that warm-up is incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reading<T> {
    Ready { value: T },
    Unavailable { have: usize, need: usize },
}

impl<T: Copy> Reading<T> {
    fn from_option(value: Option<T>, have: usize, need: usize) -> Self {
        match value {
            Some(value) => Self::Ready { value },
            None => Self::Unavailable { have, need },
        }
    }

    pub fn value(&self) -> Option<T> {
        match self {
            Self::Ready { value } => Some(*value),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    fn gap(&self, indicator: IndicatorKind) -> Option<WarmupGap> {
        match *self {
            Self::Ready { .. } => None,
            Self::Unavailable { have, need } => Some(WarmupGap {
                indicator,
                have,
                need,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub key: SeriesKey,
    /// Start of the candle this snapshot was computed through.
    pub candle_start: i64,
    pub close: f64,
    /// Closed candles folded into committed state (excludes the preview step).
    pub closed_candles: u64,
    /// `true` when computed from an in-progress candle.
    pub preview: bool,
    pub rsi: Reading<f64>,
    pub macd: Reading<MacdValue>,
    pub bollinger: Reading<BollingerBands>,
}

impl IndicatorSnapshot {
    pub fn is_warm(&self) -> bool {
        self.rsi.is_ready() && self.macd.is_ready() && self.bollinger.is_ready()
    }

    /// Indicators still warming up, with their progress.
    pub fn pending(&self) -> Vec<WarmupGap> {
        [
            self.rsi.gap(IndicatorKind::Rsi),
            self.macd.gap(IndicatorKind::Macd),
            self.bollinger.gap(IndicatorKind::Bollinger),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

// -----------------------------------------------------------------------------
// Engine
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct IndicatorSet {
    rsi: RsiState,
    macd: MacdState,
    bollinger: BollingerState,
}

impl IndicatorSet {
    fn new(params: &IndicatorParams) -> Self {
        Self {
            rsi: RsiState::new(params.rsi_period),
            macd: MacdState::new(params.macd_fast, params.macd_slow, params.macd_signal),
            bollinger: BollingerState::new(params.bb_period, params.bb_std),
        }
    }

    fn update(&mut self, close: f64) {
        self.rsi.update(close);
        self.macd.update(close);
        self.bollinger.update(close);
    }

    fn readings(&self) -> (Reading<f64>, Reading<MacdValue>, Reading<BollingerBands>) {
        (
            Reading::from_option(self.rsi.value(), self.rsi.samples(), self.rsi.period()),
            Reading::from_option(self.macd.value(), self.macd.samples(), self.macd.required()),
            Reading::from_option(
                self.bollinger.value(),
                self.bollinger.samples(),
                self.bollinger.period(),
            ),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorEngine {
    key: SeriesKey,
    committed: IndicatorSet,
    closed_candles: u64,
    last_start: Option<i64>,
    latest: Option<IndicatorSnapshot>,
}

impl IndicatorEngine {
    pub fn new(key: SeriesKey, params: &IndicatorParams) -> Self {
        Self {
            key,
            committed: IndicatorSet::new(params),
            closed_candles: 0,
            last_start: None,
            latest: None,
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// Fold one closed candle into committed state.
    ///
    /// A candle that does not start after the last committed one is rejected,
    /// so each close advances the recurrences exactly once.
    pub fn on_candle_closed(&mut self, candle: &Candle) -> Result<IndicatorSnapshot, EngineError> {
        if let Some(last) = self.last_start {
            if candle.start_time <= last {
                return Err(EngineError::StaleCandle {
                    key: self.key.clone(),
                    start: candle.start_time,
                    last,
                });
            }
        }

        self.committed.update(candle.close);
        self.closed_candles += 1;
        self.last_start = Some(candle.start_time);

        let snapshot = self.snapshot(&self.committed, candle, false);
        self.latest = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Indicators as if `in_progress` closed now. Committed state is untouched.
    pub fn preview(&self, in_progress: &Candle) -> IndicatorSnapshot {
        let mut scratch = self.committed.clone();
        scratch.update(in_progress.close);
        self.snapshot(&scratch, in_progress, true)
    }

    /// Latest committed snapshot.
    pub fn latest(&self) -> Option<&IndicatorSnapshot> {
        self.latest.as_ref()
    }

    pub fn closed_candles(&self) -> u64 {
        self.closed_candles
    }

    pub fn last_start(&self) -> Option<i64> {
        self.last_start
    }

    fn snapshot(&self, set: &IndicatorSet, candle: &Candle, preview: bool) -> IndicatorSnapshot {
        let (rsi, macd, bollinger) = set.readings();
        IndicatorSnapshot {
            key: self.key.clone(),
            candle_start: candle.start_time,
            close: candle.close,
            closed_candles: self.closed_candles,
            preview,
            rsi,
            macd,
            bollinger,
        }
    }
}
