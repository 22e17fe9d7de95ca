// =============================================================================
// Signal Generator — transitions over consecutive indicator snapshots
// =============================================================================
//
// RSI       level based: >= overbought => SELL, <= oversold => BUY.
// MACD      histogram sign flip: <= 0 -> > 0 => BUY, >= 0 -> < 0 => SELL.
//           strength = |histogram| / rolling mean |histogram|.
// Bollinger band break: inside/above -> below lower => BUY,
//           inside/below -> above upper => SELL.
//
// Each ready indicator yields exactly one signal per evaluation; anything that
// is not a BUY or SELL is NEUTRAL with strength 0. Only `evaluate` moves the
// generator's memory forward. `preview` derives advisory signals from the same
// memory and discards the result.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::indicators::{BandPosition, BollingerBands, IndicatorSnapshot, MacdValue};
use crate::types::{IndicatorKind, SignalType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalParams {
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    /// Closed candles in the MACD reference-scale average.
    #[serde(default = "default_macd_scale_window")]
    pub macd_scale_window: usize,
    /// Band break, as a fraction of the band, that counts as full strength.
    #[serde(default = "default_bb_full_strength")]
    pub bb_full_strength: f64,
}

fn default_rsi_overbought() -> f64 {
    70.0
}
fn default_rsi_oversold() -> f64 {
    30.0
}
fn default_macd_scale_window() -> usize {
    26
}
fn default_bb_full_strength() -> f64 {
    0.02
}

impl Default for SignalParams {
    fn default() -> Self {
        Self {
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            macd_scale_window: default_macd_scale_window(),
            bb_full_strength: default_bb_full_strength(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub indicator: IndicatorKind,
    pub strength: f64,
    pub message: String,
    /// Start time of the candle the signal was derived from.
    pub candle_start: i64,
    /// Derived from an in-progress candle; not a committed transition.
    pub advisory: bool,
}

impl Signal {
    pub fn is_actionable(&self) -> bool {
        self.signal_type != SignalType::Neutral
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RsiZone {
    Oversold,
    Neutral,
    Overbought,
}

/// What the generator remembers between closed candles.
#[derive(Debug, Clone, Default, PartialEq)]
struct Memory {
    rsi_zone: Option<RsiZone>,
    histogram: Option<f64>,
    band: Option<BandPosition>,
    magnitudes: VecDeque<f64>,
    magnitude_sum: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalGenerator {
    params: SignalParams,
    memory: Memory,
    latest: Vec<Signal>,
}

impl SignalGenerator {
    pub fn new(params: SignalParams) -> Self {
        Self {
            params,
            memory: Memory::default(),
            latest: Vec::new(),
        }
    }

    /// Committed evaluation on a candle close.
    ///
    /// `previous` seeds the crossing memory when the generator has none yet
    /// (fresh start or restart from a checkpoint).
    pub fn evaluate(
        &mut self,
        previous: Option<&IndicatorSnapshot>,
        current: &IndicatorSnapshot,
    ) -> Vec<Signal> {
        let mut memory = self.memory.clone();
        if let Some(prev) = previous {
            self.seed_from(&mut memory, prev);
        }
        let signals = self.derive(&mut memory, current, false);
        self.memory = memory;
        self.latest = signals.clone();
        signals
    }

    /// Advisory signals for an in-progress snapshot. Memory is untouched.
    pub fn preview(&self, current: &IndicatorSnapshot) -> Vec<Signal> {
        let mut scratch = self.memory.clone();
        self.derive(&mut scratch, current, true)
    }

    /// Signals from the latest committed evaluation.
    pub fn latest(&self) -> &[Signal] {
        &self.latest
    }

    fn seed_from(&self, memory: &mut Memory, prev: &IndicatorSnapshot) {
        if memory.rsi_zone.is_none() {
            memory.rsi_zone = prev.rsi.value().map(|v| self.zone(v));
        }
        if memory.histogram.is_none() {
            memory.histogram = prev.macd.value().map(|m| m.histogram);
        }
        if memory.band.is_none() {
            memory.band = prev
                .bollinger
                .value()
                .map(|bb| BandPosition::of(prev.close, &bb));
        }
    }

    fn derive(&self, memory: &mut Memory, snap: &IndicatorSnapshot, advisory: bool) -> Vec<Signal> {
        let mut out = Vec::with_capacity(3);

        if let Some(rsi) = snap.rsi.value() {
            out.push(self.rsi_signal(memory, rsi));
        }
        if let Some(macd) = snap.macd.value() {
            out.push(self.macd_signal(memory, &macd));
        }
        if let Some(bb) = snap.bollinger.value() {
            out.push(self.bollinger_signal(memory, snap.close, &bb));
        }

        for s in &mut out {
            s.candle_start = snap.candle_start;
            s.advisory = advisory;
        }
        out
    }

    // -------------------------------------------------------------------------
    // RSI
    // -------------------------------------------------------------------------

    fn zone(&self, rsi: f64) -> RsiZone {
        if rsi >= self.params.rsi_overbought {
            RsiZone::Overbought
        } else if rsi <= self.params.rsi_oversold {
            RsiZone::Oversold
        } else {
            RsiZone::Neutral
        }
    }

    fn rsi_signal(&self, memory: &mut Memory, rsi: f64) -> Signal {
        let zone = self.zone(rsi);
        let entered = memory.rsi_zone != Some(zone);
        memory.rsi_zone = Some(zone);

        let span_up = (100.0 - self.params.rsi_overbought).max(f64::EPSILON);
        let span_down = self.params.rsi_oversold.max(f64::EPSILON);
        match zone {
            RsiZone::Overbought => signal(
                SignalType::Sell,
                IndicatorKind::Rsi,
                (rsi - self.params.rsi_overbought) / span_up,
                if entered {
                    format!("RSI entered overbought: {rsi:.2}")
                } else {
                    format!("RSI overbought: {rsi:.2}")
                },
            ),
            RsiZone::Oversold => signal(
                SignalType::Buy,
                IndicatorKind::Rsi,
                (self.params.rsi_oversold - rsi) / span_down,
                if entered {
                    format!("RSI entered oversold: {rsi:.2}")
                } else {
                    format!("RSI oversold: {rsi:.2}")
                },
            ),
            RsiZone::Neutral => neutral(IndicatorKind::Rsi, format!("RSI neutral: {rsi:.2}")),
        }
    }

    // -------------------------------------------------------------------------
    // MACD
    // -------------------------------------------------------------------------

    fn macd_signal(&self, memory: &mut Memory, macd: &MacdValue) -> Signal {
        let hist = macd.histogram;
        let prev = memory.histogram.replace(hist);

        let window = self.params.macd_scale_window.max(1);
        memory.magnitudes.push_back(hist.abs());
        memory.magnitude_sum += hist.abs();
        while memory.magnitudes.len() > window {
            if let Some(old) = memory.magnitudes.pop_front() {
                memory.magnitude_sum -= old;
            }
        }
        let scale = memory.magnitude_sum.max(0.0) / memory.magnitudes.len() as f64;
        let strength = if scale > 0.0 { hist.abs() / scale } else { 0.0 };

        match prev {
            Some(p) if p <= 0.0 && hist > 0.0 => signal(
                SignalType::Buy,
                IndicatorKind::Macd,
                strength,
                format!("MACD bullish crossover (histogram {hist:.6})"),
            ),
            Some(p) if p >= 0.0 && hist < 0.0 => signal(
                SignalType::Sell,
                IndicatorKind::Macd,
                strength,
                format!("MACD bearish crossover (histogram {hist:.6})"),
            ),
            _ => neutral(IndicatorKind::Macd, format!("MACD histogram {hist:.6}")),
        }
    }

    // -------------------------------------------------------------------------
    // Bollinger
    // -------------------------------------------------------------------------

    fn bollinger_signal(&self, memory: &mut Memory, close: f64, bb: &BollingerBands) -> Signal {
        let position = BandPosition::of(close, bb);
        let prev = memory.band.replace(position);
        let full = self.params.bb_full_strength.max(f64::EPSILON);

        match (prev, position) {
            (Some(p), BandPosition::Below) if p != BandPosition::Below => signal(
                SignalType::Buy,
                IndicatorKind::Bollinger,
                relative_break(bb.lower - close, bb.lower, full),
                "Price broke below lower Bollinger Band".to_string(),
            ),
            (Some(p), BandPosition::Above) if p != BandPosition::Above => signal(
                SignalType::Sell,
                IndicatorKind::Bollinger,
                relative_break(close - bb.upper, bb.upper, full),
                "Price broke above upper Bollinger Band".to_string(),
            ),
            _ => {
                let where_ = match position {
                    BandPosition::Below => "below",
                    BandPosition::Inside => "inside",
                    BandPosition::Above => "above",
                };
                neutral(
                    IndicatorKind::Bollinger,
                    format!("Price {where_} Bollinger Bands"),
                )
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn signal(signal_type: SignalType, indicator: IndicatorKind, strength: f64, message: String) -> Signal {
    let strength = if strength.is_finite() {
        strength.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Signal {
        signal_type,
        indicator,
        strength,
        message,
        candle_start: 0,
        advisory: false,
    }
}

fn neutral(indicator: IndicatorKind, message: String) -> Signal {
    signal(SignalType::Neutral, indicator, 0.0, message)
}

fn relative_break(distance: f64, band: f64, full: f64) -> f64 {
    let unit = band.abs() * full;
    if unit > 0.0 {
        distance / unit
    } else {
        1.0
    }
}
