// =============================================================================
// Signal Filter — turns raw committed signals into actionable alerts
// =============================================================================
//
// A signal becomes an alert when it
//   1. is BUY or SELL,
//   2. has strength >= min_strength,
//   3. comes from an allowed indicator (when a list is configured),
//   4. is confirmed by `required_confirmations - 1` other indicators pointing
//      the same way within the confirmation window,
//   5. is outside the cooldown for its (indicator, direction) pair.
//
// All times are candle times in milliseconds, so replaying the same candles
// gives the same alerts.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::generator::Signal;
use crate::types::{IndicatorKind, SignalType};

const MAX_RECENT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_min_strength")]
    pub min_strength: f64,
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: usize,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_confirmation_window_secs")]
    pub confirmation_window_secs: u64,
    #[serde(default)]
    pub allowed_indicators: Option<Vec<IndicatorKind>>,
}

fn default_min_strength() -> f64 {
    0.3
}
fn default_required_confirmations() -> usize {
    1
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_confirmation_window_secs() -> u64 {
    300
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_strength: default_min_strength(),
            required_confirmations: default_required_confirmations(),
            cooldown_secs: default_cooldown_secs(),
            confirmation_window_secs: default_confirmation_window_secs(),
            allowed_indicators: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalFilter {
    config: FilterConfig,
    last_fired: HashMap<(IndicatorKind, SignalType), i64>,
    recent: VecDeque<Signal>,
}

impl SignalFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            last_fired: HashMap::new(),
            recent: VecDeque::with_capacity(MAX_RECENT + 1),
        }
    }

    /// Filter one batch of committed signals (one candle close).
    pub fn apply(&mut self, signals: &[Signal]) -> Vec<Signal> {
        let Some(now) = signals.iter().map(|s| s.candle_start).max() else {
            return Vec::new();
        };

        for s in signals.iter().filter(|s| s.is_actionable() && !s.advisory) {
            self.recent.push_back(s.clone());
        }
        self.prune(now);

        let mut alerts = Vec::new();
        for s in signals {
            if !s.is_actionable() || s.advisory {
                continue;
            }
            if s.strength < self.config.min_strength {
                continue;
            }
            if !self.allowed(s.indicator) {
                continue;
            }
            if !self.confirmed(s) {
                continue;
            }
            if !self.cooled_down(s) {
                continue;
            }
            alerts.push(s.clone());
        }
        alerts
    }

    fn allowed(&self, indicator: IndicatorKind) -> bool {
        match &self.config.allowed_indicators {
            Some(list) => list.contains(&indicator),
            None => true,
        }
    }

    fn confirmed(&self, signal: &Signal) -> bool {
        if self.config.required_confirmations <= 1 {
            return true;
        }
        let window = self.config.confirmation_window_secs as i64 * 1_000;
        let mut agreeing: Vec<IndicatorKind> = self
            .recent
            .iter()
            .filter(|s| {
                s.signal_type == signal.signal_type
                    && s.indicator != signal.indicator
                    && (signal.candle_start - s.candle_start).abs() <= window
            })
            .map(|s| s.indicator)
            .collect();
        agreeing.sort_by_key(|k| *k as u8);
        agreeing.dedup();
        agreeing.len() + 1 >= self.config.required_confirmations
    }

    /// Records the alert time when the pair is outside its cooldown.
    fn cooled_down(&mut self, signal: &Signal) -> bool {
        let key = (signal.indicator, signal.signal_type);
        let cooldown = self.config.cooldown_secs as i64 * 1_000;
        if let Some(&last) = self.last_fired.get(&key) {
            if signal.candle_start - last < cooldown {
                return false;
            }
        }
        self.last_fired.insert(key, signal.candle_start);
        true
    }

    fn prune(&mut self, now: i64) {
        let window = self.config.confirmation_window_secs as i64 * 1_000;
        self.recent.retain(|s| now - s.candle_start <= window);
        while self.recent.len() > MAX_RECENT {
            self.recent.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn sig(indicator: IndicatorKind, signal_type: SignalType, strength: f64, at: i64) -> Signal {
        Signal {
            signal_type,
            indicator,
            strength,
            message: String::new(),
            candle_start: at,
            advisory: false,
        }
    }

    #[test]
    fn weak_and_neutral_signals_are_dropped() {
        let mut f = SignalFilter::new(FilterConfig::default());
        let alerts = f.apply(&[
            sig(IndicatorKind::Rsi, SignalType::Buy, 0.1, 0),
            sig(IndicatorKind::Macd, SignalType::Neutral, 0.0, 0),
            sig(IndicatorKind::Bollinger, SignalType::Sell, 0.9, 0),
        ]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].indicator, IndicatorKind::Bollinger);
    }

    #[test]
    fn cooldown_in_candle_time() {
        let mut f = SignalFilter::new(FilterConfig::default());
        let s = |at| sig(IndicatorKind::Rsi, SignalType::Sell, 0.8, at);
        assert_eq!(f.apply(&[s(0)]).len(), 1);
        assert!(f.apply(&[s(MIN)]).is_empty());
        assert!(f.apply(&[s(4 * MIN)]).is_empty());
        assert_eq!(f.apply(&[s(5 * MIN)]).len(), 1);
        // Opposite direction has its own cooldown.
        assert_eq!(
            f.apply(&[sig(IndicatorKind::Rsi, SignalType::Buy, 0.8, 5 * MIN)]).len(),
            1
        );
    }

    #[test]
    fn allowed_indicator_list() {
        let mut f = SignalFilter::new(FilterConfig {
            allowed_indicators: Some(vec![IndicatorKind::Macd]),
            ..FilterConfig::default()
        });
        let alerts = f.apply(&[
            sig(IndicatorKind::Rsi, SignalType::Buy, 0.9, 0),
            sig(IndicatorKind::Macd, SignalType::Buy, 0.9, 0),
        ]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].indicator, IndicatorKind::Macd);
    }

    #[test]
    fn confirmations_across_indicators() {
        let mut f = SignalFilter::new(FilterConfig {
            required_confirmations: 2,
            ..FilterConfig::default()
        });
        // Alone: not confirmed.
        assert!(f.apply(&[sig(IndicatorKind::Rsi, SignalType::Buy, 0.9, 0)]).is_empty());
        // MACD agrees a minute later: MACD is confirmed by the earlier RSI.
        let alerts = f.apply(&[sig(IndicatorKind::Macd, SignalType::Buy, 0.9, MIN)]);
        assert_eq!(alerts.len(), 1);
        // Outside the window nothing confirms.
        assert!(f
            .apply(&[sig(IndicatorKind::Bollinger, SignalType::Buy, 0.9, 20 * MIN)])
            .is_empty());
    }

    #[test]
    fn advisory_signals_never_alert() {
        let mut f = SignalFilter::new(FilterConfig::default());
        let mut s = sig(IndicatorKind::Rsi, SignalType::Buy, 0.9, 0);
        s.advisory = true;
        assert!(f.apply(&[s]).is_empty());
    }
}
