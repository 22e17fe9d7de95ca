// =============================================================================
// MACD (12, 26, 9)
// =============================================================================
//
//   macd      = EMA_fast(close) - EMA_slow(close)
//   signal    = EMA_signal(macd)
//   histogram = macd - signal
//
// The MACD line is available once the slow EMA is seeded. The signal EMA is
// fed one MACD value per closed candle from then on; until it has seen
// `signal_period` values it reports the running mean of the MACD values so far
// (which equals its SMA seed on the `signal_period`-th value).
// =============================================================================

use serde::{Deserialize, Serialize};

use super::ema::EmaState;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    /// `false` while the signal line is still a provisional mean.
    pub signal_settled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdState {
    fast: EmaState,
    slow: EmaState,
    signal: EmaState,
}

impl MacdState {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: EmaState::new(fast),
            slow: EmaState::new(slow),
            signal: EmaState::new(signal),
        }
    }

    pub fn update(&mut self, close: f64) {
        self.fast.update(close);
        self.slow.update(close);
        if let Some(line) = self.line() {
            self.signal.update(line);
        }
    }

    fn line(&self) -> Option<f64> {
        Some(self.fast.value()? - self.slow.value()?)
    }

    pub fn value(&self) -> Option<MacdValue> {
        let macd = self.line()?;
        let signal = self.signal.provisional()?;
        Some(MacdValue {
            macd,
            signal,
            histogram: macd - signal,
            signal_settled: self.signal.value().is_some(),
        })
    }

    /// Closes seen by the slow EMA (capped at its period).
    pub fn samples(&self) -> usize {
        self.slow.samples()
    }

    pub fn required(&self) -> usize {
        self.slow.period()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(closes: impl IntoIterator<Item = f64>) -> MacdState {
        let mut m = MacdState::new(12, 26, 9);
        for c in closes {
            m.update(c);
        }
        m
    }

    #[test]
    fn available_at_slow_period() {
        let m = feed((1..=25).map(|x| x as f64));
        assert!(m.value().is_none());
        assert_eq!(m.samples(), 25);

        let m = feed((1..=26).map(|x| x as f64));
        let v = m.value().unwrap();
        assert!(!v.signal_settled);
        // First MACD value is its own provisional signal.
        assert!(v.histogram.abs() < 1e-12);
    }

    #[test]
    fn signal_settles_after_nine_macd_values() {
        let m = feed((1..=33).map(|x| x as f64));
        assert!(!m.value().unwrap().signal_settled);
        let m = feed((1..=34).map(|x| x as f64));
        assert!(m.value().unwrap().signal_settled);
    }

    #[test]
    fn constant_closes_give_zero_histogram() {
        let v = feed(std::iter::repeat(100.0).take(30)).value().unwrap();
        assert_eq!(v.macd, 0.0);
        assert_eq!(v.signal, 0.0);
        assert_eq!(v.histogram, 0.0);
    }

    #[test]
    fn rising_closes_give_positive_macd() {
        let v = feed((1..=60).map(|x| x as f64)).value().unwrap();
        assert!(v.macd > 0.0);
        assert!((v.histogram - (v.macd - v.signal)).abs() < 1e-12);
    }

    #[test]
    fn matches_reference_ema_difference() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0).collect();
        let m = feed(closes.iter().copied());

        let ema = |period: usize| {
            let k = 2.0 / (period as f64 + 1.0);
            let mut v = closes[..period].iter().sum::<f64>() / period as f64;
            for &c in &closes[period..] {
                v = c * k + v * (1.0 - k);
            }
            v
        };
        let expected = ema(12) - ema(26);
        assert!((m.value().unwrap().macd - expected).abs() < 1e-9);
    }
}
