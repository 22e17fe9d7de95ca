// =============================================================================
// Bollinger Bands — rolling window with running sums
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ), using the population standard deviation of
// the last `period` closes. Band width is the normalised distance:
// width = (upper - lower) / middle * 100.
//
// The window keeps a running sum and sum of squares so each closed candle is
// O(1). Both sums are recomputed from the window every `RESYNC_EVERY` updates
// to stop floating-point drift from accumulating.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

const RESYNC_EVERY: u32 = 512;

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub std_dev: f64,
    pub width: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BollingerState {
    period: usize,
    num_std: f64,
    window: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
    since_resync: u32,
}

impl BollingerState {
    pub fn new(period: usize, num_std: f64) -> Self {
        let period = period.max(1);
        Self {
            period,
            num_std: num_std.max(0.0),
            window: VecDeque::with_capacity(period + 1),
            sum: 0.0,
            sum_sq: 0.0,
            since_resync: 0,
        }
    }

    pub fn update(&mut self, close: f64) {
        self.window.push_back(close);
        self.sum += close;
        self.sum_sq += close * close;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }

        self.since_resync += 1;
        if self.since_resync >= RESYNC_EVERY {
            self.resync();
        }
    }

    fn resync(&mut self) {
        self.sum = self.window.iter().sum();
        self.sum_sq = self.window.iter().map(|x| x * x).sum();
        self.since_resync = 0;
    }

    /// Bands over the last `period` closes, `None` until the window is full.
    pub fn value(&self) -> Option<BollingerBands> {
        if self.window.len() < self.period {
            return None;
        }
        let n = self.period as f64;
        let middle = self.sum / n;
        // Cancellation in sum_sq/n - mean^2 can dip just below zero.
        let variance = (self.sum_sq / n - middle * middle).max(0.0);
        let std_dev = variance.sqrt();

        let upper = middle + self.num_std * std_dev;
        let lower = middle - self.num_std * std_dev;
        let width = if middle != 0.0 {
            (upper - lower) / middle * 100.0
        } else {
            0.0
        };

        middle.is_finite().then_some(BollingerBands {
            upper,
            middle,
            lower,
            std_dev,
            width,
        })
    }

    pub fn samples(&self) -> usize {
        self.window.len()
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

/// Where a close sits relative to a set of bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandPosition {
    Below,
    Inside,
    Above,
}

impl BandPosition {
    pub fn of(close: f64, bands: &BollingerBands) -> Self {
        if close < bands.lower {
            Self::Below
        } else if close > bands.upper {
            Self::Above
        } else {
            Self::Inside
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(closes: impl IntoIterator<Item = f64>) -> BollingerState {
        let mut s = BollingerState::new(20, 2.0);
        for c in closes {
            s.update(c);
        }
        s
    }

    #[test]
    fn bollinger_basic() {
        let bb = feed((1..=20).map(|x| x as f64)).value().unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
        assert!((bb.middle - 10.5).abs() < 1e-12);
        // Population std of 1..=20 is sqrt((20^2 - 1) / 12).
        let expected_std = ((400.0_f64 - 1.0) / 12.0).sqrt();
        assert!((bb.std_dev - expected_std).abs() < 1e-9);
    }

    #[test]
    fn bollinger_insufficient_data() {
        let s = feed([1.0, 2.0, 3.0]);
        assert!(s.value().is_none());
        assert_eq!(s.samples(), 3);
    }

    #[test]
    fn constant_window_collapses_bands() {
        let bb = feed(std::iter::repeat(100.0).take(30)).value().unwrap();
        assert_eq!(bb.upper, 100.0);
        assert_eq!(bb.middle, 100.0);
        assert_eq!(bb.lower, 100.0);
        assert_eq!(bb.width, 0.0);
    }

    #[test]
    fn rolling_matches_direct_computation() {
        let closes: Vec<f64> = (0..2_000)
            .map(|i| 37_000.0 + (i as f64 * 0.17).sin() * 250.0 + (i % 7) as f64)
            .collect();
        let mut s = BollingerState::new(20, 2.0);
        for (i, &c) in closes.iter().enumerate() {
            s.update(c);
            if i + 1 < 20 {
                continue;
            }
            let w = &closes[i + 1 - 20..=i];
            let mean = w.iter().sum::<f64>() / 20.0;
            let var = w.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 20.0;
            let bb = s.value().unwrap();
            assert!((bb.middle - mean).abs() < 1e-6);
            assert!((bb.std_dev - var.sqrt()).abs() < 1e-3);
        }
    }

    #[test]
    fn band_ordering_holds() {
        let mut s = BollingerState::new(20, 2.0);
        for i in 0..500 {
            s.update(1.0 + ((i * 7919) % 13) as f64 * 1e-9);
            if let Some(bb) = s.value() {
                assert!(bb.upper >= bb.middle && bb.middle >= bb.lower);
            }
        }
    }

    #[test]
    fn band_position() {
        let bb = feed((1..=20).map(|x| x as f64)).value().unwrap();
        assert_eq!(BandPosition::of(bb.lower - 1.0, &bb), BandPosition::Below);
        assert_eq!(BandPosition::of(bb.middle, &bb), BandPosition::Inside);
        assert_eq!(BandPosition::of(bb.upper + 1.0, &bb), BandPosition::Above);
    }
}
