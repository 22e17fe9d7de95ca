// =============================================================================
// Relative Strength Index (RSI) — incremental Wilder's smoothing
// =============================================================================
//
// Step 1 — Each closed candle contributes one delta (close - previous close).
// Step 2 — The first `period` deltas seed average gain / average loss with
//          their simple means.
// Step 3 — Thereafter Wilder's smoothing is applied once per delta:
//            avg_gain = (avg_gain * (period - 1) + gain) / period
//            avg_loss = (avg_loss * (period - 1) + loss) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// Thresholds:  RSI >= 70 => OVERBOUGHT,  RSI <= 30 => OVERSOLD.
// =============================================================================

/// Running RSI state. Cheap to copy, so previews work on a copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RsiState {
    period: usize,
    prev_close: Option<f64>,
    /// Number of deltas folded in so far, saturating at `period`.
    deltas: usize,
    /// Sums of gains/losses while seeding, Wilder averages afterwards.
    avg_gain: f64,
    avg_loss: f64,
}

impl RsiState {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            deltas: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    /// Advance by exactly one closed candle.
    pub fn update(&mut self, close: f64) {
        let Some(prev) = self.prev_close.replace(close) else {
            return;
        };
        let delta = close - prev;
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        let n = self.period as f64;

        if self.deltas < self.period {
            self.avg_gain += gain;
            self.avg_loss += loss;
            self.deltas += 1;
            if self.deltas == self.period {
                self.avg_gain /= n;
                self.avg_loss /= n;
            }
        } else {
            self.avg_gain = (self.avg_gain * (n - 1.0) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
        }
    }

    /// Current RSI, or `None` until `period` deltas have been seen.
    pub fn value(&self) -> Option<f64> {
        if self.deltas < self.period {
            return None;
        }
        rsi_from_averages(self.avg_gain, self.avg_loss)
    }

    /// Deltas seen so far (capped at the period).
    pub fn samples(&self) -> usize {
        self.deltas
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn averages(&self) -> Option<(f64, f64)> {
        (self.deltas >= self.period).then_some((self.avg_gain, self.avg_loss))
    }
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Convert average gain / average loss into an RSI value in [0, 100].
///
/// - Both averages zero => 50.0 (no movement).
/// - Average loss zero  => 100.0.
/// - Average gain zero  => 0.0.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then(|| rsi.clamp(0.0, 100.0))
}
