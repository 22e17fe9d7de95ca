// =============================================================================
// Exponential Moving Average (EMA) — incremental form
// =============================================================================
//
//   multiplier = 2 / (period + 1)
//   EMA_t      = EMA_{t-1} + multiplier * (close_t - EMA_{t-1})
//
// The first EMA value is the SMA of the first `period` inputs. Written in the
// "previous + step" form so a constant input leaves the EMA exactly unchanged.
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaState {
    period: usize,
    multiplier: f64,
    count: usize,
    seed_sum: f64,
    value: Option<f64>,
}

impl EmaState {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            multiplier: 2.0 / (period as f64 + 1.0),
            count: 0,
            seed_sum: 0.0,
            value: None,
        }
    }

    pub fn update(&mut self, x: f64) {
        match self.value {
            Some(prev) => {
                self.value = Some(prev + self.multiplier * (x - prev));
            }
            None => {
                self.seed_sum += x;
                self.count += 1;
                if self.count == self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
        }
    }

    /// Seeded EMA value, `None` during warm-up.
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Seeded value, or the running mean of the inputs seen so far while
    /// still seeding. `None` only before the first input.
    pub fn provisional(&self) -> Option<f64> {
        self.value
            .or_else(|| (self.count > 0).then(|| self.seed_sum / self.count as f64))
    }

    /// Inputs seen so far (capped at the period).
    pub fn samples(&self) -> usize {
        if self.value.is_some() {
            self.period
        } else {
            self.count
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}
