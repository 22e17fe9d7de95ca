// =============================================================================
// Reconnect backoff
// =============================================================================
//
//   delay = min(base * 2^attempt, cap) * (1 +/- jitter)      (never above cap)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    /// Fractional jitter applied symmetrically around the exponential delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// A connection held this long resets the attempt counter.
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,
}

fn default_base_ms() -> u64 {
    1_000
}
fn default_cap_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}
fn default_stability_window_ms() -> u64 {
    10_000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            jitter: default_jitter(),
            stability_window_ms: default_stability_window_ms(),
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, cap)` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }

    /// Delay for `attempt` with `unit` in [0, 1) selecting the jitter.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let spread = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + spread * (2.0 * unit.clamp(0.0, 1.0) - 1.0);
        let ms = (base * factor).clamp(0.0, self.cap_ms as f64);
        Duration::from_millis(ms.round() as u64)
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, jitter_unit())
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }
}

/// Uniform sample in [0, 1) from the random bits of a v4 UUID.
fn jitter_unit() -> f64 {
    // The low 62 bits of a v4 UUID are random.
    let bits = Uuid::new_v4().as_u128() as u64 & ((1_u64 << 53) - 1);
    bits as f64 / (1_u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_then_capped() {
        let p = BackoffPolicy::default();
        let ms: Vec<u128> = (0..7).map(|a| p.base_delay(a).as_millis()).collect();
        assert_eq!(ms, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        assert_eq!(p.base_delay(200).as_millis(), 30_000);
    }

    #[test]
    fn jitter_bounds() {
        let p = BackoffPolicy::default();
        assert_eq!(p.delay_with(2, 0.0).as_millis(), 3_200);
        assert_eq!(p.delay_with(2, 0.5).as_millis(), 4_000);
        assert_eq!(p.delay_with(2, 1.0).as_millis(), 4_800);
        // Never above the cap.
        assert_eq!(p.delay_with(10, 1.0).as_millis(), 30_000);
        for _ in 0..100 {
            let d = p.next_delay(1).as_millis();
            assert!((1_600..=2_400).contains(&d), "{d}");
        }
    }

    #[test]
    fn jitter_unit_in_range() {
        for _ in 0..1_000 {
            let u = jitter_unit();
            assert!((0.0..1.0).contains(&u));
        }
    }
}
