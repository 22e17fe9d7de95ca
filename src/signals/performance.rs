// =============================================================================
// Signal Performance Tracker — outcome of every alert, in candle time
// =============================================================================
//
// Each alert opens a tracked position at the close of the candle it fired on.
// Every later closed candle marks it to market:
//
//   return >= success_pct            -> SUCCESS
//   return <= failure_pct            -> FAILURE
//   held for timeout_secs (no hit)   -> EXPIRED
//
// Completed positions are folded into a `PerformanceTally`, which is plain
// counts and sums so tallies of different series can be merged for the API.
// Only candle times are used: replaying the same candles gives the same
// outcomes.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::generator::Signal;
use crate::market_data::Candle;
use crate::types::{IndicatorKind, SignalType};

/// Completed positions kept for display per series.
const MAX_RECENT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Return (%) at or above which a position counts as a success.
    #[serde(default = "default_success_pct")]
    pub success_pct: f64,
    /// Return (%) at or below which a position counts as a failure.
    #[serde(default = "default_failure_pct")]
    pub failure_pct: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Open positions per series; the oldest is expired beyond this.
    #[serde(default = "default_max_active")]
    pub max_active: usize,
}

fn default_success_pct() -> f64 {
    0.5
}
fn default_failure_pct() -> f64 {
    -1.0
}
fn default_timeout_secs() -> u64 {
    86_400
}
fn default_max_active() -> usize {
    256
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            success_pct: default_success_pct(),
            failure_pct: default_failure_pct(),
            timeout_secs: default_timeout_secs(),
            max_active: default_max_active(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedSignal {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub indicator: IndicatorKind,
    pub entry_price: f64,
    /// End of the candle the alert fired on.
    pub entry_time: i64,
    pub exit_price: Option<f64>,
    pub exit_time: Option<i64>,
    pub return_pct: Option<f64>,
    pub outcome: Option<Outcome>,
}

impl TrackedSignal {
    /// Signed return in percent, positive when the move went the signal's way.
    fn return_at(&self, price: f64) -> f64 {
        let change = (price - self.entry_price) / self.entry_price * 100.0;
        match self.signal_type {
            SignalType::Sell => -change,
            _ => change,
        }
    }

    fn complete(&mut self, price: f64, time: i64, outcome: Outcome) {
        self.exit_price = Some(price);
        self.exit_time = Some(time);
        self.return_pct = Some(self.return_at(price));
        self.outcome = Some(outcome);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HitCount {
    pub success: u64,
    pub total: u64,
}

impl HitCount {
    fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f64 / self.total as f64
        }
    }
}

/// Mergeable counts and sums over completed positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceTally {
    pub active: u64,
    pub success: u64,
    pub failure: u64,
    pub expired: u64,
    pub sum_return_pct: f64,
    pub gross_profit_pct: f64,
    pub gross_loss_pct: f64,
    pub holding_ms: i64,
    pub by_indicator: BTreeMap<String, HitCount>,
    pub by_type: BTreeMap<String, HitCount>,
}

impl PerformanceTally {
    pub fn completed(&self) -> u64 {
        self.success + self.failure + self.expired
    }

    fn record(&mut self, position: &TrackedSignal) {
        let ret = position.return_pct.unwrap_or(0.0);
        let won = position.outcome == Some(Outcome::Success);
        match position.outcome {
            Some(Outcome::Success) => self.success += 1,
            Some(Outcome::Failure) => self.failure += 1,
            Some(Outcome::Expired) | None => self.expired += 1,
        }
        self.sum_return_pct += ret;
        if ret > 0.0 {
            self.gross_profit_pct += ret;
        } else {
            self.gross_loss_pct += -ret;
        }
        if let Some(exit) = position.exit_time {
            self.holding_ms += exit - position.entry_time;
        }
        for (map, key) in [
            (&mut self.by_indicator, position.indicator.to_string()),
            (&mut self.by_type, position.signal_type.to_string()),
        ] {
            let hits = map.entry(key).or_default();
            hits.total += 1;
            hits.success += u64::from(won);
        }
    }

    pub fn merge(&mut self, other: &PerformanceTally) {
        self.active += other.active;
        self.success += other.success;
        self.failure += other.failure;
        self.expired += other.expired;
        self.sum_return_pct += other.sum_return_pct;
        self.gross_profit_pct += other.gross_profit_pct;
        self.gross_loss_pct += other.gross_loss_pct;
        self.holding_ms += other.holding_ms;
        for (mine, theirs) in [
            (&mut self.by_indicator, &other.by_indicator),
            (&mut self.by_type, &other.by_type),
        ] {
            for (key, hits) in theirs {
                let entry = mine.entry(key.clone()).or_default();
                entry.success += hits.success;
                entry.total += hits.total;
            }
        }
    }

    pub fn summary(&self) -> PerformanceSummary {
        let completed = self.completed();
        let decided = self.success + self.failure;
        let profit_factor = if self.gross_loss_pct > 0.0 {
            Some(self.gross_profit_pct / self.gross_loss_pct)
        } else if self.gross_profit_pct > 0.0 {
            None
        } else {
            Some(0.0)
        };
        PerformanceSummary {
            total_signals: completed,
            active_signals: self.active,
            success_count: self.success,
            failure_count: self.failure,
            expired_count: self.expired,
            win_rate: if decided == 0 {
                0.0
            } else {
                self.success as f64 / decided as f64
            },
            avg_return_pct: if completed == 0 {
                0.0
            } else {
                self.sum_return_pct / completed as f64
            },
            avg_holding_secs: if completed == 0 {
                0.0
            } else {
                self.holding_ms as f64 / completed as f64 / 1_000.0
            },
            profit_factor,
            accuracy_by_indicator: self
                .by_indicator
                .iter()
                .map(|(k, v)| (k.clone(), v.rate()))
                .collect(),
            accuracy_by_type: self
                .by_type
                .iter()
                .map(|(k, v)| (k.clone(), v.rate()))
                .collect(),
        }
    }
}

/// Rates derived from a tally, as served by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_signals: u64,
    pub active_signals: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub expired_count: u64,
    /// success / (success + failure).
    pub win_rate: f64,
    pub avg_return_pct: f64,
    pub avg_holding_secs: f64,
    /// `null` when there were winners but no losing returns.
    pub profit_factor: Option<f64>,
    pub accuracy_by_indicator: BTreeMap<String, f64>,
    pub accuracy_by_type: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceTracker {
    config: PerformanceConfig,
    active: VecDeque<TrackedSignal>,
    recent: VecDeque<TrackedSignal>,
    tally: PerformanceTally,
}

impl PerformanceTracker {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config,
            active: VecDeque::new(),
            recent: VecDeque::with_capacity(MAX_RECENT),
            tally: PerformanceTally::default(),
        }
    }

    /// Open a position for every actionable alert fired on `candle`.
    pub fn track(&mut self, alerts: &[Signal], candle: &Candle) {
        for alert in alerts.iter().filter(|a| a.is_actionable() && !a.advisory) {
            if self.active.len() >= self.config.max_active.max(1) {
                if let Some(mut oldest) = self.active.pop_front() {
                    warn!(
                        indicator = %oldest.indicator,
                        entry_time = oldest.entry_time,
                        "too many open positions; expiring oldest"
                    );
                    oldest.complete(candle.close, candle.end_time, Outcome::Expired);
                    self.finish(oldest);
                }
            }
            self.active.push_back(TrackedSignal {
                signal_type: alert.signal_type,
                indicator: alert.indicator,
                entry_price: candle.close,
                entry_time: candle.end_time,
                exit_price: None,
                exit_time: None,
                return_pct: None,
                outcome: None,
            });
        }
    }

    /// Mark every open position to `candle`'s close. Returns the positions
    /// that completed.
    pub fn on_candle_closed(&mut self, candle: &Candle) -> Vec<TrackedSignal> {
        let timeout_ms = (self.config.timeout_secs as i64).saturating_mul(1_000);
        let mut done = Vec::new();
        let mut still_open = VecDeque::with_capacity(self.active.len());

        for mut position in self.active.drain(..) {
            let ret = position.return_at(candle.close);
            let outcome = if ret >= self.config.success_pct {
                Some(Outcome::Success)
            } else if ret <= self.config.failure_pct {
                Some(Outcome::Failure)
            } else if candle.end_time - position.entry_time >= timeout_ms {
                Some(Outcome::Expired)
            } else {
                None
            };
            match outcome {
                Some(o) => {
                    position.complete(candle.close, candle.end_time, o);
                    done.push(position);
                }
                None => still_open.push_back(position),
            }
        }
        self.active = still_open;

        for position in &done {
            debug!(
                indicator = %position.indicator,
                outcome = ?position.outcome,
                return_pct = ?position.return_pct,
                "position completed"
            );
            self.finish(position.clone());
        }
        done
    }

    fn finish(&mut self, position: TrackedSignal) {
        self.tally.record(&position);
        if self.recent.len() >= MAX_RECENT {
            self.recent.pop_front();
        }
        self.recent.push_back(position);
    }

    /// Tally of completed positions plus the current open count.
    pub fn tally(&self) -> PerformanceTally {
        PerformanceTally {
            active: self.active.len() as u64,
            ..self.tally.clone()
        }
    }

    /// Most recently completed positions, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &TrackedSignal> {
        self.recent.iter()
    }
}
