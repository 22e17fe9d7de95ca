// =============================================================================
// Series Pipeline — Aggregator -> Indicator Engine -> Signals -> Broker
// =============================================================================
//
// One pipeline task per (symbol, timeframe), fed by an unbounded channel. The
// task is the only writer of its state, so nothing on the hot path takes a
// lock except the read-side view refresh on commit/preview.
//
// Every input runs inside a panic boundary. A fault is logged with the series
// key and the input, the state is rolled back to the checkpoint taken after
// the last committed candle, and the pipeline carries on.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Update, UpdateKind};
use crate::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::market_data::{Candle, CandleAggregator, CandleHistory, ClosedCandleEvent};
use crate::metrics::EngineMetrics;
use crate::runtime_config::RuntimeConfig;
use crate::signals::{PerformanceTally, PerformanceTracker, Signal, SignalFilter, SignalGenerator};
use crate::types::{SeriesKey, Tick};

// -----------------------------------------------------------------------------
// Inputs and shared view
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PipelineInput {
    Tick(Tick),
    /// Historical candles (warm-up or gap backfill), any order.
    Backfill(Vec<Candle>),
    /// Close every bucket that ended before `now_ms`.
    Flush { now_ms: i64 },
    /// Fault injection for the panic boundary.
    #[cfg(test)]
    Poison,
}

impl PipelineInput {
    fn describe(&self) -> String {
        match self {
            Self::Tick(t) => format!("tick seq={} ts={} price={}", t.sequence, t.timestamp, t.price),
            Self::Backfill(c) => format!("backfill of {} candles", c.len()),
            Self::Flush { now_ms } => format!("flush at {now_ms}"),
            #[cfg(test)]
            Self::Poison => "poison".to_string(),
        }
    }
}

/// What queries can see of a pipeline, refreshed on every commit.
#[derive(Debug, Clone)]
pub struct PipelineView {
    pub key: SeriesKey,
    pub history: CandleHistory,
    pub open: Option<Candle>,
    pub snapshot: Option<IndicatorSnapshot>,
    pub signals: Vec<Signal>,
    pub alerts: Vec<Signal>,
    pub performance: PerformanceTally,
    pub restarts: u64,
}

pub type SharedView = Arc<RwLock<PipelineView>>;

// -----------------------------------------------------------------------------
// State
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PipelineState {
    aggregator: CandleAggregator,
    engine: IndicatorEngine,
    generator: SignalGenerator,
    filter: SignalFilter,
    performance: PerformanceTracker,
    history: CandleHistory,
    last_preview_at: Option<i64>,
}

pub struct SeriesPipeline {
    key: SeriesKey,
    state: PipelineState,
    checkpoint: PipelineState,
    broker: Arc<Broker>,
    metrics: Arc<EngineMetrics>,
    view: SharedView,
    preview_interval_ms: i64,
    restarts: u64,
}

impl SeriesPipeline {
    pub fn new(
        key: SeriesKey,
        config: &RuntimeConfig,
        broker: Arc<Broker>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let state = PipelineState {
            aggregator: CandleAggregator::new(key.clone()),
            engine: IndicatorEngine::new(key.clone(), &config.indicators),
            generator: SignalGenerator::new(config.signals.clone()),
            filter: SignalFilter::new(config.filter.clone()),
            performance: PerformanceTracker::new(config.performance.clone()),
            history: CandleHistory::new(config.history_len),
            last_preview_at: None,
        };
        let view = Arc::new(RwLock::new(PipelineView {
            key: key.clone(),
            history: state.history.clone(),
            open: None,
            snapshot: None,
            signals: Vec::new(),
            alerts: Vec::new(),
            performance: PerformanceTally::default(),
            restarts: 0,
        }));
        Self {
            key,
            checkpoint: state.clone(),
            state,
            broker,
            metrics,
            view,
            preview_interval_ms: config.preview_interval_ms.max(0),
            restarts: 0,
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn view(&self) -> SharedView {
        Arc::clone(&self.view)
    }

    /// Drain `rx` until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PipelineInput>) {
        info!(key = %self.key, "pipeline started");
        while let Some(input) = rx.recv().await {
            self.handle(input);
        }
        info!(
            key = %self.key,
            closed = self.state.engine.closed_candles(),
            "pipeline drained"
        );
    }

    /// Apply one input inside the fault boundary.
    pub fn handle(&mut self, input: PipelineInput) {
        let label = input.describe();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.apply(input)));

        match outcome {
            Ok(true) => self.checkpoint = self.state.clone(),
            Ok(false) => {}
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    key = %self.key,
                    input = %label,
                    reason = %reason,
                    "pipeline fault; restarting from last committed state"
                );
                self.restore();
            }
        }
    }

    fn restore(&mut self) {
        let mut state = self.checkpoint.clone();
        let last_closed = state.aggregator.last_closed().cloned();
        state.aggregator = CandleAggregator::restore(self.key.clone(), last_closed);
        self.state = state;
        self.restarts += 1;
        self.metrics.inc_pipeline_restarts();

        let mut view = self.view.write();
        view.history = self.state.history.clone();
        view.open = None;
        view.snapshot = self.state.engine.latest().cloned();
        view.signals = self.state.generator.latest().to_vec();
        view.performance = self.state.performance.tally();
        view.restarts = self.restarts;
    }

    /// Returns whether committed state changed.
    fn apply(&mut self, input: PipelineInput) -> bool {
        match input {
            PipelineInput::Tick(tick) => self.on_tick(&tick),
            PipelineInput::Backfill(candles) => self.on_backfill(candles),
            PipelineInput::Flush { now_ms } => {
                let had_open = self.state.aggregator.open_candle().is_some();
                match self.state.aggregator.flush(now_ms) {
                    Some(event) => self.commit_event(event, had_open),
                    None => false,
                }
            }
            #[cfg(test)]
            PipelineInput::Poison => panic!("poisoned input"),
        }
    }

    fn on_tick(&mut self, tick: &Tick) -> bool {
        let had_open = self.state.aggregator.open_candle().is_some();
        let committed = match self.state.aggregator.ingest(tick) {
            Ok(Some(event)) => self.commit_event(event, had_open),
            Ok(None) => false,
            Err(e) => {
                self.metrics.inc_late_ticks();
                debug!(key = %self.key, error = %e, "dropping late tick");
                return false;
            }
        };
        self.maybe_preview(tick.timestamp);
        committed
    }

    fn on_backfill(&mut self, mut candles: Vec<Candle>) -> bool {
        candles.sort_by_key(|c| c.start_time);
        let mut committed = false;
        let mut adopted = 0usize;

        for candle in candles {
            if candle.symbol != self.key.symbol || candle.timeframe != self.key.timeframe {
                warn!(key = %self.key, candle = %candle.key(), "ignoring backfill for another series");
                continue;
            }
            if candle.is_closed {
                if self.state.aggregator.adopt_closed(&candle) {
                    adopted += 1;
                    committed |= self.commit(candle);
                }
            } else if self.state.aggregator.adopt_open(&candle) {
                debug!(key = %self.key, start = candle.start_time, "adopted open candle from history");
            }
        }

        info!(key = %self.key, adopted, "backfill applied");
        committed
    }

    /// Without an open candle every candle in the event is synthetic.
    fn commit_event(&mut self, event: ClosedCandleEvent, had_open: bool) -> bool {
        let filled = event.len() - usize::from(had_open);
        self.metrics.add_forward_filled(filled as u64);

        let mut committed = false;
        for candle in event.candles().cloned().collect::<Vec<_>>() {
            committed |= self.commit(candle);
        }
        committed
    }

    /// Advance indicators, signals and history with one closed candle and
    /// publish the result.
    fn commit(&mut self, candle: Candle) -> bool {
        let previous = self.state.engine.latest().cloned();
        let snapshot = match self.state.engine.on_candle_closed(&candle) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %self.key, error = %e, "closed candle rejected");
                return false;
            }
        };
        let signals = self.state.generator.evaluate(previous.as_ref(), &snapshot);
        let alerts = self.state.filter.apply(&signals);
        self.state.history.push(candle.clone());
        self.metrics.inc_candles_closed();

        for done in self.state.performance.on_candle_closed(&candle) {
            info!(
                key = %self.key,
                indicator = %done.indicator,
                signal = %done.signal_type,
                outcome = ?done.outcome,
                return_pct = ?done.return_pct,
                "alert outcome"
            );
        }
        self.state.performance.track(&alerts, &candle);

        for alert in &alerts {
            info!(
                key = %self.key,
                indicator = ?alert.indicator,
                signal = ?alert.signal_type,
                strength = alert.strength,
                message = %alert.message,
                "alert"
            );
        }

        {
            let mut view = self.view.write();
            view.history = self.state.history.clone();
            view.open = self.state.aggregator.open_candle().cloned();
            view.snapshot = Some(snapshot.clone());
            view.signals = signals.clone();
            view.alerts = alerts.clone();
            view.performance = self.state.performance.tally();
        }

        let report = self.broker.publish(Update::new(
            UpdateKind::Closed,
            candle,
            snapshot,
            signals,
            alerts,
        ));
        debug!(key = %self.key, seq = report.seq, delivered = report.delivered, "closed candle published");
        true
    }

    fn maybe_preview(&mut self, tick_time: i64) {
        let due = match self.state.last_preview_at {
            Some(last) => tick_time - last >= self.preview_interval_ms,
            None => true,
        };
        if !due {
            return;
        }
        let Some(open) = self.state.aggregator.open_candle().cloned() else {
            return;
        };
        self.state.last_preview_at = Some(tick_time);

        let snapshot = self.state.engine.preview(&open);
        let signals = self.state.generator.preview(&snapshot);
        self.view.write().open = Some(open.clone());
        self.broker.publish(Update::new(
            UpdateKind::Preview,
            open,
            snapshot,
            signals,
            Vec::new(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;

    const T0: i64 = 1_700_000_040_000; // minute-aligned

    fn setup(preview_interval_ms: i64) -> (SeriesPipeline, Arc<Broker>, Arc<EngineMetrics>) {
        let config = RuntimeConfig {
            preview_interval_ms,
            ..RuntimeConfig::default()
        };
        let metrics = Arc::new(EngineMetrics::new());
        let broker = Arc::new(Broker::new(1_024, Arc::clone(&metrics)));
        let p = SeriesPipeline::new(
            SeriesKey::new("BTCUSDT", Timeframe::M1),
            &config,
            Arc::clone(&broker),
            Arc::clone(&metrics),
        );
        (p, broker, metrics)
    }

    fn tick(seq: u64, ts: i64, price: f64) -> PipelineInput {
        PipelineInput::Tick(Tick {
            symbol: "BTCUSDT".into(),
            price,
            volume: 1.0,
            timestamp: ts,
            sequence: seq,
        })
    }

    #[test]
    fn ticks_close_candles_and_publish() {
        let (mut p, broker, metrics) = setup(i64::MAX);
        let mut rx = broker.subscribe("BTCUSDT", Some(Timeframe::M1));

        p.handle(tick(1, T0, 100.0));
        p.handle(tick(2, T0 + 30_000, 101.0));
        p.handle(tick(3, T0 + 60_000, 102.0));

        let updates = rx.drain();
        // First tick previews, then one closed update.
        let closed: Vec<_> = updates.iter().filter(|u| u.kind == UpdateKind::Closed).collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].candle.close, 101.0);
        assert_eq!(closed[0].candle.high, 101.0);
        assert_eq!(metrics.snapshot().candles_closed, 1);

        let view = p.view();
        let view = view.read();
        assert_eq!(view.history.len(), 1);
        assert_eq!(view.snapshot.as_ref().unwrap().closed_candles, 1);
    }

    #[test]
    fn late_tick_is_counted_and_ignored() {
        let (mut p, _broker, metrics) = setup(i64::MAX);
        p.handle(tick(1, T0, 100.0));
        p.handle(tick(2, T0 + 60_000, 101.0));
        p.handle(tick(3, T0 + 10_000, 50.0));
        assert_eq!(metrics.snapshot().late_ticks, 1);
        let view = p.view();
        assert_eq!(view.read().history.last().unwrap().low, 100.0);
    }

    #[test]
    fn flush_forward_fills_silence() {
        let (mut p, _broker, metrics) = setup(i64::MAX);
        p.handle(tick(1, T0, 100.0));
        p.handle(PipelineInput::Flush {
            now_ms: T0 + 3 * 60_000 + 5,
        });
        let m = metrics.snapshot();
        assert_eq!(m.candles_closed, 3);
        assert_eq!(m.forward_filled, 2);
        let view = p.view();
        let last = view.read().history.last().cloned().unwrap();
        assert_eq!(last.volume, 0.0);
        assert_eq!(last.close, 100.0);
    }

    #[test]
    fn previews_are_throttled_by_tick_time() {
        let (mut p, broker, _) = setup(10_000);
        let mut rx = broker.subscribe("BTCUSDT", None);
        for i in 0..6 {
            p.handle(tick(i + 1, T0 + i as i64 * 4_000, 100.0 + i as f64));
        }
        let previews = rx
            .drain()
            .into_iter()
            .filter(|u| u.kind == UpdateKind::Preview)
            .count();
        // Ticks at 0, 4, 8, 12, 16, 20 s preview at 0 and 12 s only.
        assert_eq!(previews, 2);
    }

    #[test]
    fn backfill_then_live() {
        let (mut p, _broker, _) = setup(i64::MAX);
        let key = SeriesKey::new("BTCUSDT", Timeframe::M1);
        let mut history: Vec<Candle> = (0..30)
            .map(|i| {
                let mut c = Candle::open_at(&key, T0 / 60_000 + i, 100.0 + i as f64, 1.0);
                c.is_closed = true;
                c
            })
            .collect();
        history.reverse();
        p.handle(PipelineInput::Backfill(history));

        {
            let view = p.view();
            let view = view.read();
            assert_eq!(view.history.len(), 30);
            assert!(view.snapshot.as_ref().unwrap().is_warm());
        }

        // A tick inside the backfilled range is late; the next bucket is live.
        p.handle(tick(1, T0 + 5 * 60_000, 1.0));
        p.handle(tick(2, T0 + 30 * 60_000, 200.0));
        p.handle(tick(3, T0 + 31 * 60_000, 201.0));
        let view = p.view();
        assert_eq!(view.read().history.len(), 31);
        assert_eq!(view.read().history.last().unwrap().close, 200.0);
    }

    #[test]
    fn panic_restores_last_committed_state() {
        let (mut p, _broker, metrics) = setup(i64::MAX);
        p.handle(tick(1, T0, 100.0));
        p.handle(tick(2, T0 + 60_000, 101.0));
        p.handle(tick(3, T0 + 61_000, 105.0));

        p.handle(PipelineInput::Poison);
        assert_eq!(metrics.snapshot().pipeline_restarts, 1);
        assert_eq!(p.view().read().restarts, 1);

        // In-progress candle was discarded; committed history survives and
        // the pipeline keeps working.
        assert!(p.state.aggregator.open_candle().is_none());
        assert_eq!(p.state.engine.closed_candles(), 1);
        p.handle(tick(4, T0 + 62_000, 103.0));
        p.handle(tick(5, T0 + 120_000, 104.0));
        assert_eq!(p.state.engine.closed_candles(), 2);
        assert_eq!(p.view().read().history.last().unwrap().open, 103.0);
    }

    #[test]
    fn committed_candles_settle_open_alerts() {
        let (mut p, _broker, _) = setup(i64::MAX);
        p.handle(tick(1, T0, 100.0));
        p.handle(tick(2, T0 + 60_000, 101.0));

        let entry = p.view().read().history.last().cloned().unwrap();
        let alert = Signal {
            signal_type: crate::types::SignalType::Buy,
            indicator: crate::types::IndicatorKind::Rsi,
            strength: 0.9,
            message: "oversold".into(),
            candle_start: entry.start_time,
            advisory: false,
        };
        p.state.performance.track(&[alert], &entry);

        // Next close is 101 against an entry of 100.
        p.handle(tick(3, T0 + 120_000, 102.0));
        let perf = p.view().read().performance.clone();
        assert_eq!(perf.success, 1);
        assert_eq!(perf.active, 0);
        assert!((perf.sum_return_pct - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn run_drains_then_exits() {
        let (p, broker, _) = setup(i64::MAX);
        let mut rx = broker.subscribe("BTCUSDT", None);
        let (tx, input_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(p.run(input_rx));
        for i in 0..5 {
            tx.send(tick(i + 1, T0 + i as i64 * 60_000, 100.0)).unwrap();
        }
        drop(tx);
        task.await.unwrap();
        let closed = rx
            .drain()
            .into_iter()
            .filter(|u| u.kind == UpdateKind::Closed)
            .count();
        assert_eq!(closed, 4);
    }
}
