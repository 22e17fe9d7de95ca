// =============================================================================
// Engine — wires the stream client, series pipelines and broker together
// =============================================================================
//
//   ExchangeDataSource -> ResilientStreamClient -> PipelineRouter
//                                                   |  (one channel per series)
//                                                   v
//                                  SeriesPipeline x (symbols x timeframes)
//                                                   |
//                                                   v
//                                                 Broker -> subscribers
//
// Startup: validate config, spawn pipelines, optionally warm every series from
// history, then start the stream client and the gap scheduler.
//
// Shutdown order: stop the client and the scheduler, close pipeline inputs,
// let every pipeline drain, then close subscriber queues.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::market_data::validation::normalize_symbol;
use crate::market_data::Candle;
use crate::metrics::EngineMetrics;
use crate::pipeline::{PipelineInput, SeriesPipeline, SharedView};
use crate::runtime_config::RuntimeConfig;
use crate::stream::{
    BackfillRequest, CandleRange, ConnectionState, ExchangeDataSource, ResilientStreamClient,
    TickSink,
};
use crate::types::{SeriesKey, Tick, Timeframe};

type Route = (Timeframe, mpsc::UnboundedSender<PipelineInput>);

// =============================================================================
// PipelineRouter
// =============================================================================

/// Fans ticks and backfill out to the pipelines of a symbol.
#[derive(Default)]
pub struct PipelineRouter {
    routes: RwLock<HashMap<String, Vec<Route>>>,
}

impl PipelineRouter {
    fn new() -> Self {
        Self::default()
    }

    fn add(&self, key: &SeriesKey, tx: mpsc::UnboundedSender<PipelineInput>) {
        self.routes
            .write()
            .entry(key.symbol.clone())
            .or_default()
            .push((key.timeframe, tx));
    }

    fn send_to(&self, symbol: &str, timeframe: Timeframe, input: PipelineInput) {
        let routes = self.routes.read();
        let Some((_, tx)) = routes
            .get(symbol)
            .and_then(|r| r.iter().find(|(tf, _)| *tf == timeframe))
        else {
            debug!(symbol, interval = %timeframe, "no pipeline for series");
            return;
        };
        if tx.send(input).is_err() {
            warn!(symbol, interval = %timeframe, "pipeline input closed");
        }
    }

    /// Deliver historical candles to one series.
    pub fn send_backfill(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.send_to(symbol, timeframe, PipelineInput::Backfill(candles));
    }

    /// Ask every pipeline to close buckets that ended before `now_ms`.
    pub fn flush_all(&self, now_ms: i64) {
        for targets in self.routes.read().values() {
            for (_, tx) in targets {
                let _ = tx.send(PipelineInput::Flush { now_ms });
            }
        }
    }

    /// Drop every pipeline sender so the pipelines drain and stop.
    pub fn close(&self) {
        self.routes.write().clear();
    }
}

impl TickSink for PipelineRouter {
    fn on_tick(&self, tick: Tick) {
        let routes = self.routes.read();
        let Some(targets) = routes.get(&tick.symbol) else {
            debug!(symbol = %tick.symbol, "tick for unconfigured symbol");
            return;
        };
        for (_, tx) in targets {
            let _ = tx.send(PipelineInput::Tick(tick.clone()));
        }
    }

    fn on_backfill(&self, request: &BackfillRequest, timeframe: Timeframe, candles: Vec<Candle>) {
        debug!(
            symbol = %request.symbol,
            interval = %timeframe,
            count = candles.len(),
            "routing backfill"
        );
        self.send_backfill(&request.symbol, timeframe, candles);
    }
}

// =============================================================================
// EngineHandle
// =============================================================================

pub struct EngineHandle {
    broker: Arc<Broker>,
    metrics: Arc<EngineMetrics>,
    views: HashMap<SeriesKey, SharedView>,
    connection: watch::Receiver<ConnectionState>,
    router: Arc<PipelineRouter>,
    cancel: CancellationToken,
    client_task: JoinHandle<()>,
    flush_task: JoinHandle<()>,
    pipeline_tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn views(&self) -> HashMap<SeriesKey, SharedView> {
        self.views.clone()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn series(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.views.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stop upstream intake, drain every pipeline, then close subscribers.
    pub async fn shutdown(self) {
        info!("engine shutting down");
        self.cancel.cancel();
        if let Err(e) = self.client_task.await {
            warn!(error = %e, "stream client task ended abnormally");
        }
        if let Err(e) = self.flush_task.await {
            warn!(error = %e, "gap scheduler task ended abnormally");
        }

        self.router.close();
        for task in self.pipeline_tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "pipeline task ended abnormally");
            }
        }

        self.broker.close_all();
        info!("engine stopped");
    }
}

// =============================================================================
// Startup
// =============================================================================

/// Start the engine against `source`.
pub async fn start<S: ExchangeDataSource>(
    config: RuntimeConfig,
    source: Arc<S>,
) -> Result<EngineHandle> {
    config.validate().context("invalid runtime config")?;

    let symbols = config
        .symbols
        .iter()
        .map(|s| normalize_symbol(s))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid symbol in config")?;
    let mut timeframes = config.timeframes.clone();
    timeframes.sort();
    timeframes.dedup();

    let metrics = Arc::new(EngineMetrics::new());
    let broker = Arc::new(Broker::new(config.queue_capacity, Arc::clone(&metrics)));
    let router = Arc::new(PipelineRouter::new());

    // ── Pipelines ───────────────────────────────────────────────────────
    let mut views = HashMap::new();
    let mut pipeline_tasks = Vec::new();
    for symbol in &symbols {
        for &tf in &timeframes {
            let key = SeriesKey::new(symbol.clone(), tf);
            if views.contains_key(&key) {
                continue;
            }
            let pipeline =
                SeriesPipeline::new(key.clone(), &config, Arc::clone(&broker), Arc::clone(&metrics));
            views.insert(key.clone(), pipeline.view());
            let (tx, rx) = mpsc::unbounded_channel();
            router.add(&key, tx);
            pipeline_tasks.push(tokio::spawn(pipeline.run(rx)));
        }
    }
    info!(series = views.len(), symbols = ?symbols, "pipelines started");

    // ── Warm-up ─────────────────────────────────────────────────────────
    if config.warmup_on_start {
        warm_up(&*source, &router, &views, config.history_len).await;
    }

    // ── Stream client ───────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let client = ResilientStreamClient::new(
        Arc::clone(&source),
        Arc::clone(&router),
        symbols,
        timeframes,
        config.backoff.clone(),
        Arc::clone(&metrics),
    );
    let connection = client.state();
    let client_task = tokio::spawn(client.run(cancel.child_token()));

    // ── Gap scheduler ───────────────────────────────────────────────────
    let flush_task = tokio::spawn(run_gap_scheduler(
        Arc::clone(&router),
        connection.clone(),
        Duration::from_millis(config.flush_interval_ms),
        config.flush_grace_ms as i64,
        cancel.child_token(),
    ));

    Ok(EngineHandle {
        broker,
        metrics,
        views,
        connection,
        router,
        cancel,
        client_task,
        flush_task,
        pipeline_tasks,
    })
}

/// Seed every series with its most recent `history_len` closed candles plus
/// the exchange's open candle.
async fn warm_up<S: ExchangeDataSource>(
    source: &S,
    router: &PipelineRouter,
    views: &HashMap<SeriesKey, SharedView>,
    history_len: usize,
) {
    let now = chrono::Utc::now().timestamp_millis();
    let keys: Vec<SeriesKey> = views.keys().cloned().collect();
    let fetches = keys.iter().map(|key| {
        let range = CandleRange::last(history_len + 1, key.timeframe, now);
        source.fetch_historical_candles(&key.symbol, key.timeframe, range)
    });
    let results = join_all(fetches).await;

    for (key, result) in keys.into_iter().zip(results) {
        match result {
            Ok(candles) => {
                info!(key = %key, count = candles.len(), "warm-up candles loaded");
                router.send_backfill(&key.symbol, key.timeframe, candles);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "warm-up fetch failed; series will warm from live ticks");
            }
        }
    }
}

/// Periodically close buckets that elapsed without a tick.
///
/// Runs only while the client reports `Connected`: after a reconnect the gap
/// is backfilled from history before that state is reported, so the scheduler
/// never forward-fills a range that real candles are about to cover.
async fn run_gap_scheduler(
    router: Arc<PipelineRouter>,
    connection: watch::Receiver<ConnectionState>,
    period: Duration,
    grace_ms: i64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if *connection.borrow() != ConnectionState::Connected {
            continue;
        }
        router.flush_all(chrono::Utc::now().timestamp_millis() - grace_ms);
    }
    debug!("gap scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_fans_ticks_out_per_symbol() {
        let router = PipelineRouter::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx5, mut rx5) = mpsc::unbounded_channel();
        let (txe, mut rxe) = mpsc::unbounded_channel();
        router.add(&SeriesKey::new("BTCUSDT", Timeframe::M1), tx1);
        router.add(&SeriesKey::new("BTCUSDT", Timeframe::M5), tx5);
        router.add(&SeriesKey::new("ETHUSDT", Timeframe::M1), txe);

        router.on_tick(Tick {
            symbol: "BTCUSDT".into(),
            price: 1.0,
            volume: 1.0,
            timestamp: 0,
            sequence: 1,
        });
        assert!(matches!(rx1.try_recv(), Ok(PipelineInput::Tick(_))));
        assert!(matches!(rx5.try_recv(), Ok(PipelineInput::Tick(_))));
        assert!(rxe.try_recv().is_err());

        router.send_backfill("BTCUSDT", Timeframe::M5, Vec::new());
        assert!(matches!(rx5.try_recv(), Ok(PipelineInput::Backfill(_))));
        assert!(rx1.try_recv().is_err());

        router.flush_all(42);
        assert!(matches!(rxe.try_recv(), Ok(PipelineInput::Flush { now_ms: 42 })));

        router.close();
        assert!(matches!(
            rx1.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
