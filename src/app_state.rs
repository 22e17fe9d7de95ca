// =============================================================================
// Central Application State — query surface over the running engine
// =============================================================================
//
// Shared by the REST and WebSocket handlers via `Arc<AppState>`. Holds no
// analysis state of its own: series data is read from the pipelines' views,
// subscriptions go through the broker. A query that returns several parts of
// one series reads them under a single view lock.
//
// Thread safety:
//   - parking_lot::RwLock for the config and every pipeline view.
//   - Atomic counter for the WebSocket message sequence.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::broker::Broker;
use crate::engine::EngineHandle;
use crate::error::{EngineError, WarmupGap};
use crate::indicators::IndicatorSnapshot;
use crate::market_data::Candle;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::pipeline::{PipelineView, SharedView};
use crate::runtime_config::RuntimeConfig;
use crate::signals::{PerformanceSummary, PerformanceTally, Signal};
use crate::stream::ConnectionState;
use crate::types::{IndicatorKind, SeriesKey};

// =============================================================================
// Response shapes
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub connection: ConnectionState,
    pub uptime_secs: u64,
    pub series: usize,
    pub subscribers: usize,
    pub server_time: i64,
}

/// Per-series summary for `GET /api/v1/series`.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesStatus {
    pub key: SeriesKey,
    pub closed_candles: usize,
    pub warm: bool,
    pub last_close: Option<f64>,
    pub restarts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandleWindow {
    pub key: SeriesKey,
    pub closed: Vec<Candle>,
    pub open: Option<Candle>,
}

/// Committed indicators with the signals and alerts of the same close.
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorReport {
    pub indicators: IndicatorSnapshot,
    pub signals: Vec<Signal>,
    pub alerts: Vec<Signal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub overall: PerformanceSummary,
    pub series: Vec<SeriesPerformance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesPerformance {
    pub key: SeriesKey,
    #[serde(flatten)]
    pub summary: PerformanceSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalWindow {
    pub key: SeriesKey,
    pub candle_start: Option<i64>,
    pub signals: Vec<Signal>,
    pub alerts: Vec<Signal>,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub broker: Arc<Broker>,
    pub metrics: Arc<EngineMetrics>,
    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,
    views: HashMap<SeriesKey, SharedView>,
    connection: watch::Receiver<ConnectionState>,
    start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        broker: Arc<Broker>,
        metrics: Arc<EngineMetrics>,
        views: HashMap<SeriesKey, SharedView>,
        connection: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            runtime_config: Arc::new(RwLock::new(config)),
            broker,
            metrics,
            ws_sequence_number: AtomicU64::new(0),
            views,
            connection,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn from_engine(config: RuntimeConfig, engine: &EngineHandle) -> Self {
        Self::new(
            config,
            engine.broker(),
            engine.metrics(),
            engine.views(),
            engine.connection(),
        )
    }

    pub fn next_ws_sequence(&self) -> u64 {
        self.ws_sequence_number.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn view(&self, key: &SeriesKey) -> Result<&SharedView, EngineError> {
        self.views
            .get(key)
            .ok_or_else(|| EngineError::UnknownSeries(key.clone()))
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Latest committed indicators, or `InsufficientHistory` while any
    /// indicator is still warming up.
    pub fn indicators(&self, key: &SeriesKey) -> Result<IndicatorSnapshot, EngineError> {
        let view = self.view(key)?.read();
        self.committed(&view).cloned()
    }

    /// Indicators, signals and alerts read under one lock, so all three
    /// belong to the same candle close.
    pub fn indicator_report(&self, key: &SeriesKey) -> Result<IndicatorReport, EngineError> {
        let view = self.view(key)?.read();
        Ok(IndicatorReport {
            indicators: self.committed(&view)?.clone(),
            signals: view.signals.clone(),
            alerts: view.alerts.clone(),
        })
    }

    fn committed<'v>(&self, view: &'v PipelineView) -> Result<&'v IndicatorSnapshot, EngineError> {
        match &view.snapshot {
            Some(snap) if snap.is_warm() => Ok(snap),
            Some(snap) => Err(EngineError::InsufficientHistory {
                key: view.key.clone(),
                pending: snap.pending(),
            }),
            None => Err(EngineError::InsufficientHistory {
                key: view.key.clone(),
                pending: self.cold_gaps(),
            }),
        }
    }

    /// Every indicator at zero progress.
    fn cold_gaps(&self) -> Vec<WarmupGap> {
        let p = self.runtime_config.read().indicators.clone();
        vec![
            WarmupGap { indicator: IndicatorKind::Rsi, have: 0, need: p.rsi_period },
            WarmupGap { indicator: IndicatorKind::Macd, have: 0, need: p.macd_slow },
            WarmupGap { indicator: IndicatorKind::Bollinger, have: 0, need: p.bb_period },
        ]
    }

    /// The `limit` most recent closed candles plus the open one.
    pub fn candles(&self, key: &SeriesKey, limit: usize) -> Result<CandleWindow, EngineError> {
        let view = self.view(key)?.read();
        Ok(CandleWindow {
            key: key.clone(),
            closed: view.history.recent(limit),
            open: view.open.clone(),
        })
    }

    pub fn signals(&self, key: &SeriesKey) -> Result<SignalWindow, EngineError> {
        let view = self.view(key)?.read();
        Ok(SignalWindow {
            key: key.clone(),
            candle_start: view.snapshot.as_ref().map(|s| s.candle_start),
            signals: view.signals.clone(),
            alerts: view.alerts.clone(),
        })
    }

    /// Alert outcomes for one series.
    pub fn performance_of(&self, key: &SeriesKey) -> Result<PerformanceSummary, EngineError> {
        Ok(self.view(key)?.read().performance.summary())
    }

    /// Alert outcomes merged over every series, plus the per-series breakdown.
    pub fn performance(&self) -> PerformanceReport {
        let mut overall = PerformanceTally::default();
        let mut series: Vec<SeriesPerformance> = self
            .views
            .iter()
            .map(|(key, view)| {
                let tally = view.read().performance.clone();
                overall.merge(&tally);
                SeriesPerformance {
                    key: key.clone(),
                    summary: tally.summary(),
                }
            })
            .collect();
        series.sort_by(|a, b| a.key.cmp(&b.key));
        PerformanceReport {
            overall: overall.summary(),
            series,
        }
    }

    pub fn series(&self) -> Vec<SeriesStatus> {
        let mut out: Vec<SeriesStatus> = self
            .views
            .iter()
            .map(|(key, view)| {
                let view = view.read();
                SeriesStatus {
                    key: key.clone(),
                    closed_candles: view.history.len(),
                    warm: view.snapshot.as_ref().is_some_and(|s| s.is_warm()),
                    last_close: view.history.last().map(|c| c.close),
                    restarts: view.restarts,
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn has_series(&self, key: &SeriesKey) -> bool {
        self.views.contains_key(key)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn health(&self) -> HealthSnapshot {
        let connection = self.connection_state();
        HealthSnapshot {
            status: if connection == ConnectionState::Connected {
                "ok"
            } else {
                "degraded"
            },
            connection,
            uptime_secs: self.start_time.elapsed().as_secs(),
            series: self.views.len(),
            subscribers: self.broker.subscriber_count(),
            server_time: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
