// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable of the analysis engine lives here: which series to run,
// indicator periods, signal thresholds, queue sizes, reconnect policy and the
// gap-flush / preview cadence.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::DEFAULT_QUEUE_CAPACITY;
use crate::indicators::IndicatorParams;
use crate::market_data::validation::normalize_symbol;
use crate::signals::{FilterConfig, PerformanceConfig, SignalParams};
use crate::stream::BackoffPolicy;
use crate::types::Timeframe;

pub const ENV_SYMBOLS: &str = "TA_PULSE_SYMBOLS";
pub const ENV_TIMEFRAMES: &str = "TA_PULSE_TIMEFRAMES";
pub const ENV_BIND_ADDR: &str = "TA_PULSE_BIND_ADDR";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1]
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_history_len() -> usize {
    200
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_flush_grace_ms() -> u64 {
    2_000
}

fn default_preview_interval_ms() -> i64 {
    1_000
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Series -------------------------------------------------------------

    /// Symbols to stream and analyse.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Timeframes maintained for every symbol.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    /// Closed candles kept per series (also the warm-up fetch size).
    #[serde(default = "default_history_len")]
    pub history_len: usize,

    /// Seed every series from historical candles at startup.
    #[serde(default = "default_true")]
    pub warmup_on_start: bool,

    // --- Analysis -----------------------------------------------------------

    #[serde(default)]
    pub indicators: IndicatorParams,

    #[serde(default)]
    pub signals: SignalParams,

    #[serde(default)]
    pub filter: FilterConfig,

    /// Outcome thresholds for alert performance tracking.
    #[serde(default)]
    pub performance: PerformanceConfig,

    // --- Delivery -----------------------------------------------------------

    /// Per-subscription queue capacity (drop-oldest beyond this).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Minimum tick-time spacing between preview updates of one series.
    #[serde(default = "default_preview_interval_ms")]
    pub preview_interval_ms: i64,

    // --- Upstream -----------------------------------------------------------

    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// How often the gap scheduler flushes silent series.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// How long after a bucket ends before it may be closed without a tick.
    #[serde(default = "default_flush_grace_ms")]
    pub flush_grace_ms: u64,

    // --- API ----------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframes: default_timeframes(),
            history_len: default_history_len(),
            warmup_on_start: true,
            indicators: IndicatorParams::default(),
            signals: SignalParams::default(),
            filter: FilterConfig::default(),
            performance: PerformanceConfig::default(),
            queue_capacity: default_queue_capacity(),
            preview_interval_ms: default_preview_interval_ms(),
            backoff: BackoffPolicy::default(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_grace_ms: default_flush_grace_ms(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            timeframes = ?config.timeframes,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Load from `path`, or fall back to defaults with a warning.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "using default runtime config");
                Self::default()
            }
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `TA_PULSE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = get(ENV_SYMBOLS) {
            self.symbols = split_list(&raw)
                .map(|s| normalize_symbol(s).map_err(anyhow::Error::from))
                .collect::<Result<_>>()
                .with_context(|| format!("invalid {ENV_SYMBOLS}"))?;
        }
        if let Some(raw) = get(ENV_TIMEFRAMES) {
            self.timeframes = split_list(&raw)
                .map(|s| s.parse::<Timeframe>().map_err(anyhow::Error::msg))
                .collect::<Result<_>>()
                .with_context(|| format!("invalid {ENV_TIMEFRAMES}"))?;
        }
        if let Some(raw) = get(ENV_BIND_ADDR) {
            self.bind_addr = raw.trim().to_string();
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.indicators;
        ensure!(!self.symbols.is_empty(), "at least one symbol is required");
        ensure!(!self.timeframes.is_empty(), "at least one timeframe is required");
        ensure!(
            p.rsi_period > 0 && p.macd_fast > 0 && p.macd_slow > 0 && p.macd_signal > 0 && p.bb_period > 0,
            "indicator periods must be positive"
        );
        ensure!(
            p.macd_fast < p.macd_slow,
            "MACD fast period ({}) must be shorter than slow period ({})",
            p.macd_fast,
            p.macd_slow
        );
        ensure!(p.bb_std >= 0.0 && p.bb_std.is_finite(), "Bollinger k must be finite and >= 0");
        ensure!(
            self.history_len >= p.macd_slow,
            "history_len ({}) must cover the slow EMA period ({})",
            self.history_len,
            p.macd_slow
        );
        ensure!(self.queue_capacity > 0, "queue_capacity must be positive");
        ensure!(
            self.signals.rsi_oversold < self.signals.rsi_overbought,
            "RSI oversold threshold must be below overbought"
        );
        ensure!(
            self.performance.success_pct > 0.0 && self.performance.failure_pct < 0.0,
            "performance success threshold must be positive and failure threshold negative"
        );
        ensure!(self.performance.timeout_secs > 0, "performance timeout must be positive");
        ensure!(self.backoff.base_ms > 0, "backoff base must be positive");
        ensure!(self.backoff.cap_ms >= self.backoff.base_ms, "backoff cap must be >= base");
        ensure!(self.flush_interval_ms > 0, "flush_interval_ms must be positive");
        Ok(())
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}
