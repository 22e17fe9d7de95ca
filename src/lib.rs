// =============================================================================
// ta-pulse — real-time technical analysis over exchange tick streams
// =============================================================================
//
// Ticks come in through the resilient stream client, are bucketed into
// candles per (symbol, timeframe), drive RSI / MACD / Bollinger indicators and
// the signal generator, and fan out to subscribers through the broker.
// =============================================================================

pub mod api;
pub mod app_state;
pub mod broker;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod market_data;
pub mod metrics;
pub mod pipeline;
pub mod runtime_config;
pub mod signals;
pub mod stream;
pub mod types;

pub use engine::{start, EngineHandle};
pub use error::EngineError;
pub use runtime_config::RuntimeConfig;
