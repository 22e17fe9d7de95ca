// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Incremental indicator states advanced once per closed candle. Values come
// back as `Option<T>` so callers are forced to handle warm-up; the engine turns
// those into explicit `Reading` markers for consumers.

pub mod bollinger;
pub mod ema;
pub mod engine;
pub mod macd;
pub mod rsi;

pub use bollinger::{BandPosition, BollingerBands};
pub use engine::{IndicatorEngine, IndicatorParams, IndicatorSnapshot, Reading};
pub use macd::MacdValue;
