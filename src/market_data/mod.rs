pub mod aggregator;
pub mod candle;
pub mod validation;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use aggregator::CandleAggregator;
pub use candle::{Candle, CandleHistory, ClosedCandleEvent};
pub use validation::{validate_tick, RawTick};
