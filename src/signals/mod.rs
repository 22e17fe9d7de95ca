// =============================================================================
// Signals Module
// =============================================================================
//
// - Transition-based BUY/SELL/NEUTRAL signals per indicator
// - Alert filtering (strength, cooldown, confirmations)
// - Alert outcome tracking (win rate, returns, accuracy)

pub mod filter;
pub mod generator;
pub mod performance;

pub use filter::{FilterConfig, SignalFilter};
pub use generator::{Signal, SignalGenerator, SignalParams};
pub use performance::{PerformanceConfig, PerformanceSummary, PerformanceTally, PerformanceTracker};
