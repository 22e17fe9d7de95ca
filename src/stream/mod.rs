// =============================================================================
// Upstream stream module
// =============================================================================
//
// - `source`  : the Exchange Data Source trait
// - `backoff` : reconnect delay policy
// - `client`  : connection state machine, dedup, gap backfill
// - `binance` : public Binance market data

pub mod backoff;
pub mod binance;
pub mod client;
pub mod source;

pub use backoff::BackoffPolicy;
pub use binance::BinanceSource;
pub use client::{BackfillRequest, ConnectionState, ResilientStreamClient, TickSink};
pub use source::{CandleRange, ExchangeDataSource, TickStream, UpstreamCursor};
