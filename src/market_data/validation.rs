// =============================================================================
// Tick Validation — the boundary between upstream payloads and typed ticks
// =============================================================================
//
// Upstream adapters hand the stream client loosely-checked `RawTick` values.
// Nothing reaches a pipeline unless it converts into a `Tick` here; every
// rejection is a `MalformedTick` error that the caller counts and drops.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::Tick;

/// Largest price accepted from upstream.
pub const MAX_PRICE: f64 = 1e10;
/// Smallest strictly-positive price accepted from upstream.
pub const MIN_PRICE: f64 = 1e-10;
/// Largest per-tick volume accepted from upstream.
pub const MAX_VOLUME: f64 = 1e14;
/// How far ahead of the local clock a tick timestamp may be.
pub const MAX_FUTURE_SKEW_MS: i64 = 60_000;

/// Tick as decoded by an exchange adapter, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: i64,
    pub sequence: u64,
}

/// Normalise a symbol to the exchange's compact upper-case form
/// (`btc/usdt` -> `BTCUSDT`).
pub fn normalize_symbol(raw: &str) -> Result<String, EngineError> {
    let symbol: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '/' && *c != '-')
        .collect::<String>()
        .to_uppercase();

    if symbol.is_empty() {
        return Err(EngineError::malformed("empty symbol"));
    }
    if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::malformed(format!("invalid symbol '{raw}'")));
    }
    Ok(symbol)
}

/// Validate a raw tick against the local clock `now_ms`.
pub fn validate_tick(raw: RawTick, now_ms: i64) -> Result<Tick, EngineError> {
    let symbol = normalize_symbol(&raw.symbol)?;

    if !raw.price.is_finite() || !(MIN_PRICE..=MAX_PRICE).contains(&raw.price) {
        return Err(EngineError::malformed(format!(
            "{symbol}: price {} outside valid range",
            raw.price
        )));
    }
    if !raw.volume.is_finite() || !(0.0..=MAX_VOLUME).contains(&raw.volume) {
        return Err(EngineError::malformed(format!(
            "{symbol}: volume {} outside valid range",
            raw.volume
        )));
    }
    if raw.timestamp < 0 {
        return Err(EngineError::malformed(format!(
            "{symbol}: negative timestamp {}",
            raw.timestamp
        )));
    }
    if raw.timestamp > now_ms + MAX_FUTURE_SKEW_MS {
        return Err(EngineError::malformed(format!(
            "{symbol}: timestamp {} is in the future",
            raw.timestamp
        )));
    }

    Ok(Tick {
        symbol,
        price: raw.price,
        volume: raw.volume,
        timestamp: raw.timestamp,
        sequence: raw.sequence,
    })
}
