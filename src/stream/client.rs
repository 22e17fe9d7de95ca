// =============================================================================
// Resilient Stream Client — upstream connection state machine
// =============================================================================
//
//   Disconnected -> Connecting -> Connected -> (failure) Backoff -> Connecting
//
// Each connection subscribes to the full symbol set. Before live ticks are
// handed on, every symbol whose upstream cursor moved past the last sequence
// we received is backfilled from history, so downstream never skips a range.
// The state is only reported `Connected` once that recovery is done.
//
// The receive loop is the only producer of ticks. Sinks must not block.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::source::{CandleRange, ExchangeDataSource, TickStream};
use crate::error::EngineError;
use crate::market_data::{validate_tick, Candle, RawTick};
use crate::metrics::EngineMetrics;
use crate::types::{SeriesKey, Tick, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff { attempt: u32, delay_ms: u64 },
}

/// Missing range detected on reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillRequest {
    pub symbol: String,
    pub first_missing_seq: u64,
    pub last_missing_seq: u64,
    /// Timestamp of the last tick received before the disconnect.
    pub since: i64,
    /// Upstream's timestamp for `last_missing_seq`.
    pub until: i64,
}

/// Downstream of the stream client.
pub trait TickSink: Send + Sync + 'static {
    fn on_tick(&self, tick: Tick);

    /// Historical candles covering a backfill request, oldest first.
    fn on_backfill(&self, request: &BackfillRequest, timeframe: Timeframe, candles: Vec<Candle>);
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    sequence: u64,
    timestamp: i64,
}

enum StreamEnd {
    Cancelled,
    Closed,
    Failed(EngineError),
}

pub struct ResilientStreamClient<S, K> {
    source: Arc<S>,
    sink: Arc<K>,
    symbols: Vec<String>,
    timeframes: Vec<Timeframe>,
    policy: BackoffPolicy,
    metrics: Arc<EngineMetrics>,
    cursors: HashMap<String, Cursor>,
    state_tx: watch::Sender<ConnectionState>,
    connections: u64,
}

impl<S: ExchangeDataSource, K: TickSink> ResilientStreamClient<S, K> {
    pub fn new(
        source: Arc<S>,
        sink: Arc<K>,
        symbols: Vec<String>,
        timeframes: Vec<Timeframe>,
        policy: BackoffPolicy,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            source,
            sink,
            symbols,
            timeframes,
            policy,
            metrics,
            cursors: HashMap::new(),
            state_tx,
            connections: 0,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            info!(symbols = ?self.symbols, attempt, "connecting to upstream");

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.source.stream_ticks(&self.symbols) => r,
            };

            match opened {
                Ok(mut stream) => {
                    self.connections += 1;
                    if self.connections > 1 {
                        self.metrics.inc_reconnects();
                    }

                    match self.recover_gaps(&cancel).await {
                        Ok(()) => {}
                        Err(StreamEnd::Failed(e)) => {
                            // Cursors untouched: the gap is detected again on
                            // the next connection.
                            warn!(error = %e, "gap recovery failed; dropping connection");
                            self.metrics.inc_backfill_failures();
                            self.backoff(&mut attempt, &cancel).await;
                            continue;
                        }
                        Err(_) => break,
                    }
                    self.set_state(ConnectionState::Connected);
                    info!(connections = self.connections, "upstream connected");

                    let connected_at = Instant::now();
                    let end = self.pump(&mut stream, &cancel).await;
                    if connected_at.elapsed() >= self.policy.stability_window() {
                        attempt = 0;
                    }
                    match end {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Closed => warn!("upstream stream ended"),
                        StreamEnd::Failed(e) => warn!(error = %e, "upstream stream failed"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "upstream connect failed");
                }
            }

            self.backoff(&mut attempt, &cancel).await;
        }

        self.set_state(ConnectionState::Disconnected);
        info!("stream client stopped");
    }

    async fn backoff(&self, attempt: &mut u32, cancel: &CancellationToken) {
        self.set_state(ConnectionState::Disconnected);
        let delay = self.policy.next_delay(*attempt);
        *attempt = attempt.saturating_add(1);
        self.set_state(ConnectionState::Backoff {
            attempt: *attempt,
            delay_ms: delay.as_millis() as u64,
        });
        warn!(attempt = *attempt, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Backfill every symbol whose upstream cursor is ahead of ours.
    ///
    /// A symbol's candles are handed to the sink only once every timeframe
    /// was fetched, and its cursor only advances after that. Any failed call
    /// aborts recovery with the cursor left where it was.
    async fn recover_gaps(&mut self, cancel: &CancellationToken) -> Result<(), StreamEnd> {
        for symbol in self.symbols.clone() {
            let Some(last) = self.cursors.get(&symbol).copied() else {
                continue;
            };

            let upstream = tokio::select! {
                _ = cancel.cancelled() => return Err(StreamEnd::Cancelled),
                r = self.source.latest_cursor(&symbol) => r,
            };
            let upstream = match upstream {
                Ok(Some(c)) => c,
                Ok(None) => continue,
                Err(e) => {
                    return Err(StreamEnd::Failed(EngineError::UpstreamConnection(format!(
                        "cursor for {symbol} unavailable: {e}"
                    ))))
                }
            };
            if upstream.sequence <= last.sequence {
                continue;
            }

            let request = BackfillRequest {
                symbol: symbol.clone(),
                first_missing_seq: last.sequence + 1,
                last_missing_seq: upstream.sequence,
                since: last.timestamp,
                until: upstream.timestamp.max(last.timestamp),
            };
            info!(
                symbol = %symbol,
                first = request.first_missing_seq,
                last = request.last_missing_seq,
                "gap detected; backfilling"
            );
            self.metrics.inc_backfill_requests();

            let mut fetched = Vec::with_capacity(self.timeframes.len());
            for &tf in &self.timeframes {
                let range = CandleRange::between(
                    tf.bucket_start(tf.bucket_of(request.since)),
                    request.until,
                );
                let result = tokio::select! {
                    _ = cancel.cancelled() => return Err(StreamEnd::Cancelled),
                    r = self.source.fetch_historical_candles(&symbol, tf, range) => r,
                };
                match result {
                    Ok(candles) => fetched.push((tf, candles)),
                    Err(e) => {
                        return Err(StreamEnd::Failed(EngineError::Backfill {
                            key: SeriesKey::new(symbol.clone(), tf),
                            reason: e.to_string(),
                        }))
                    }
                }
            }

            for (tf, candles) in fetched {
                self.metrics.add_backfilled_candles(candles.len() as u64);
                self.sink.on_backfill(&request, tf, candles);
            }
            self.cursors.insert(
                symbol,
                Cursor {
                    sequence: upstream.sequence,
                    timestamp: request.until,
                },
            );
        }
        Ok(())
    }

    async fn pump(&mut self, stream: &mut TickStream, cancel: &CancellationToken) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                n = stream.next() => n,
            };
            match next {
                None => return StreamEnd::Closed,
                Some(Ok(raw)) => self.accept(raw),
                Some(Err(e)) if e.is_tick_level() => {
                    self.metrics.inc_malformed_ticks();
                    debug!(error = %e, "dropping malformed tick");
                }
                Some(Err(e)) => return StreamEnd::Failed(e),
            }
        }
    }

    fn accept(&mut self, raw: RawTick) {
        let tick = match validate_tick(raw, chrono::Utc::now().timestamp_millis()) {
            Ok(t) => t,
            Err(e) => {
                self.metrics.inc_malformed_ticks();
                debug!(error = %e, "dropping malformed tick");
                return;
            }
        };

        if let Some(last) = self.cursors.get(&tick.symbol) {
            if tick.sequence <= last.sequence {
                self.metrics.inc_duplicate_ticks();
                debug!(
                    symbol = %tick.symbol,
                    sequence = tick.sequence,
                    last = last.sequence,
                    "dropping duplicate tick"
                );
                return;
            }
        }
        self.cursors.insert(
            tick.symbol.clone(),
            Cursor {
                sequence: tick.sequence,
                timestamp: tick.timestamp,
            },
        );
        self.metrics.inc_ticks_ingested();
        self.sink.on_tick(tick);
    }
}
