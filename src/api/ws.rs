// =============================================================================
// WebSocket Handler — subscription protocol over the broker
// =============================================================================
//
// Clients connect to `/api/v1/ws` and drive subscriptions with JSON text
// frames:
//
//   {"action":"subscribe","symbol":"BTCUSDT","timeframe":"1m"}   (timeframe optional)
//   {"action":"unsubscribe","id":"<uuid>"}
//   {"action":"resync","id":"<uuid>"}
//   {"action":"ping"}
//
// The server answers with `subscribed` / `unsubscribed` / `resynced` / `pong`
// / `error` frames and pushes `update` frames tagged with the subscription id.
// A subscription whose queue overflowed gets a single `degraded` frame and
// should `resync`.
//
// Each subscription is drained by its own forwarder task into a per-connection
// update channel with room for a single frame. A socket that stops draining
// leaves the backlog in the broker's bounded queues, where it overflows into
// `degraded`. Command replies use a separate channel and go out first.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::broker::{Update, UpdateReceiver};
use crate::market_data::validation::normalize_symbol;
use crate::types::{SeriesKey, Timeframe};

/// Update frames buffered per connection ahead of the socket writer.
const OUTBOUND_UPDATE_FRAMES: usize = 1;

// =============================================================================
// Protocol
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        symbol: String,
        #[serde(default)]
        timeframe: Option<Timeframe>,
    },
    Unsubscribe {
        id: Uuid,
    },
    Resync {
        id: Uuid,
    },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    Subscribed {
        id: Uuid,
        symbol: String,
        timeframe: Option<Timeframe>,
    },
    Unsubscribed {
        id: Uuid,
    },
    Resynced {
        id: Uuid,
        snapshots: usize,
    },
    Update {
        id: Uuid,
        /// Per-connection message sequence.
        ws_seq: u64,
        update: &'a Update,
    },
    Degraded {
        id: Uuid,
        evicted: u64,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage<'_> {
    fn to_text(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(error = %e, "Failed to serialize WebSocket message");
                None
            }
        }
    }
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

struct Connection {
    state: Arc<AppState>,
    /// Replies to client commands; one per command read.
    reply_tx: mpsc::UnboundedSender<String>,
    update_tx: mpsc::Sender<String>,
    forwarders: HashMap<Uuid, JoinHandle<()>>,
}

impl Connection {
    fn reply(&self, msg: ServerMessage<'_>) {
        if let Some(text) = msg.to_text() {
            let _ = self.reply_tx.send(text);
        }
    }

    fn handle_text(&mut self, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "unparseable WebSocket message");
                self.reply(ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                });
                return;
            }
        };

        match msg {
            ClientMessage::Subscribe { symbol, timeframe } => self.subscribe(&symbol, timeframe),
            ClientMessage::Unsubscribe { id } => match self.state.broker.unsubscribe(id) {
                Ok(()) => {
                    // The forwarder ends once the closed queue drains.
                    self.forwarders.remove(&id);
                    self.reply(ServerMessage::Unsubscribed { id });
                }
                Err(e) => self.reply(ServerMessage::Error {
                    message: e.to_string(),
                }),
            },
            ClientMessage::Resync { id } => {
                if !self.forwarders.contains_key(&id) {
                    self.reply(ServerMessage::Error {
                        message: format!("unknown subscription {id}"),
                    });
                    return;
                }
                match self.state.broker.resync(id) {
                    Ok(snapshots) => self.reply(ServerMessage::Resynced { id, snapshots }),
                    Err(e) => self.reply(ServerMessage::Error {
                        message: e.to_string(),
                    }),
                }
            }
            ClientMessage::Ping => self.reply(ServerMessage::Pong),
        }
    }

    fn subscribe(&mut self, symbol: &str, timeframe: Option<Timeframe>) {
        let symbol = match normalize_symbol(symbol) {
            Ok(s) => s,
            Err(e) => {
                self.reply(ServerMessage::Error {
                    message: e.to_string(),
                });
                return;
            }
        };

        let known = match timeframe {
            Some(tf) => self.state.has_series(&SeriesKey::new(symbol.clone(), tf)),
            None => self.state.series().iter().any(|s| s.key.symbol == symbol),
        };
        if !known {
            self.reply(ServerMessage::Error {
                message: format!("no configured series for {symbol}"),
            });
            return;
        }

        let rx = self.state.broker.subscribe(&symbol, timeframe);
        let id = rx.id();
        self.reply(ServerMessage::Subscribed {
            id,
            symbol,
            timeframe,
        });
        // Seed the subscriber with current state.
        if let Err(e) = self.state.broker.resync(id) {
            debug!(id = %id, error = %e, "initial snapshot skipped");
        }
        let task = tokio::spawn(forward(rx, Arc::clone(&self.state), self.update_tx.clone()));
        self.forwarders.insert(id, task);
    }

    fn close(self) {
        for (id, task) in self.forwarders {
            let _ = self.state.broker.unsubscribe(id);
            task.abort();
        }
    }
}

/// Drain one subscription into the connection's update channel. Waits while
/// the channel is full, leaving newer updates queued in the broker.
async fn forward(mut rx: UpdateReceiver, state: Arc<AppState>, out_tx: mpsc::Sender<String>) {
    let id = rx.id();
    let mut degraded_sent = false;

    while let Some(update) = rx.recv().await {
        if rx.is_degraded() {
            if !degraded_sent {
                degraded_sent = true;
                let notice = ServerMessage::Degraded {
                    id,
                    evicted: rx.evicted(),
                };
                if let Some(text) = notice.to_text() {
                    if out_tx.send(text).await.is_err() {
                        break;
                    }
                }
            }
        } else {
            degraded_sent = false;
        }

        let msg = ServerMessage::Update {
            id,
            ws_seq: state.next_ws_sequence(),
            update: &update,
        };
        if let Some(text) = msg.to_text() {
            if out_tx.send(text).await.is_err() {
                break;
            }
        }
    }
    debug!(id = %id, "subscription forwarder finished");
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let (update_tx, mut update_rx) = mpsc::channel::<String>(OUTBOUND_UPDATE_FRAMES);
    let mut conn = Connection {
        state,
        reply_tx,
        update_tx,
        forwarders: HashMap::new(),
    };

    loop {
        tokio::select! {
            biased;

            // ── Push: replies, then updates ─────────────────────────────
            Some(text) = reply_rx.recv() => {
                if let Err(e) = sender.send(Message::Text(text)).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }
            Some(text) = update_rx.recv() => {
                if let Err(e) = sender.send(Message::Text(text)).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            // ── Recv: client commands ───────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => conn.handle_text(&text),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    let subscriptions = conn.forwarders.len();
    conn.close();
    info!(subscriptions, "WebSocket connection closed — cleanup complete");
}
