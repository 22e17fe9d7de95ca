// =============================================================================
// Subscription Broker — per-symbol fan-out with bounded delivery
// =============================================================================
//
// symbol -> subscriptions. The registry lock only guards membership; publish
// takes it shared, offers the update to each matching queue, and never waits
// on a consumer. A full queue evicts its oldest entry and the subscription is
// flagged degraded until it asks for a resync.
//
// Sequence numbers are handed out under the same lock that orders the offers,
// so every queue sees strictly increasing `seq` even with several pipelines
// publishing the same symbol.
// =============================================================================

mod subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::indicators::IndicatorSnapshot;
use crate::market_data::Candle;
use crate::metrics::EngineMetrics;
use crate::signals::Signal;
use crate::types::{SeriesKey, Timeframe};

use subscription::{Offer, SubscriptionQueue};
pub use subscription::UpdateReceiver;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// Committed: a candle closed and indicators advanced.
    Closed,
    /// Advisory: computed from the in-progress candle.
    Preview,
    /// Full state for a (re)synchronising subscriber.
    Snapshot,
}

/// One message delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Update {
    /// Broker-assigned, strictly increasing across all publishes.
    pub seq: u64,
    pub kind: UpdateKind,
    pub key: SeriesKey,
    pub candle: Candle,
    pub indicators: IndicatorSnapshot,
    pub signals: Vec<Signal>,
    pub alerts: Vec<Signal>,
}

impl Update {
    pub fn new(
        kind: UpdateKind,
        candle: Candle,
        indicators: IndicatorSnapshot,
        signals: Vec<Signal>,
        alerts: Vec<Signal>,
    ) -> Self {
        Self {
            seq: 0,
            kind,
            key: indicators.key.clone(),
            candle,
            indicators,
            signals,
            alerts,
        }
    }
}

/// Outcome of a single publish.
#[derive(Debug, Default)]
pub struct PublishReport {
    pub seq: u64,
    pub delivered: usize,
    /// Subscriptions that just became degraded.
    pub overflows: Vec<EngineError>,
}

#[derive(Default)]
struct Registry {
    by_symbol: HashMap<String, Vec<Arc<SubscriptionQueue>>>,
    by_id: HashMap<Uuid, Arc<SubscriptionQueue>>,
}

impl Registry {
    fn remove(&mut self, id: Uuid) -> Option<Arc<SubscriptionQueue>> {
        let queue = self.by_id.remove(&id)?;
        if let Some(list) = self.by_symbol.get_mut(&queue.symbol) {
            list.retain(|q| q.id != id);
            if list.is_empty() {
                self.by_symbol.remove(&queue.symbol);
            }
        }
        Some(queue)
    }
}

pub struct Broker {
    capacity: usize,
    registry: RwLock<Registry>,
    latest: Mutex<HashMap<SeriesKey, Arc<Update>>>,
    /// Last assigned sequence; held while offering.
    seq: Mutex<u64>,
    closed: AtomicBool,
    metrics: Arc<EngineMetrics>,
}

impl Broker {
    pub fn new(capacity: usize, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            capacity: capacity.max(1),
            registry: RwLock::new(Registry::default()),
            latest: Mutex::new(HashMap::new()),
            seq: Mutex::new(0),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Register interest in `symbol`, optionally narrowed to one timeframe.
    /// The returned receiver is the subscription handle.
    pub fn subscribe(&self, symbol: &str, timeframe: Option<Timeframe>) -> UpdateReceiver {
        let queue = Arc::new(SubscriptionQueue::new(
            symbol.to_string(),
            timeframe,
            self.capacity,
        ));
        if self.closed.load(Ordering::Acquire) {
            queue.close();
            return UpdateReceiver::new(queue);
        }

        {
            let mut reg = self.registry.write();
            reg.by_symbol
                .entry(queue.symbol.clone())
                .or_default()
                .push(Arc::clone(&queue));
            reg.by_id.insert(queue.id, Arc::clone(&queue));
        }
        info!(
            id = %queue.id,
            symbol = %queue.symbol,
            timeframe = ?timeframe.map(|t| t.as_str()),
            "subscription added"
        );
        UpdateReceiver::new(queue)
    }

    pub fn unsubscribe(&self, id: Uuid) -> Result<(), EngineError> {
        let queue = self
            .registry
            .write()
            .remove(id)
            .ok_or(EngineError::UnknownSubscription(id))?;
        queue.close();
        info!(id = %id, symbol = %queue.symbol, "subscription removed");
        Ok(())
    }

    /// Fan an update out to every matching subscription. Never blocks.
    pub fn publish(&self, mut update: Update) -> PublishReport {
        let mut report = PublishReport::default();
        let mut dead = Vec::new();
        let update = {
            let mut seq = self.seq.lock();
            *seq += 1;
            update.seq = *seq;
            report.seq = *seq;
            let update = Arc::new(update);

            if update.kind == UpdateKind::Closed {
                self.latest
                    .lock()
                    .insert(update.key.clone(), Arc::clone(&update));
            }

            let reg = self.registry.read();
            if let Some(subs) = reg.by_symbol.get(&update.key.symbol) {
                for queue in subs.iter().filter(|q| q.matches(&update.key)) {
                    match queue.offer(Arc::clone(&update)) {
                        Offer::Queued => report.delivered += 1,
                        Offer::Evicted { first } => {
                            report.delivered += 1;
                            if first {
                                self.metrics.inc_subscriber_overflows();
                                report.overflows.push(EngineError::SubscriberOverflow {
                                    id: queue.id,
                                    capacity: queue.capacity(),
                                });
                            }
                        }
                        Offer::Dead => dead.push(queue.id),
                    }
                }
            }
            update
        };

        if !dead.is_empty() {
            let mut reg = self.registry.write();
            for id in dead {
                if reg.remove(id).is_some() {
                    debug!(id = %id, "pruned subscription with dropped receiver");
                }
            }
        }

        for e in &report.overflows {
            warn!(key = %update.key, error = %e, "subscriber queue overflow");
        }
        self.metrics.inc_updates_published();
        report
    }

    /// Clear a degraded subscription and queue a fresh snapshot of every
    /// committed series it covers. Returns the number of snapshots queued.
    pub fn resync(&self, id: Uuid) -> Result<usize, EngineError> {
        let queue = self
            .registry
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownSubscription(id))?;

        let mut snapshots: Vec<Update> = self
            .latest
            .lock()
            .values()
            .filter(|u| queue.matches(&u.key))
            .map(|u| Update {
                kind: UpdateKind::Snapshot,
                ..(**u).clone()
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));

        let count = snapshots.len();
        {
            let mut seq = self.seq.lock();
            queue.reset();
            for mut snap in snapshots {
                *seq += 1;
                snap.seq = *seq;
                queue.offer(Arc::new(snap));
            }
        }
        info!(id = %id, snapshots = count, "subscription resynced");
        Ok(count)
    }

    /// Latest committed update for a series.
    pub fn latest(&self, key: &SeriesKey) -> Option<Arc<Update>> {
        self.latest.lock().get(key).cloned()
    }

    /// Close every subscription; receivers drain what is queued, then end.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let mut reg = self.registry.write();
        for queue in reg.by_id.values() {
            queue.close();
        }
        let n = reg.by_id.len();
        reg.by_id.clear();
        reg.by_symbol.clear();
        info!(subscriptions = n, "broker closed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.read().by_id.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
