// =============================================================================
// Subscription queue — bounded, drop-oldest, never blocks the publisher
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::Update;
use crate::types::{SeriesKey, Timeframe};

/// Result of offering one update to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Offer {
    Queued,
    /// Queue was full: the oldest update was evicted. `first` is true when
    /// this eviction is the one that flagged the subscription degraded.
    Evicted { first: bool },
    /// Receiver is gone or the queue is closed.
    Dead,
}

struct QueueInner {
    buf: VecDeque<Arc<Update>>,
    closed: bool,
}

pub(crate) struct SubscriptionQueue {
    pub(crate) id: Uuid,
    pub(crate) symbol: String,
    pub(crate) timeframe: Option<Timeframe>,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
    degraded: AtomicBool,
    alive: AtomicBool,
    evicted: AtomicU64,
}

impl SubscriptionQueue {
    pub(crate) fn new(symbol: String, timeframe: Option<Timeframe>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: Uuid::new_v4(),
            symbol,
            timeframe,
            capacity,
            inner: Mutex::new(QueueInner {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            degraded: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            evicted: AtomicU64::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn matches(&self, key: &SeriesKey) -> bool {
        self.symbol == key.symbol && self.timeframe.map_or(true, |tf| tf == key.timeframe)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn offer(&self, update: Arc<Update>) -> Offer {
        if !self.is_alive() {
            return Offer::Dead;
        }
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Offer::Dead;
            }
            let outcome = if inner.buf.len() >= self.capacity {
                inner.buf.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
                Offer::Evicted {
                    first: !self.degraded.swap(true, Ordering::AcqRel),
                }
            } else {
                Offer::Queued
            };
            inner.buf.push_back(update);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Drop everything queued and clear the degraded flag.
    pub(crate) fn reset(&self) {
        self.inner.lock().buf.clear();
        self.degraded.store(false, Ordering::Release);
    }

    pub(crate) fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    fn pop(&self) -> Result<Option<Arc<Update>>, ()> {
        let mut inner = self.inner.lock();
        match inner.buf.pop_front() {
            Some(u) => Ok(Some(u)),
            None if inner.closed => Err(()),
            None => Ok(None),
        }
    }
}

/// Consumer side of a subscription. Dropping it ends the subscription; the
/// broker prunes it on the next publish for its symbol.
pub struct UpdateReceiver {
    queue: Arc<SubscriptionQueue>,
    last_delivered_seq: u64,
}

impl UpdateReceiver {
    pub(crate) fn new(queue: Arc<SubscriptionQueue>) -> Self {
        Self {
            queue,
            last_delivered_seq: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.queue.id
    }

    pub fn symbol(&self) -> &str {
        &self.queue.symbol
    }

    pub fn timeframe(&self) -> Option<Timeframe> {
        self.queue.timeframe
    }

    /// Next update, waiting if none is queued. `None` once the subscription
    /// is closed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Update>> {
        loop {
            match self.queue.pop() {
                Ok(Some(update)) => {
                    self.last_delivered_seq = update.seq;
                    return Some(update);
                }
                Ok(None) => self.queue.notify.notified().await,
                Err(()) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<Update>> {
        let update = self.queue.pop().ok().flatten()?;
        self.last_delivered_seq = update.seq;
        Some(update)
    }

    /// Everything currently queued, oldest first.
    pub fn drain(&mut self) -> Vec<Arc<Update>> {
        let drained: Vec<_> = self.queue.inner.lock().buf.drain(..).collect();
        if let Some(last) = drained.last() {
            self.last_delivered_seq = last.seq;
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.queue.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }

    pub fn is_degraded(&self) -> bool {
        self.queue.degraded.load(Ordering::Acquire)
    }

    /// Updates evicted from this subscription since it was created.
    pub fn evicted(&self) -> u64 {
        self.queue.evicted.load(Ordering::Relaxed)
    }

    pub fn last_delivered_seq(&self) -> u64 {
        self.last_delivered_seq
    }
}

impl Drop for UpdateReceiver {
    fn drop(&mut self) {
        self.queue.alive.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for UpdateReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateReceiver")
            .field("id", &self.queue.id)
            .field("symbol", &self.queue.symbol)
            .field("timeframe", &self.queue.timeframe)
            .field("queued", &self.len())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
