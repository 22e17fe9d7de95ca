//! Disconnect / reconnect behaviour of the stream client, alone and wired
//! into the engine.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use common::{raw_tick, MockExchange, T0};
use ta_pulse::broker::UpdateKind;
use ta_pulse::market_data::Candle;
use ta_pulse::metrics::EngineMetrics;
use ta_pulse::stream::{
    BackfillRequest, BackoffPolicy, ConnectionState, ResilientStreamClient, TickSink,
};
use ta_pulse::types::{Tick, Timeframe};
use ta_pulse::RuntimeConfig;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Tick(u64),
    Backfill(BackfillRequest, usize),
}

#[derive(Default)]
struct Journal {
    events: Mutex<Vec<Event>>,
}

impl TickSink for Journal {
    fn on_tick(&self, tick: Tick) {
        self.events.lock().push(Event::Tick(tick.sequence));
    }

    fn on_backfill(&self, request: &BackfillRequest, _tf: Timeframe, candles: Vec<Candle>) {
        self.events
            .lock()
            .push(Event::Backfill(request.clone(), candles.len()));
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base_ms: 10,
        cap_ms: 40,
        jitter: 0.0,
        stability_window_ms: 60_000,
    }
}

/// Five ticks, drop, upstream has moved on to seq 9, live resumes at 10.
fn scripted_gap() -> MockExchange {
    let first: Vec<_> = (1..=5)
        .map(|s| raw_tick("BTCUSDT", s, T0 + s as i64 * 1_000, 100.0 + s as f64))
        .collect();
    let second = vec![
        raw_tick("BTCUSDT", 10, T0 + 180_000 + 10_000, 300.0),
        raw_tick("BTCUSDT", 11, T0 + 240_000, 301.0),
    ];
    MockExchange::new(vec![first, second]).with_cursor(9, T0 + 180_000)
}

async fn wait_until(mut f: impl FnMut() -> bool) {
    for _ in 0..200 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn backfill_covers_missing_range_before_live_ticks() {
    let source = Arc::new(scripted_gap());
    source.gate.notify_one();
    let journal = Arc::new(Journal::default());
    let metrics = Arc::new(EngineMetrics::new());

    let client = ResilientStreamClient::new(
        Arc::clone(&source),
        Arc::clone(&journal),
        vec!["BTCUSDT".into()],
        vec![Timeframe::M1],
        fast_backoff(),
        Arc::clone(&metrics),
    );
    let state = client.state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(client.run(cancel.clone()));

    wait_until(|| journal.events.lock().len() >= 8).await;
    cancel.cancel();
    task.await.unwrap();

    let events = journal.events.lock().clone();
    let ticks_before: Vec<_> = events[..5].to_vec();
    assert_eq!(
        ticks_before,
        (1..=5).map(Event::Tick).collect::<Vec<_>>()
    );

    match &events[5] {
        Event::Backfill(req, candles) => {
            assert_eq!(req.symbol, "BTCUSDT");
            assert_eq!(req.first_missing_seq, 6);
            assert_eq!(req.last_missing_seq, 9);
            assert_eq!(req.since, T0 + 5_000);
            assert_eq!(req.until, T0 + 180_000);
            // Buckets T0 .. T0+3m inclusive.
            assert_eq!(*candles, 4);
        }
        other => panic!("expected backfill, got {other:?}"),
    }
    assert_eq!(&events[6..8], &[Event::Tick(10), Event::Tick(11)]);

    let requests = source.history_requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].2.start, T0);

    let m = metrics.snapshot();
    assert_eq!(m.backfill_requests, 1);
    assert_eq!(m.reconnects, 1);
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn failed_backfill_holds_live_ticks_until_history_recovers() {
    let source = Arc::new(scripted_gap());
    source.history_down.store(true, Ordering::SeqCst);
    source.gate.notify_one();
    let journal = Arc::new(Journal::default());
    let metrics = Arc::new(EngineMetrics::new());

    let client = ResilientStreamClient::new(
        Arc::clone(&source),
        Arc::clone(&journal),
        vec!["BTCUSDT".into()],
        vec![Timeframe::M1],
        fast_backoff(),
        Arc::clone(&metrics),
    );
    let state = client.state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(client.run(cancel.clone()));

    wait_until(|| source.history_requests.lock().len() >= 3).await;

    // Nothing past the gap was let through while history was down.
    assert_eq!(
        journal.events.lock().clone(),
        (1..=5).map(Event::Tick).collect::<Vec<_>>()
    );
    assert_ne!(*state.borrow(), ConnectionState::Connected);
    assert!(metrics.snapshot().backfill_failures >= 2);

    source.history_down.store(false, Ordering::SeqCst);
    wait_until(|| journal.events.lock().len() >= 6).await;
    wait_until(|| *state.borrow() == ConnectionState::Connected).await;

    match &journal.events.lock()[5] {
        Event::Backfill(req, candles) => {
            assert_eq!(req.first_missing_seq, 6);
            assert_eq!(req.last_missing_seq, 9);
            assert_eq!(req.since, T0 + 5_000);
            assert_eq!(*candles, 4);
        }
        other => panic!("expected backfill, got {other:?}"),
    }

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn engine_commits_backfilled_candles_in_order() {
    let source = Arc::new(scripted_gap());
    let config = RuntimeConfig {
        symbols: vec!["BTCUSDT".into()],
        timeframes: vec![Timeframe::M1],
        warmup_on_start: false,
        flush_interval_ms: 3_600_000,
        preview_interval_ms: i64::MAX,
        backoff: fast_backoff(),
        ..RuntimeConfig::default()
    };

    let engine = ta_pulse::start(config, Arc::clone(&source)).await.unwrap();
    let broker = engine.broker();
    let mut rx = broker.subscribe("BTCUSDT", Some(Timeframe::M1));
    source.gate.notify_one();

    let mut closed = Vec::new();
    while closed.len() < 4 {
        let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for closed candles")
            .expect("broker closed early");
        if update.kind == UpdateKind::Closed {
            closed.push(update);
        }
    }

    let starts: Vec<i64> = closed.iter().map(|u| u.candle.start_time).collect();
    assert_eq!(starts, vec![T0, T0 + 60_000, T0 + 120_000, T0 + 180_000]);
    // The first bucket comes from history, not from the interrupted live candle.
    assert_eq!(closed[0].candle.open, 200.0);
    // The last bucket was opened by history and closed by live tick 11.
    assert_eq!(closed[3].candle.close, 300.0);
    assert!(closed.windows(2).all(|w| w[0].seq < w[1].seq));

    let metrics = engine.metrics();
    engine.shutdown().await;
    let m = metrics.snapshot();
    assert_eq!(m.candles_closed, 4);
    assert_eq!(m.backfill_requests, 1);
    assert_eq!(m.ticks_ingested, 7);

    // Subscribers see the end of the stream after shutdown.
    while rx.recv().await.is_some() {}
}
