//! A slow subscriber must never slow the publisher down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ta_pulse::broker::{Broker, Update, UpdateKind, DEFAULT_QUEUE_CAPACITY};
use ta_pulse::indicators::{IndicatorEngine, IndicatorParams};
use ta_pulse::market_data::Candle;
use ta_pulse::metrics::EngineMetrics;
use ta_pulse::types::{SeriesKey, Timeframe};

fn closed_update(bucket: i64) -> Update {
    let key = SeriesKey::new("BTCUSDT", Timeframe::M1);
    let mut candle = Candle::open_at(&key, bucket, 100.0 + bucket as f64, 1.0);
    candle.is_closed = true;
    let snapshot = IndicatorEngine::new(key, &IndicatorParams::default()).preview(&candle);
    Update::new(UpdateKind::Closed, candle, snapshot, Vec::new(), Vec::new())
}

#[test]
fn queue_keeps_the_most_recent_updates() {
    let metrics = Arc::new(EngineMetrics::new());
    let broker = Broker::new(DEFAULT_QUEUE_CAPACITY, Arc::clone(&metrics));
    let mut rx = broker.subscribe("BTCUSDT", Some(Timeframe::M1));

    let mut overflow_reports = 0;
    for bucket in 0..1_000 {
        let report = broker.publish(closed_update(bucket));
        assert_eq!(report.delivered, 1);
        overflow_reports += report.overflows.len();
    }

    let retained = rx.drain();
    assert_eq!(retained.len(), 256);
    let seqs: Vec<u64> = retained.iter().map(|u| u.seq).collect();
    assert_eq!(seqs, (745..=1_000).collect::<Vec<u64>>());

    assert!(rx.is_degraded());
    assert_eq!(rx.evicted(), 744);
    assert_eq!(overflow_reports, 1);
    assert_eq!(metrics.snapshot().subscriber_overflows, 1);
    assert_eq!(metrics.snapshot().updates_published, 1_000);
}

#[test]
fn resync_clears_degraded_with_a_snapshot() {
    let broker = Broker::new(4, Arc::new(EngineMetrics::new()));
    let mut rx = broker.subscribe("BTCUSDT", None);
    for bucket in 0..10 {
        broker.publish(closed_update(bucket));
    }
    assert!(rx.is_degraded());

    assert_eq!(broker.resync(rx.id()).unwrap(), 1);
    assert!(!rx.is_degraded());
    let queued = rx.drain();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, UpdateKind::Snapshot);
    assert_eq!(queued[0].candle.start_time, Timeframe::M1.bucket_start(9));
    assert!(queued[0].seq > 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publisher_is_not_held_up_by_a_slow_consumer() {
    let broker = Arc::new(Broker::new(256, Arc::new(EngineMetrics::new())));
    let mut slow = broker.subscribe("BTCUSDT", Some(Timeframe::M1));
    let consumer = tokio::spawn(async move {
        let mut seen = 0usize;
        while let Some(_u) = slow.recv().await {
            seen += 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        seen
    });

    let updates: Vec<Update> = (0..1_000).map(closed_update).collect();
    let started = Instant::now();
    let mut worst = Duration::ZERO;
    for update in updates {
        let t = Instant::now();
        broker.publish(update);
        worst = worst.max(t.elapsed());
    }
    let total = started.elapsed();

    // A consumer sleeping 5 ms per update would need seconds to keep pace.
    assert!(total < Duration::from_millis(500), "publishing took {total:?}");
    assert!(worst < Duration::from_millis(50), "slowest publish took {worst:?}");

    broker.close_all();
    let seen = consumer.await.unwrap();
    assert!(seen <= 1_000);
}
