//! ---
//! sfeed_section: "05-replay-engine"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Replay scheduling, flow control, and watermarking."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sfeed_common::{AdaptTime, AnchoredClock, WatermarkConfig};
use sfeed_messaging::{decode_line, CompletionHandle, Event, InMemorySink, SinkClient, WireRecord};
use sfeed_metrics::{encode_registry, new_registry, ReplayMetrics};
use sfeed_persistence::VecEventSource;
use sfeed_replay::{EngineConfig, ReplayEngine};
use tokio::time::Instant;

const T0: i64 = 1_700_000_000_000;

fn config() -> EngineConfig {
    EngineConfig {
        stream: "trips".into(),
        speedup: 1_000_000.0,
        min_sleep: Duration::from_millis(5),
        max_outstanding: 16,
        adapt_time: AdaptTime::Original,
        statistics_frequency: Duration::from_secs(60),
        watermark: WatermarkConfig {
            enabled: true,
            interval: Duration::from_millis(5_000),
            event_threshold: 100_000,
        },
    }
}

fn no_watermarks() -> EngineConfig {
    let mut config = config();
    config.watermark.enabled = false;
    config
}

fn events(count: i64, start: i64, step: i64) -> VecEventSource {
    VecEventSource::new(
        (0..count).map(|i| Event::new(start + i * step, format!("e{i}"), format!(r#"{{"seq":{i}}}"#))),
    )
}

fn decoded(sink: &InMemorySink) -> Vec<WireRecord> {
    sink.delivered()
        .iter()
        .flat_map(|record| decode_line(&record.payload).unwrap())
        .collect()
}

/// Outbound timestamps keyed by partition key, in source order.
fn outbound_timestamps(sink: &InMemorySink) -> Vec<i64> {
    let mut events: Vec<(usize, i64)> = decoded(sink)
        .into_iter()
        .filter_map(|record| match record {
            WireRecord::Event {
                timestamp,
                partition_key,
                ..
            } => Some((partition_key[1..].parse().unwrap(), timestamp)),
            WireRecord::Watermark { .. } => None,
        })
        .collect();
    events.sort_unstable();
    events.into_iter().map(|(_, ts)| ts).collect()
}

fn marker_values(sink: &InMemorySink) -> Vec<i64> {
    decoded(sink)
        .into_iter()
        .filter_map(|record| match record {
            WireRecord::Watermark { watermark, .. } => Some(watermark),
            WireRecord::Event { .. } => None,
        })
        .collect()
}

/// Delegates to an [`InMemorySink`] and remembers markers in the order they
/// were broadcast, since jittered delivery can reorder them.
struct RecordingSink {
    inner: InMemorySink,
    broadcast_markers: Mutex<Vec<i64>>,
}

impl RecordingSink {
    fn new(inner: InMemorySink) -> Self {
        Self {
            inner,
            broadcast_markers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SinkClient for RecordingSink {
    fn dispatch(&self, stream: &str, partition_key: &str, payload: Bytes) -> CompletionHandle {
        self.inner.dispatch(stream, partition_key, payload)
    }

    fn shard_count(&self, stream: &str) -> usize {
        self.inner.shard_count(stream)
    }

    fn dispatch_to_shard(&self, stream: &str, shard: usize, payload: Bytes) -> CompletionHandle {
        self.inner.dispatch_to_shard(stream, shard, payload)
    }

    fn broadcast(&self, stream: &str, payload: Bytes) -> Vec<CompletionHandle> {
        for record in decode_line(&payload).unwrap() {
            if let WireRecord::Watermark { watermark, .. } = record {
                self.broadcast_markers.lock().push(watermark);
            }
        }
        self.inner.broadcast(stream, payload)
    }

    async fn flush(&self) -> sfeed_messaging::Result<()> {
        self.inner.flush().await
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[tokio::test(start_paused = true)]
async fn pacing_tracks_scaled_logical_time() {
    let sink = Arc::new(InMemorySink::new(2));
    let config = EngineConfig {
        speedup: 10.0,
        ..no_watermarks()
    };
    let engine = ReplayEngine::new(config, events(100, T0, 1_000), sink.clone()).unwrap();

    let started = Instant::now();
    let report = engine.run().await.unwrap();
    let elapsed = started.elapsed();

    // 99 gaps of 1 s of logical time at 10x.
    let expected = Duration::from_millis(9_900);
    assert!(elapsed >= expected, "replayed early: {elapsed:?}");
    assert!(elapsed <= expected + Duration::from_millis(50), "replayed late: {elapsed:?}");
    assert_eq!(report.dispatched, 100);
}

#[tokio::test(start_paused = true)]
async fn outstanding_dispatches_never_exceed_capacity() {
    let sink = Arc::new(
        InMemorySink::new(4)
            .with_latency(Duration::from_millis(5))
            .with_jitter(Duration::from_millis(20)),
    );
    let config = EngineConfig {
        max_outstanding: 4,
        ..no_watermarks()
    };
    let engine = ReplayEngine::new(config, events(200, T0, 1), sink.clone()).unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(report.dispatched, 200);
    assert_eq!(report.peak_outstanding, 4);
    assert!(sink.max_in_flight() <= 4, "in flight peaked at {}", sink.max_in_flight());
    assert_eq!(sink.delivered().len(), 200);
}

#[tokio::test(start_paused = true)]
async fn run_returns_only_after_every_completion() {
    let sink = Arc::new(InMemorySink::new(2).with_latency(Duration::from_millis(50)));
    let engine = ReplayEngine::new(no_watermarks(), events(10, T0, 1), sink.clone()).unwrap();

    let started = Instant::now();
    let report = engine.run().await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(sink.in_flight(), 0);
    assert_eq!(sink.delivered().len(), 10);
    assert_eq!(report.dispatched, 10);
}

#[tokio::test(start_paused = true)]
async fn adapts_outbound_timestamps() {
    let mut outbound = Vec::new();
    for policy in [AdaptTime::Original, AdaptTime::Invocation, AdaptTime::Ingestion] {
        let sink = Arc::new(InMemorySink::new(1));
        let config = EngineConfig {
            speedup: 1.0,
            adapt_time: policy,
            ..no_watermarks()
        };
        ReplayEngine::new(config, events(3, 100, 100), sink.clone())
            .unwrap()
            .with_clock(Arc::new(AnchoredClock::starting_at(T0)))
            .run()
            .await
            .unwrap();
        outbound.push(outbound_timestamps(&sink));
    }

    assert_eq!(outbound[0], vec![100, 200, 300]);
    assert_eq!(outbound[1], vec![T0, T0 + 100, T0 + 200]);
    let ingestion = &outbound[2];
    assert_eq!(ingestion.len(), 3);
    assert!(ingestion[0] >= T0);
    assert!(ingestion.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test(start_paused = true)]
async fn failed_dispatches_are_counted_and_do_not_stall_watermarks() {
    let sink = Arc::new(
        InMemorySink::new(2)
            .with_latency(Duration::from_millis(1))
            .with_failures(|payload| payload.windows(8).any(|w| w == br#""seq":3}"#)),
    );
    let engine = ReplayEngine::new(config(), events(6, T0, 10), sink.clone()).unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(report.dispatched, 6);
    assert_eq!(report.failed, 1);
    assert_eq!(sink.failed_count(), 1);
    // The watermark passes the dropped event.
    assert_eq!(report.last_watermark, Some(T0 + 50));
    assert_eq!(marker_values(&sink).into_iter().max(), Some(T0 + 50));
}

#[tokio::test(start_paused = true)]
async fn seek_starts_at_first_event_at_or_after_target() {
    let sink = Arc::new(InMemorySink::new(1));
    let config = EngineConfig {
        adapt_time: AdaptTime::Invocation,
        ..no_watermarks()
    };
    let mut engine = ReplayEngine::new(config, events(10, 0, 100), sink.clone())
        .unwrap()
        .with_clock(Arc::new(AnchoredClock::starting_at(T0)));
    engine.seek(450).unwrap();
    let report = engine.run().await.unwrap();

    assert_eq!(report.dispatched, 5);
    assert_eq!(report.first_timestamp, Some(500));
    assert_eq!(report.last_timestamp, Some(900));
    assert_eq!(
        outbound_timestamps(&sink),
        vec![T0, T0 + 100, T0 + 200, T0 + 300, T0 + 400]
    );
}

#[tokio::test]
async fn empty_source_terminates_immediately() {
    let sink = Arc::new(InMemorySink::new(1));
    let engine = ReplayEngine::new(config(), VecEventSource::default(), sink.clone()).unwrap();
    let report = engine.run().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.last_watermark, None);
    assert!(sink.delivered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn markers_trail_outbound_events_on_every_shard() {
    // Logical time lies ahead of the engine's wall clock, so adapted
    // timestamps fall far below the logged ones.
    let log_start = 1_900_000_000_000;
    for policy in [AdaptTime::Original, AdaptTime::Invocation, AdaptTime::Ingestion] {
        let sink = Arc::new(RecordingSink::new(
            InMemorySink::new(3)
                .with_latency(Duration::from_millis(5))
                .with_jitter(Duration::from_millis(20)),
        ));
        let config = EngineConfig {
            speedup: 10.0,
            max_outstanding: 8,
            adapt_time: policy,
            watermark: WatermarkConfig {
                enabled: true,
                interval: Duration::from_millis(30),
                event_threshold: 3,
            },
            ..config()
        };
        let report = ReplayEngine::new(config, events(60, log_start, 100), sink.clone())
            .unwrap()
            .with_clock(Arc::new(AnchoredClock::starting_at(T0)))
            .run()
            .await
            .unwrap();
        assert_eq!(report.dispatched, 60, "{policy:?}");

        let broadcast = sink.broadcast_markers.lock().clone();
        assert!(broadcast.len() > 2, "{policy:?}: only {} markers", broadcast.len());
        assert_eq!(broadcast.len() as u64, report.watermarks_emitted);
        assert!(
            broadcast.windows(2).all(|pair| pair[0] <= pair[1]),
            "{policy:?}: markers regressed: {broadcast:?}"
        );

        let mut latest_event = i64::MIN;
        let mut marker_records = 0;
        for shard in 0..3 {
            let mut watermark = i64::MIN;
            for record in sink.inner.delivered().iter().filter(|record| record.shard == shard) {
                for decoded in decode_line(&record.payload).unwrap() {
                    match decoded {
                        WireRecord::Watermark { watermark: value, .. } => {
                            watermark = watermark.max(value);
                            marker_records += 1;
                        }
                        WireRecord::Event { timestamp, .. } => {
                            assert!(
                                timestamp > watermark,
                                "{policy:?} shard {shard}: event at {timestamp} after marker {watermark}"
                            );
                            latest_event = latest_event.max(timestamp);
                        }
                    }
                }
            }
        }
        assert_eq!(marker_records, broadcast.len() * 3);
        // The final marker covers the newest outbound timestamp.
        assert_eq!(report.last_watermark, Some(latest_event), "{policy:?}");
        assert_eq!(broadcast.last(), Some(&latest_event), "{policy:?}");
        if policy != AdaptTime::Original {
            assert!(latest_event < log_start, "{policy:?}: timestamps were not adapted");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn watermarks_reach_every_shard_and_metrics() {
    let sink = Arc::new(InMemorySink::new(3).with_latency(Duration::from_millis(2)));
    let config = EngineConfig {
        speedup: 100.0,
        watermark: WatermarkConfig {
            enabled: true,
            interval: Duration::from_millis(50),
            event_threshold: 7,
        },
        ..config()
    };
    let registry = new_registry();
    let metrics = ReplayMetrics::new(&registry, "trips").unwrap();
    let engine = ReplayEngine::new(config, events(60, T0, 100), sink.clone())
        .unwrap()
        .with_metrics(metrics);
    let report = engine.run().await.unwrap();

    let markers = marker_values(&sink);
    assert!(report.watermarks_emitted > 1);
    assert_eq!(markers.len() as u64, report.watermarks_emitted * 3);
    assert_eq!(markers.iter().max(), Some(&(T0 + 5_900)));
    assert_eq!(report.last_watermark, Some(T0 + 5_900));

    let body = encode_registry(&registry).unwrap();
    assert!(body.contains(r#"sfeed_events_dispatched_total{stream="trips"} 60"#));
    assert!(body.contains(r#"sfeed_outstanding_dispatches{stream="trips"} 0"#));
}

#[test]
fn invalid_configuration_is_rejected_up_front() {
    let sink = Arc::new(InMemorySink::new(1));
    let config = EngineConfig {
        speedup: 0.0,
        ..config()
    };
    assert!(ReplayEngine::new(config, VecEventSource::default(), sink).is_err());
}
