//! ---
//! sfeed_section: "03-persistence-sources"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event sources and append-only stream storage."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use sfeed_messaging::{encode_event, Event, SinkClient, WireRecord};
use sfeed_persistence::{
    read_shard, EventLogWriter, EventSource, FileStreamSink, SegmentedLogSource, StreamOptions,
};
use tempfile::tempdir;

#[tokio::test]
async fn log_segments_copy_into_stream_shards() {
    let dir = tempdir().unwrap();
    let logs = dir.path().join("bucket");
    for segment in 0..3 {
        let path = logs.join(format!("trips/2016-01/part-{segment:04}.json"));
        let mut writer = EventLogWriter::open(&path).unwrap();
        for offset in 0..10 {
            let ts = 1_451_606_400_000 + segment * 1_000 + offset * 10;
            let payload = format!(r#"{{"trip_id":{},"fare":{}}}"#, segment * 10 + offset, offset);
            writer
                .append(&Event::new(ts, format!("trip-{offset}"), payload))
                .unwrap();
        }
        writer.flush().unwrap();
    }

    let mut source = SegmentedLogSource::open(&logs, "trips/2016-01/").unwrap();
    let sink = FileStreamSink::open(
        &dir.path().join("streams"),
        "taxi-trip-events",
        StreamOptions {
            shards: 3,
            aggregate: true,
            max_aggregate: 4,
        },
    )
    .unwrap();

    let mut handles = Vec::new();
    let mut previous = i64::MIN;
    while let Some(event) = source.next_event().unwrap() {
        assert!(event.logical_timestamp() >= previous);
        previous = event.logical_timestamp();
        let bytes = encode_event(event.logical_timestamp(), &event).unwrap();
        handles.push(sink.dispatch("taxi-trip-events", event.partition_key(), bytes));
    }
    assert_eq!(source.stats().events, 30);
    sink.flush().await.unwrap();
    for handle in &handles {
        assert_eq!(handle.result(), Some(Ok(())));
    }

    let mut trip_ids = Vec::new();
    for path in sink.shard_paths() {
        for record in read_shard(&path).unwrap() {
            match record {
                WireRecord::Event { data, .. } => trip_ids.push(data["trip_id"].as_i64().unwrap()),
                other => panic!("unexpected record {other:?}"),
            }
        }
    }
    trip_ids.sort_unstable();
    assert_eq!(trip_ids, (0..30).collect::<Vec<_>>());
}

#[tokio::test]
async fn reopening_a_stream_appends() {
    let dir = tempdir().unwrap();
    let options = StreamOptions {
        shards: 1,
        ..StreamOptions::default()
    };
    for round in 0..2 {
        let sink = FileStreamSink::open(dir.path(), "s", options).unwrap();
        let event = Event::new(round, "k", "{}");
        sink.dispatch("s", "k", encode_event(round, &event).unwrap());
        sink.flush().await.unwrap();
    }
    let records = read_shard(&dir.path().join("s/shard-0000.log")).unwrap();
    assert_eq!(records.len(), 2);
}
