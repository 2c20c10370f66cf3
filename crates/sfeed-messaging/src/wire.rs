//! ---
//! sfeed_section: "02-messaging-dispatch"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event model, completion handles, and sink clients."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! JSON encoding of records written to the destination stream.
//!
//! Every stream record is a JSON object tagged by `type`: replayed events carry
//! the adapted timestamp and the original payload, watermark markers carry the
//! watermark value. Aggregated stream records are JSON arrays of such objects.

use std::borrow::Cow;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::{Event, Result};

/// Declaration that no event with a logical timestamp at or below `value` will
/// be emitted after this point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Watermark value in epoch milliseconds.
    pub value: i64,
    /// Wall clock (epoch ms) at which the watermark was emitted.
    pub emitted_at_wall_clock: i64,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Data<'a> {
    Json(&'a RawValue),
    Text(Cow<'a, str>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Event {
        timestamp: i64,
        partition_key: &'a str,
        data: Data<'a>,
    },
    Watermark {
        watermark: i64,
        emitted_at: i64,
    },
}

/// Decoded stream record, as seen by downstream consumers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireRecord {
    /// A replayed event.
    Event {
        /// Outbound (possibly adapted) timestamp.
        timestamp: i64,
        /// Routing key of the original event.
        partition_key: String,
        /// Original payload.
        data: serde_json::Value,
    },
    /// A watermark marker.
    Watermark {
        /// Watermark value in epoch milliseconds.
        watermark: i64,
        /// Wall clock at emission.
        emitted_at: i64,
    },
}

/// Encode an event with its outbound timestamp.
///
/// JSON payloads are embedded verbatim; anything else is carried as a string.
pub fn encode_event(timestamp: i64, event: &Event) -> Result<Bytes> {
    let raw = event.payload();
    let data = match serde_json::from_slice::<&RawValue>(raw) {
        Ok(json) => Data::Json(json),
        Err(_) => Data::Text(String::from_utf8_lossy(raw)),
    };
    let record = Outbound::Event {
        timestamp,
        partition_key: event.partition_key(),
        data,
    };
    Ok(Bytes::from(serde_json::to_vec(&record)?))
}

/// Encode a watermark marker.
pub fn encode_watermark(watermark: &Watermark) -> Result<Bytes> {
    let record = Outbound::Watermark {
        watermark: watermark.value,
        emitted_at: watermark.emitted_at_wall_clock,
    };
    Ok(Bytes::from(serde_json::to_vec(&record)?))
}

/// Decode one stream line, which is either a single record or an aggregate.
pub fn decode_line(line: &[u8]) -> Result<Vec<WireRecord>> {
    let trimmed = line.trim_ascii_start();
    if trimmed.first() == Some(&b'[') {
        Ok(serde_json::from_slice(trimmed)?)
    } else {
        Ok(vec![serde_json::from_slice(trimmed)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_payload_is_embedded() {
        let event = Event::new(100, "k", r#"{"fare":12.5}"#);
        let encoded = encode_event(250, &event).unwrap();
        let decoded = decode_line(&encoded).unwrap();
        assert_eq!(
            decoded,
            vec![WireRecord::Event {
                timestamp: 250,
                partition_key: "k".into(),
                data: json!({"fare": 12.5}),
            }]
        );
    }

    #[test]
    fn non_json_payload_becomes_string() {
        let event = Event::new(1, "k", "plain text");
        let encoded = encode_event(1, &event).unwrap();
        match &decode_line(&encoded).unwrap()[0] {
            WireRecord::Event { data, .. } => assert_eq!(data, &json!("plain text")),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn watermark_marker_is_tagged() {
        let encoded = encode_watermark(&Watermark {
            value: 99,
            emitted_at_wall_clock: 1_000,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(
            value,
            json!({"type": "watermark", "watermark": 99, "emitted_at": 1000})
        );
    }

    #[test]
    fn decodes_aggregated_lines() {
        let line = br#"[{"type":"watermark","watermark":1,"emitted_at":2},{"type":"event","timestamp":3,"partition_key":"a","data":null}]"#;
        let records = decode_line(line).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], WireRecord::Watermark { watermark: 1, .. }));
    }
}
