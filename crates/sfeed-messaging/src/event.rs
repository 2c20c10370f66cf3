//! ---
//! sfeed_section: "02-messaging-dispatch"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event model, completion handles, and sink clients."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use bytes::Bytes;

/// A timestamped record read from the historical log. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    logical_timestamp: i64,
    partition_key: String,
    payload: Bytes,
}

impl Event {
    /// Build an event from its logical timestamp (epoch ms), routing key and payload.
    pub fn new(
        logical_timestamp: i64,
        partition_key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            logical_timestamp,
            partition_key: partition_key.into(),
            payload: payload.into(),
        }
    }

    /// Timestamp carried by the event itself, in epoch milliseconds.
    pub fn logical_timestamp(&self) -> i64 {
        self.logical_timestamp
    }

    /// Key used to route the event to a stream shard.
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}
