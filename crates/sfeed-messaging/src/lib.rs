//! ---
//! sfeed_section: "02-messaging-dispatch"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event model, completion handles, and sink clients."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Messaging primitives shared by the replay engine and its collaborators.

pub mod batching;
pub mod completion;
pub mod event;
pub mod sink;
pub mod wire;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Outcome reported by a completion handle.
pub type DispatchResult = std::result::Result<(), DispatchError>;

/// Failure of a single dispatch as reported through its completion handle.
///
/// Cloneable because every hook registered on a handle observes the same result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The destination refused the record.
    #[error("record rejected by stream {stream}: {reason}")]
    Rejected {
        /// Stream the record was addressed to.
        stream: String,
        /// Destination supplied reason.
        reason: String,
    },
    /// The sink does not serve the addressed stream.
    #[error("unknown stream {0}")]
    UnknownStream(String),
    /// Shard index outside of the stream's shard range.
    #[error("shard {shard} out of range for stream {stream}")]
    UnknownShard {
        /// Stream the record was addressed to.
        stream: String,
        /// Requested shard.
        shard: usize,
    },
    /// Writing the record failed.
    #[error("io error: {0}")]
    Io(String),
    /// The sink stopped before the record was written.
    #[error("sink shut down before the record was written")]
    Shutdown,
    /// The completer was dropped without reporting a result.
    #[error("dispatch abandoned without a result")]
    Abandoned,
}

/// Errors raised by messaging components outside of individual dispatches.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Wrapper for IO errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A dispatch or flush could not be completed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Bulk write rejected by the downstream index.
    #[error("bulk write failed: {0}")]
    BulkWrite(String),
}

pub use batching::{BatchingSink, BulkWriter, Document, JsonLinesBulkWriter};
pub use completion::{completion_pair, Completer, CompletionHandle};
pub use event::Event;
pub use sink::{shard_for_key, DeliveredRecord, InMemorySink, SinkClient};
pub use wire::{decode_line, encode_event, encode_watermark, Watermark, WireRecord};
