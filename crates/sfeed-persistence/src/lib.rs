//! ---
//! sfeed_section: "03-persistence-sources"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event sources and append-only stream storage."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Storage side of the replay: where events come from and where records land.

use std::path::PathBuf;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Failure while reading the event log.
///
/// Malformed records are skipped and counted rather than reported here.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Reading a log segment failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Segment being read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Listing the log root failed.
    #[error("failed to list event log root: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Error type for writers and stream files.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reading events failed.
    #[error(transparent)]
    Source(#[from] SourceError),
    /// Invalid sink options.
    #[error("invalid stream options: {0}")]
    InvalidOptions(&'static str),
}

pub mod event_log;
pub mod source;
pub mod stream;

pub use event_log::{EventLogWriter, SegmentedLogSource, SourceStats};
pub use source::{EventSource, VecEventSource};
pub use stream::{read_shard, FileStreamSink, StreamOptions};
