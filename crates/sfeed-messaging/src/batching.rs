//! ---
//! sfeed_section: "02-messaging-dispatch"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event model, completion handles, and sink clients."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! Buffer-and-flush sink for downstream search indexes.
//!
//! Consumers of the replayed stream push documents into a [`BatchingSink`],
//! which hands them to a [`BulkWriter`] once the batch is full or the oldest
//! buffered document exceeds the maximum buffer age.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sfeed_common::time::{SystemClock, WallClock};
use tracing::{debug, warn};

use crate::{MessagingError, Result};

const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_MAX_BUFFER_AGE: Duration = Duration::from_millis(5_000);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// A document destined for a search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    /// Target index.
    pub index: String,
    /// Document type within the index.
    pub doc_type: String,
    /// Serialized document body.
    pub source: String,
}

/// Bulk write endpoint of the downstream index.
pub trait BulkWriter: Send {
    /// Write all documents in one request.
    ///
    /// Per-document failures inside an accepted request are not reported.
    fn bulk_write(&mut self, documents: &[Document]) -> Result<()>;
}

/// Buffers documents and flushes them in bulk.
pub struct BatchingSink<W: BulkWriter> {
    writer: W,
    index: String,
    doc_type: String,
    batch_size: usize,
    max_buffer_age: Duration,
    retry_backoff: Duration,
    buffer: Vec<Document>,
    last_flush_ms: i64,
    clock: Arc<dyn WallClock>,
}

impl<W: BulkWriter> BatchingSink<W> {
    /// Create a sink with the default batch size (500) and buffer age (5 s).
    pub fn new(writer: W, index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self::with_clock(writer, index, doc_type, Arc::new(SystemClock))
    }

    /// Create a sink driven by an explicit clock.
    pub fn with_clock(
        writer: W,
        index: impl Into<String>,
        doc_type: impl Into<String>,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        let last_flush_ms = clock.now_ms();
        Self {
            writer,
            index: index.into(),
            doc_type: doc_type.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_buffer_age: DEFAULT_MAX_BUFFER_AGE,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            buffer: Vec::with_capacity(DEFAULT_BATCH_SIZE),
            last_flush_ms,
            clock,
        }
    }

    /// Override the flush thresholds.
    pub fn with_limits(mut self, batch_size: usize, max_buffer_age: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.max_buffer_age = max_buffer_age;
        self
    }

    /// Pause between attempts while [`snapshot`](Self::snapshot) retries.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Buffer a document, flushing when a threshold is reached.
    ///
    /// A failed flush keeps the buffer and is retried on the next call.
    pub fn invoke(&mut self, document: impl ToString) {
        self.buffer.push(Document {
            index: self.index.clone(),
            doc_type: self.doc_type.clone(),
            source: document.to_string(),
        });

        if self.buffer.len() >= self.batch_size || self.buffer_age() >= self.max_buffer_age {
            if let Err(err) = self.flush() {
                warn!(error = %err, buffered = self.buffer.len(), "bulk flush failed; retrying on next document");
            }
        }
    }

    /// Write the whole buffer in one bulk request.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.writer.bulk_write(&self.buffer)?;
            debug!(documents = self.buffer.len(), index = %self.index, "bulk flush");
            self.buffer.clear();
        }
        self.last_flush_ms = self.clock.now_ms();
        Ok(())
    }

    /// Checkpoint barrier: flush synchronously until the buffer is empty.
    ///
    /// Retries without limit on failure.
    pub fn snapshot(&mut self) {
        let mut attempts = 0u64;
        while !self.buffer.is_empty() {
            attempts += 1;
            if let Err(err) = self.flush() {
                warn!(error = %err, attempts, buffered = self.buffer.len(), "checkpoint flush failed; retrying");
                if !self.retry_backoff.is_zero() {
                    std::thread::sleep(self.retry_backoff);
                }
            }
        }
    }

    /// Documents waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Access the underlying writer.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn buffer_age(&self) -> Duration {
        let elapsed = self.clock.now_ms().saturating_sub(self.last_flush_ms);
        Duration::from_millis(elapsed.max(0) as u64)
    }
}

#[derive(Serialize)]
struct BulkAction<'a> {
    index: BulkTarget<'a>,
}

#[derive(Serialize)]
struct BulkTarget<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_type")]
    doc_type: &'a str,
}

/// Appends bulk requests to a file in newline-delimited bulk format.
pub struct JsonLinesBulkWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesBulkWriter {
    /// Open (or create) the target file for appending.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    /// Path of the bulk file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BulkWriter for JsonLinesBulkWriter {
    fn bulk_write(&mut self, documents: &[Document]) -> Result<()> {
        for document in documents {
            let action = BulkAction {
                index: BulkTarget {
                    index: &document.index,
                    doc_type: &document.doc_type,
                },
            };
            serde_json::to_writer(&mut self.writer, &action)?;
            self.writer.write_all(b"\n")?;
            self.writer.write_all(document.source.as_bytes())?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush().map_err(MessagingError::from)
    }
}
