//! ---
//! sfeed_section: "03-persistence-sources"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event sources and append-only stream storage."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! Segmented JSON-lines event logs.
//!
//! A log is a set of segment files below a root directory whose relative path
//! starts with a common prefix, read in lexical order. Each line holds one
//! record:
//!
//! ```json
//! {"timestamp": "2016-01-01T00:00:00Z", "partition_key": "trip-1", "payload": {...}}
//! ```
//!
//! `timestamp` is RFC 3339 or epoch milliseconds; `partition_key` is optional.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sfeed_common::time::parse_timestamp;
use sfeed_messaging::Event;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::source::EventSource;
use crate::{Result, SourceError};

#[derive(Deserialize)]
#[serde(untagged)]
enum LogTimestamp {
    Millis(i64),
    Text(String),
}

#[derive(Deserialize)]
struct LogRecord {
    timestamp: LogTimestamp,
    #[serde(default)]
    partition_key: Option<String>,
    payload: Box<RawValue>,
}

#[derive(Serialize)]
struct OutboundRecord<'a> {
    timestamp: i64,
    partition_key: &'a str,
    payload: &'a RawValue,
}

/// Counters describing what a [`SegmentedLogSource`] read so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    /// Segment files opened.
    pub segments: usize,
    /// Events handed out or buffered as look-ahead.
    pub events: u64,
    /// Lines that could not be parsed.
    pub malformed: u64,
    /// Records older than the record before them.
    pub out_of_order: u64,
}

struct OpenSegment {
    path: PathBuf,
    line_no: usize,
    reader: BufReader<File>,
    line: Vec<u8>,
}

/// Reads every segment under `root` whose relative path starts with `prefix`.
pub struct SegmentedLogSource {
    pending: VecDeque<PathBuf>,
    current: Option<OpenSegment>,
    lookahead: Option<Event>,
    last_timestamp: Option<i64>,
    stats: SourceStats,
}

impl SegmentedLogSource {
    /// List the segments and load the first event.
    pub fn open(root: &Path, prefix: &str) -> std::result::Result<Self, SourceError> {
        let segments = list_segments(root, prefix)?;
        debug!(root = %root.display(), prefix, segments = segments.len(), "opening event log");
        let mut source = Self {
            pending: segments.into(),
            current: None,
            lookahead: None,
            last_timestamp: None,
            stats: SourceStats::default(),
        };
        source.lookahead = source.read_next()?;
        Ok(source)
    }

    /// Counters for the records read so far.
    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    fn read_next(&mut self) -> std::result::Result<Option<Event>, SourceError> {
        loop {
            let Some(segment) = self.current.as_mut() else {
                let Some(path) = self.pending.pop_front() else {
                    return Ok(None);
                };
                let file = File::open(&path).map_err(|source| SourceError::Io {
                    path: path.clone(),
                    source,
                })?;
                self.stats.segments += 1;
                debug!(segment = %path.display(), "reading segment");
                self.current = Some(OpenSegment {
                    path,
                    line_no: 0,
                    reader: BufReader::new(file),
                    line: Vec::new(),
                });
                continue;
            };

            segment.line.clear();
            let read = segment
                .reader
                .read_until(b'\n', &mut segment.line)
                .map_err(|source| SourceError::Io {
                    path: segment.path.clone(),
                    source,
                })?;
            if read == 0 {
                self.current = None;
                continue;
            }
            segment.line_no += 1;
            if segment.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            // Bytes are decoded here so invalid UTF-8 counts as a malformed line.
            let event = match parse_record(&segment.line) {
                Ok(event) => event,
                Err(reason) => {
                    self.stats.malformed += 1;
                    warn!(
                        segment = %segment.path.display(),
                        line = segment.line_no,
                        %reason,
                        "skipping malformed record"
                    );
                    continue;
                }
            };

            let timestamp = event.logical_timestamp();
            if self.last_timestamp.is_some_and(|last| timestamp < last) {
                self.stats.out_of_order += 1;
                warn!(
                    segment = %segment.path.display(),
                    line = segment.line_no,
                    timestamp,
                    previous = self.last_timestamp,
                    "skipping out-of-order record"
                );
                continue;
            }
            self.last_timestamp = Some(timestamp);
            self.stats.events += 1;
            return Ok(Some(event));
        }
    }
}

impl EventSource for SegmentedLogSource {
    fn has_next(&self) -> bool {
        self.lookahead.is_some()
    }

    fn next_event(&mut self) -> std::result::Result<Option<Event>, SourceError> {
        let Some(event) = self.lookahead.take() else {
            return Ok(None);
        };
        self.lookahead = self.read_next()?;
        Ok(Some(event))
    }

    fn seek(&mut self, timestamp_ms: i64) -> std::result::Result<(), SourceError> {
        let mut skipped = 0u64;
        while self
            .lookahead
            .as_ref()
            .is_some_and(|event| event.logical_timestamp() < timestamp_ms)
        {
            self.lookahead = self.read_next()?;
            skipped += 1;
        }
        debug!(timestamp_ms, skipped, "seek complete");
        Ok(())
    }
}

impl std::fmt::Debug for SegmentedLogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentedLogSource")
            .field("pending_segments", &self.pending.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn list_segments(root: &Path, prefix: &str) -> std::result::Result<Vec<PathBuf>, SourceError> {
    let mut segments = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if key.starts_with(prefix) {
            segments.push((key, entry.into_path()));
        }
    }
    segments.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(segments.into_iter().map(|(_, path)| path).collect())
}

fn parse_record(line: &[u8]) -> std::result::Result<Event, String> {
    let record: LogRecord = serde_json::from_slice(line).map_err(|err| err.to_string())?;
    let timestamp = match record.timestamp {
        LogTimestamp::Millis(millis) => millis,
        LogTimestamp::Text(text) => parse_timestamp(&text).map_err(|err| err.to_string())?,
    };
    let payload = record.payload.get();
    let partition_key = record
        .partition_key
        .unwrap_or_else(|| derived_partition_key(payload));
    Ok(Event::new(
        timestamp,
        partition_key,
        Bytes::copy_from_slice(payload.as_bytes()),
    ))
}

fn derived_partition_key(payload: &str) -> String {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Append-only writer producing segments readable by [`SegmentedLogSource`].
pub struct EventLogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    appended: u64,
}

impl EventLogWriter {
    /// Open a segment for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            appended: 0,
        })
    }

    /// Append an event and return the number of bytes written.
    ///
    /// Payloads that are not valid JSON are stored as JSON strings.
    pub fn append(&mut self, event: &Event) -> Result<usize> {
        let raw = event.payload();
        let quoted;
        let payload: &RawValue = match serde_json::from_slice::<&RawValue>(raw) {
            Ok(json) => json,
            Err(_) => {
                quoted = serde_json::value::to_raw_value(&String::from_utf8_lossy(raw))?;
                &quoted
            }
        };
        let line = serde_json::to_string(&OutboundRecord {
            timestamp: event.logical_timestamp(),
            partition_key: event.partition_key(),
            payload,
        })?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.appended += 1;
        Ok(line.len() + 1)
    }

    /// Flush buffered writes to the underlying file handle.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Events appended through this writer.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Access the current path on disk (useful for tests).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EventLogWriter {
    fn drop(&mut self) {
        if let Err(err) = self.writer.flush() {
            warn!(path = %self.path.display(), error = %err, "failed to flush event log on drop");
        }
    }
}
