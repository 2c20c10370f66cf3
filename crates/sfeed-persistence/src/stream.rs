//! ---
//! sfeed_section: "03-persistence-sources"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event sources and append-only stream storage."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! File-backed append-only stream.
//!
//! A stream named `trips` with four shards lives in `<root>/trips/shard-0000.log`
//! through `shard-0003.log`. Every shard is owned by a dedicated writer thread;
//! completions resolve on that thread once the record reached the file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use async_trait::async_trait;
use bytes::Bytes;
use sfeed_messaging::{
    completion_pair, decode_line, shard_for_key, Completer, CompletionHandle, DispatchError,
    MessagingError, SinkClient, WireRecord,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::{PersistenceError, Result};

/// Layout and batching options for a [`FileStreamSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Number of shard files.
    pub shards: usize,
    /// Write queued records as one JSON array line.
    pub aggregate: bool,
    /// Upper bound on records written per line (aggregated) or per write batch.
    pub max_aggregate: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            shards: 4,
            aggregate: false,
            max_aggregate: 100,
        }
    }
}

enum ShardCommand {
    Append { payload: Bytes, completer: Completer },
    Flush(oneshot::Sender<io::Result<()>>),
}

struct ShardWriter {
    tx: mpsc::UnboundedSender<ShardCommand>,
    path: PathBuf,
}

/// Append-only stream persisted as one file per shard.
pub struct FileStreamSink {
    stream: String,
    directory: PathBuf,
    shards: Vec<ShardWriter>,
    threads: Vec<JoinHandle<()>>,
}

impl FileStreamSink {
    /// Create (or reopen) the shard files of `stream` below `root`.
    pub fn open(root: &Path, stream: &str, options: StreamOptions) -> Result<Self> {
        if options.shards == 0 {
            return Err(PersistenceError::InvalidOptions("shards must be greater than zero"));
        }
        if options.max_aggregate == 0 {
            return Err(PersistenceError::InvalidOptions(
                "max_aggregate must be greater than zero",
            ));
        }
        let directory = root.join(stream);
        fs::create_dir_all(&directory)?;

        let mut shards = Vec::with_capacity(options.shards);
        let mut threads = Vec::with_capacity(options.shards);
        for shard in 0..options.shards {
            let path = directory.join(format!("shard-{shard:04}.log"));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = ShardWorker {
                shard,
                rx,
                file: BufWriter::new(file),
                aggregate: options.aggregate,
                max_batch: options.max_aggregate,
            };
            let handle = std::thread::Builder::new()
                .name(format!("sfeed-shard-{shard}"))
                .spawn(move || worker.run())?;
            shards.push(ShardWriter { tx, path });
            threads.push(handle);
        }
        debug!(
            stream,
            directory = %directory.display(),
            shards = options.shards,
            aggregate = options.aggregate,
            "opened file stream"
        );

        Ok(Self {
            stream: stream.to_owned(),
            directory,
            shards,
            threads,
        })
    }

    /// Directory holding the shard files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Paths of all shard files, ordered by shard index.
    pub fn shard_paths(&self) -> Vec<PathBuf> {
        self.shards.iter().map(|shard| shard.path.clone()).collect()
    }

    fn enqueue(&self, shard: usize, payload: Bytes) -> CompletionHandle {
        let (completer, handle) = completion_pair();
        let command = ShardCommand::Append { payload, completer };
        if let Err(mpsc::error::SendError(command)) = self.shards[shard].tx.send(command) {
            if let ShardCommand::Append { completer, .. } = command {
                completer.resolve(Err(DispatchError::Shutdown));
            }
        }
        handle
    }

    fn check_stream(&self, stream: &str) -> std::result::Result<(), DispatchError> {
        if stream == self.stream {
            Ok(())
        } else {
            Err(DispatchError::UnknownStream(stream.to_owned()))
        }
    }
}

#[async_trait]
impl SinkClient for FileStreamSink {
    fn dispatch(&self, stream: &str, partition_key: &str, payload: Bytes) -> CompletionHandle {
        if let Err(err) = self.check_stream(stream) {
            return CompletionHandle::resolved(Err(err));
        }
        self.enqueue(shard_for_key(partition_key, self.shards.len()), payload)
    }

    fn shard_count(&self, stream: &str) -> usize {
        if stream == self.stream {
            self.shards.len()
        } else {
            0
        }
    }

    fn dispatch_to_shard(&self, stream: &str, shard: usize, payload: Bytes) -> CompletionHandle {
        if let Err(err) = self.check_stream(stream) {
            return CompletionHandle::resolved(Err(err));
        }
        if shard >= self.shards.len() {
            return CompletionHandle::resolved(Err(DispatchError::UnknownShard {
                stream: stream.to_owned(),
                shard,
            }));
        }
        self.enqueue(shard, payload)
    }

    async fn flush(&self) -> sfeed_messaging::Result<()> {
        let mut acks = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (tx, rx) = oneshot::channel();
            shard
                .tx
                .send(ShardCommand::Flush(tx))
                .map_err(|_| DispatchError::Shutdown)?;
            acks.push(rx);
        }
        for ack in acks {
            ack.await.map_err(|_| DispatchError::Shutdown)??;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file_stream"
    }
}

impl Drop for FileStreamSink {
    fn drop(&mut self) {
        // Closing the channels lets each writer drain its queue and exit.
        self.shards.clear();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(stream = %self.stream, "shard writer panicked");
            }
        }
    }
}

impl std::fmt::Debug for FileStreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStreamSink")
            .field("stream", &self.stream)
            .field("directory", &self.directory)
            .field("shards", &self.shards.len())
            .finish()
    }
}

struct ShardWorker {
    shard: usize,
    rx: mpsc::UnboundedReceiver<ShardCommand>,
    file: BufWriter<File>,
    aggregate: bool,
    max_batch: usize,
}

impl ShardWorker {
    fn run(mut self) {
        let mut batch: Vec<(Bytes, Completer)> = Vec::with_capacity(self.max_batch);
        while let Some(command) = self.rx.blocking_recv() {
            let mut flush_ack = None;
            match command {
                ShardCommand::Append { payload, completer } => batch.push((payload, completer)),
                ShardCommand::Flush(ack) => flush_ack = Some(ack),
            }
            while flush_ack.is_none() && !batch.is_empty() && batch.len() < self.max_batch {
                match self.rx.try_recv() {
                    Ok(ShardCommand::Append { payload, completer }) => {
                        batch.push((payload, completer))
                    }
                    Ok(ShardCommand::Flush(ack)) => flush_ack = Some(ack),
                    Err(_) => break,
                }
            }

            if !batch.is_empty() {
                self.write_batch(&mut batch);
            }
            if let Some(ack) = flush_ack {
                let _ = ack.send(self.sync());
            }
        }
        if let Err(err) = self.sync() {
            warn!(shard = self.shard, error = %err, "final shard sync failed");
        }
    }

    fn write_batch(&mut self, batch: &mut Vec<(Bytes, Completer)>) {
        let written = match self.aggregate {
            true => self.write_aggregate(batch),
            false => batch
                .iter()
                .try_for_each(|(payload, _)| write_line(&mut self.file, payload)),
        };
        let written = written.and_then(|()| self.file.flush());

        let result = written.map_err(|err| {
            warn!(shard = self.shard, records = batch.len(), error = %err, "shard write failed");
            DispatchError::Io(err.to_string())
        });
        for (_, completer) in batch.drain(..) {
            completer.resolve(result.clone());
        }
    }

    fn write_aggregate(&mut self, batch: &[(Bytes, Completer)]) -> io::Result<()> {
        self.file.write_all(b"[")?;
        for (idx, (payload, _)) in batch.iter().enumerate() {
            if idx > 0 {
                self.file.write_all(b",")?;
            }
            self.file.write_all(payload)?;
        }
        self.file.write_all(b"]\n")
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()
    }
}

fn write_line(file: &mut BufWriter<File>, payload: &[u8]) -> io::Result<()> {
    file.write_all(payload)?;
    file.write_all(b"\n")
}

/// Read back every record of one shard file.
pub fn read_shard(path: &Path) -> Result<Vec<WireRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(line.as_bytes()) {
            Ok(decoded) => records.extend(decoded),
            Err(MessagingError::Json(err)) => return Err(err.into()),
            Err(other) => return Err(io::Error::new(io::ErrorKind::InvalidData, other).into()),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfeed_messaging::{encode_event, encode_watermark, Event, Watermark};
    use tempfile::tempdir;

    fn options(shards: usize, aggregate: bool) -> StreamOptions {
        StreamOptions {
            shards,
            aggregate,
            max_aggregate: 10,
        }
    }

    #[tokio::test]
    async fn routes_records_and_flushes_to_disk() {
        let dir = tempdir().unwrap();
        let sink = FileStreamSink::open(dir.path(), "trips", options(2, false)).unwrap();
        let mut handles = Vec::new();
        for ts in 0..20 {
            let event = Event::new(ts, format!("key-{ts}"), "{}");
            handles.push(sink.dispatch("trips", event.partition_key(), encode_event(ts, &event).unwrap()));
        }
        sink.flush().await.unwrap();
        for handle in handles {
            assert_eq!(handle.wait().await, Ok(()));
        }

        let mut total = 0;
        for path in sink.shard_paths() {
            total += read_shard(&path).unwrap().len();
        }
        assert_eq!(total, 20);
        assert!(dir.path().join("trips/shard-0001.log").exists());
    }

    #[tokio::test]
    async fn unknown_stream_and_shard_fail_fast() {
        let dir = tempdir().unwrap();
        let sink = FileStreamSink::open(dir.path(), "trips", options(1, false)).unwrap();
        assert!(matches!(
            sink.dispatch("other", "k", Bytes::new()).result(),
            Some(Err(DispatchError::UnknownStream(_)))
        ));
        assert!(matches!(
            sink.dispatch_to_shard("trips", 5, Bytes::new()).result(),
            Some(Err(DispatchError::UnknownShard { shard: 5, .. }))
        ));
        assert_eq!(sink.shard_count("other"), 0);
    }

    #[tokio::test]
    async fn aggregated_lines_decode_to_all_records() {
        let dir = tempdir().unwrap();
        let sink = FileStreamSink::open(dir.path(), "trips", options(1, true)).unwrap();
        for ts in 0..5 {
            let event = Event::new(ts, "k", "null");
            sink.dispatch("trips", "k", encode_event(ts, &event).unwrap());
        }
        let marker = encode_watermark(&Watermark {
            value: 4,
            emitted_at_wall_clock: 0,
        })
        .unwrap();
        let handles = sink.broadcast("trips", marker);
        assert_eq!(handles.len(), 1);
        sink.flush().await.unwrap();

        let records = read_shard(&sink.shard_paths()[0]).unwrap();
        assert_eq!(records.len(), 6);
        assert!(matches!(
            records.last(),
            Some(WireRecord::Watermark { watermark: 4, .. })
        ));
    }

    #[test]
    fn rejects_zero_shards() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            FileStreamSink::open(dir.path(), "trips", options(0, false)),
            Err(PersistenceError::InvalidOptions(_))
        ));
    }
}
