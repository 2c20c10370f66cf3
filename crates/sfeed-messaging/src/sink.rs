//! ---
//! sfeed_section: "02-messaging-dispatch"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event model, completion handles, and sink clients."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;

use crate::completion::{completion_pair, CompletionHandle};
use crate::{DispatchError, Result};

/// Client of the destination stream.
///
/// `dispatch` never blocks on delivery: it queues the record and returns a
/// handle that resolves once the destination acknowledged or refused it.
#[async_trait]
pub trait SinkClient: Send + Sync {
    /// Queue a record routed by partition key.
    fn dispatch(&self, stream: &str, partition_key: &str, payload: Bytes) -> CompletionHandle;

    /// Number of shards the stream is split into.
    fn shard_count(&self, stream: &str) -> usize;

    /// Queue a record for an explicit shard.
    fn dispatch_to_shard(&self, stream: &str, shard: usize, payload: Bytes) -> CompletionHandle;

    /// Queue the same record for every shard of the stream.
    fn broadcast(&self, stream: &str, payload: Bytes) -> Vec<CompletionHandle> {
        (0..self.shard_count(stream))
            .map(|shard| self.dispatch_to_shard(stream, shard, payload.clone()))
            .collect()
    }

    /// Wait until every queued record has been written or refused.
    async fn flush(&self) -> Result<()>;

    /// Human-readable sink name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Stable shard selection for a partition key.
pub fn shard_for_key(partition_key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    partition_key.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Record accepted by the [`InMemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredRecord {
    /// Stream the record was addressed to.
    pub stream: String,
    /// Shard the record landed on.
    pub shard: usize,
    /// Routing key, absent for shard-addressed records.
    pub partition_key: Option<String>,
    /// Encoded record.
    pub payload: Bytes,
}

type FailurePredicate = dyn Fn(&Bytes) -> bool + Send + Sync;

#[derive(Default)]
struct MemoryState {
    delivered: Vec<DeliveredRecord>,
    failed: u64,
    in_flight: usize,
    max_in_flight: usize,
}

/// Sink that keeps records in memory and completes them on tokio tasks.
///
/// Latency, jitter (which reorders completions) and failures are configurable so
/// callers can exercise slow or lossy destinations. Requires a tokio runtime.
#[derive(Clone)]
pub struct InMemorySink {
    shards: usize,
    latency: Duration,
    jitter: Duration,
    failure: Option<Arc<FailurePredicate>>,
    state: Arc<Mutex<MemoryState>>,
    in_flight_tx: Arc<watch::Sender<usize>>,
}

impl InMemorySink {
    /// Create a sink with the given number of shards and instant completions.
    pub fn new(shards: usize) -> Self {
        let (in_flight_tx, _) = watch::channel(0usize);
        Self {
            shards: shards.max(1),
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            failure: None,
            state: Arc::new(Mutex::new(MemoryState::default())),
            in_flight_tx: Arc::new(in_flight_tx),
        }
    }

    /// Fixed delay before each completion.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Additional uniformly random delay per completion.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Refuse every record for which `predicate` returns true.
    pub fn with_failures<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Bytes) -> bool + Send + Sync + 'static,
    {
        self.failure = Some(Arc::new(predicate));
        self
    }

    /// Snapshot of accepted records in completion order.
    pub fn delivered(&self) -> Vec<DeliveredRecord> {
        self.state.lock().delivered.clone()
    }

    /// Number of refused records.
    pub fn failed_count(&self) -> u64 {
        self.state.lock().failed
    }

    /// Records queued but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Highest number of simultaneously queued records observed.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    fn enqueue(
        &self,
        stream: &str,
        shard: usize,
        partition_key: Option<&str>,
        payload: Bytes,
    ) -> CompletionHandle {
        let (completer, handle) = completion_pair();
        {
            let mut state = self.state.lock();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            self.in_flight_tx.send_replace(state.in_flight);
        }

        let delay = self.latency + self.random_jitter();
        let refused = self.failure.as_ref().is_some_and(|fail| fail(&payload));
        let record = DeliveredRecord {
            stream: stream.to_owned(),
            shard,
            partition_key: partition_key.map(str::to_owned),
            payload,
        };
        let state = self.state.clone();
        let in_flight_tx = self.in_flight_tx.clone();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = {
                let mut state = state.lock();
                state.in_flight -= 1;
                in_flight_tx.send_replace(state.in_flight);
                if refused {
                    state.failed += 1;
                    Err(DispatchError::Rejected {
                        stream: record.stream,
                        reason: "injected failure".into(),
                    })
                } else {
                    state.delivered.push(record);
                    Ok(())
                }
            };
            completer.resolve(result);
        });

        handle
    }

    fn random_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let micros = self.jitter.as_micros().min(u64::MAX as u128) as u64;
        Duration::from_micros(rand::thread_rng().gen_range(0..=micros))
    }
}

#[async_trait]
impl SinkClient for InMemorySink {
    fn dispatch(&self, stream: &str, partition_key: &str, payload: Bytes) -> CompletionHandle {
        let shard = shard_for_key(partition_key, self.shards);
        self.enqueue(stream, shard, Some(partition_key), payload)
    }

    fn shard_count(&self, _stream: &str) -> usize {
        self.shards
    }

    fn dispatch_to_shard(&self, stream: &str, shard: usize, payload: Bytes) -> CompletionHandle {
        if shard >= self.shards {
            return CompletionHandle::resolved(Err(DispatchError::UnknownShard {
                stream: stream.to_owned(),
                shard,
            }));
        }
        self.enqueue(stream, shard, None, payload)
    }

    async fn flush(&self) -> Result<()> {
        let mut rx = self.in_flight_tx.subscribe();
        rx.wait_for(|in_flight| *in_flight == 0)
            .await
            .map_err(|_| DispatchError::Shutdown)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

impl std::fmt::Debug for InMemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySink")
            .field("shards", &self.shards)
            .field("latency", &self.latency)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_selection_is_stable_and_bounded() {
        for key in ["a", "b", "trip-42", ""] {
            let shard = shard_for_key(key, 4);
            assert!(shard < 4);
            assert_eq!(shard, shard_for_key(key, 4));
        }
        assert_eq!(shard_for_key("anything", 0), 0);
    }

    #[tokio::test]
    async fn delivers_and_flushes() {
        let sink = InMemorySink::new(2);
        let first = sink.dispatch("s", "a", Bytes::from_static(b"1"));
        let second = sink.dispatch("s", "b", Bytes::from_static(b"2"));
        sink.flush().await.unwrap();
        assert_eq!(first.wait().await, Ok(()));
        assert_eq!(second.wait().await, Ok(()));
        assert_eq!(sink.delivered().len(), 2);
        assert_eq!(sink.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_failures_resolve_with_error() {
        let sink = InMemorySink::new(1)
            .with_latency(Duration::from_millis(10))
            .with_failures(|payload| payload.as_ref() == b"bad");
        let ok = sink.dispatch("s", "k", Bytes::from_static(b"good"));
        let bad = sink.dispatch("s", "k", Bytes::from_static(b"bad"));
        assert!(!bad.is_resolved());
        assert!(matches!(
            bad.wait().await,
            Err(DispatchError::Rejected { .. })
        ));
        assert_eq!(ok.wait().await, Ok(()));
        assert_eq!(sink.failed_count(), 1);
        assert_eq!(sink.delivered().len(), 1);
        assert_eq!(sink.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_shard() {
        let sink = InMemorySink::new(3);
        let handles = sink.broadcast("s", Bytes::from_static(b"marker"));
        assert_eq!(handles.len(), 3);
        sink.flush().await.unwrap();
        let mut shards: Vec<_> = sink.delivered().iter().map(|r| r.shard).collect();
        shards.sort_unstable();
        assert_eq!(shards, vec![0, 1, 2]);
        let out_of_range = sink.dispatch_to_shard("s", 3, Bytes::new());
        assert!(matches!(
            out_of_range.result(),
            Some(Err(DispatchError::UnknownShard { shard: 3, .. }))
        ));
    }
}
