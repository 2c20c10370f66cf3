//! ---
//! sfeed_section: "05-replay-engine"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Replay scheduling, flow control, and watermarking."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! Watermark computation over in-flight dispatches.
//!
//! The tracker keeps, in an ordered multiset, the outbound timestamp of every
//! dispatch that has not completed yet. Outbound means the timestamp written
//! to the stream after time adaptation. The producer inserts, completion
//! callbacks remove, and the watermark is derived from the smallest entry:
//!
//! * with dispatches in flight it is `min(outstanding) - 1`;
//! * with nothing in flight it is the highest completed timestamp, capped
//!   below the next event the producer is about to dispatch.
//!
//! A failed dispatch is removed like a successful one, so the watermark can
//! move past an event that never reached the stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sfeed_common::WatermarkConfig;
use sfeed_messaging::{encode_watermark, CompletionHandle, SinkClient, Watermark};
use tracing::{debug, warn};

/// A dispatch between hand-off to the sink and its completion.
#[derive(Debug, Clone)]
pub struct PendingDispatch {
    /// Timestamp the event carries on the stream, after time adaptation.
    pub logical_timestamp: i64,
    pub completion: CompletionHandle,
}

#[derive(Debug, Default)]
struct Outstanding {
    timestamps: BTreeMap<i64, usize>,
    len: usize,
    last_completed: Option<i64>,
    current: Option<i64>,
}

impl Outstanding {
    fn insert(&mut self, timestamp: i64) {
        *self.timestamps.entry(timestamp).or_insert(0) += 1;
        self.len += 1;
    }

    fn complete(&mut self, timestamp: i64) {
        if let Some(count) = self.timestamps.get_mut(&timestamp) {
            *count -= 1;
            if *count == 0 {
                self.timestamps.remove(&timestamp);
            }
            self.len -= 1;
        }
        self.last_completed = Some(self.last_completed.map_or(timestamp, |last| last.max(timestamp)));
    }

    fn settle(&mut self, horizon: Option<i64>) -> Option<i64> {
        let candidate = match self.timestamps.keys().next() {
            Some(&min) => Some(min.saturating_sub(1)),
            None => self.last_completed.map(|completed| match horizon {
                Some(next) => completed.min(next.saturating_sub(1)),
                None => completed,
            }),
        };
        self.current = match (self.current, candidate) {
            (Some(current), Some(candidate)) => Some(current.max(candidate)),
            (current, candidate) => current.or(candidate),
        };
        self.current
    }
}

#[derive(Debug)]
struct EmitState {
    last_emit_ms: i64,
    events_since_emit: u64,
    emitted: u64,
    last_emitted: Option<Watermark>,
}

/// Tracks in-flight dispatches and emits watermark markers.
#[derive(Debug)]
pub struct WatermarkTracker {
    outstanding: Arc<Mutex<Outstanding>>,
    emit: Mutex<EmitState>,
    config: WatermarkConfig,
}

impl WatermarkTracker {
    /// Create a tracker; the emission interval is measured from `start_ms`.
    pub fn new(config: WatermarkConfig, start_ms: i64) -> Self {
        Self {
            outstanding: Arc::new(Mutex::new(Outstanding::default())),
            emit: Mutex::new(EmitState {
                last_emit_ms: start_ms,
                events_since_emit: 0,
                emitted: 0,
                last_emitted: None,
            }),
            config,
        }
    }

    /// Record a dispatch and remove it again once its completion resolves.
    pub fn track(&self, dispatch: &PendingDispatch) {
        let timestamp = dispatch.logical_timestamp;
        self.outstanding.lock().insert(timestamp);
        self.emit.lock().events_since_emit += 1;

        // Registered after the insert lock is released: an already resolved
        // handle runs the hook inline.
        let outstanding = Arc::clone(&self.outstanding);
        dispatch
            .completion
            .on_complete(move |_| outstanding.lock().complete(timestamp));
    }

    /// Watermark settled by the last call to
    /// [`current_watermark_with_horizon`](Self::current_watermark_with_horizon)
    /// or by an emission. Reading it never advances the watermark.
    pub fn current_watermark(&self) -> Option<i64> {
        self.outstanding.lock().current
    }

    /// Advance the watermark given the next timestamp the producer will
    /// dispatch (`None` once the source is exhausted) and return it.
    pub fn current_watermark_with_horizon(&self, horizon: Option<i64>) -> Option<i64> {
        self.outstanding.lock().settle(horizon)
    }

    /// Emit a marker if the interval elapsed or enough events were dispatched.
    ///
    /// Returns the emitted watermark. Counters reset whenever a trigger fires
    /// and a watermark exists, including when emission is disabled. Before
    /// anything was tracked the trigger stays armed.
    pub fn maybe_emit(
        &self,
        now_ms: i64,
        horizon: Option<i64>,
        sink: &dyn SinkClient,
        stream: &str,
    ) -> Option<Watermark> {
        {
            let emit = self.emit.lock();
            let interval_ms = i64::try_from(self.config.interval.as_millis()).unwrap_or(i64::MAX);
            let elapsed = now_ms.saturating_sub(emit.last_emit_ms);
            if elapsed < interval_ms && emit.events_since_emit < self.config.event_threshold {
                return None;
            }
        }
        let value = self.current_watermark_with_horizon(horizon)?;
        {
            let mut emit = self.emit.lock();
            emit.last_emit_ms = now_ms;
            emit.events_since_emit = 0;
        }
        self.broadcast(value, now_ms, sink, stream)
    }

    /// Emit a marker regardless of the triggers, e.g. after the final drain.
    pub fn emit_now(
        &self,
        now_ms: i64,
        horizon: Option<i64>,
        sink: &dyn SinkClient,
        stream: &str,
    ) -> Option<Watermark> {
        let value = self.current_watermark_with_horizon(horizon)?;
        self.broadcast(value, now_ms, sink, stream)
    }

    fn broadcast(
        &self,
        value: i64,
        now_ms: i64,
        sink: &dyn SinkClient,
        stream: &str,
    ) -> Option<Watermark> {
        if !self.config.enabled {
            return None;
        }
        let watermark = Watermark {
            value,
            emitted_at_wall_clock: now_ms,
        };
        let payload = match encode_watermark(&watermark) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, watermark = value, "failed to encode watermark");
                return None;
            }
        };

        let handles = sink.broadcast(stream, payload);
        for (shard, handle) in handles.iter().enumerate() {
            handle.on_complete(move |result| {
                if let Err(err) = result {
                    warn!(shard, watermark = value, error = %err, "watermark marker failed");
                }
            });
        }
        debug!(watermark = value, shards = handles.len(), "emitted watermark");

        let mut emit = self.emit.lock();
        emit.emitted += 1;
        emit.last_emitted = Some(watermark);
        Some(watermark)
    }

    /// Dispatches awaiting completion.
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.lock().len
    }

    /// Dispatches tracked since the last trigger fired.
    pub fn events_since_emit(&self) -> u64 {
        self.emit.lock().events_since_emit
    }

    /// Markers broadcast so far.
    pub fn emitted_count(&self) -> u64 {
        self.emit.lock().emitted
    }

    pub fn last_emitted(&self) -> Option<Watermark> {
        self.emit.lock().last_emitted
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
