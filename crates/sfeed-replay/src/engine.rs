//! ---
//! sfeed_section: "05-replay-engine"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Replay scheduling, flow control, and watermarking."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! The driving loop.
//!
//! A single producer pulls events from the source in order, waits until each
//! one is due on the replay clock, takes a backpressure unit and hands the
//! event to the sink. Completions come back on the sink's own threads or tasks
//! and only touch the gate, the watermark tracker and the failure counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sfeed_common::time::{format_millis, AnchoredClock, WallClock};
use sfeed_messaging::{encode_event, Event, SinkClient};
use sfeed_metrics::ReplayMetrics;
use sfeed_persistence::EventSource;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backpressure::BackpressureGate;
use crate::clock::{ClockDecision, ReplayClock};
use crate::config::EngineConfig;
use crate::stats::{ReplayReport, StatisticsReporter};
use crate::time_adapter::TimeAdapter;
use crate::watermark::{PendingDispatch, WatermarkTracker};
use crate::Result;

/// Lifecycle of a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Pacing and dispatching events.
    Running,
    /// Source exhausted; waiting for outstanding dispatches.
    Draining,
    /// Every dispatch completed.
    Terminated,
}

/// Replays an [`EventSource`] into a [`SinkClient`].
pub struct ReplayEngine<S> {
    config: EngineConfig,
    source: S,
    sink: Arc<dyn SinkClient>,
    clock: Option<Arc<dyn WallClock>>,
    metrics: Option<ReplayMetrics>,
    seek: Option<i64>,
}

struct Counters {
    dispatched: u64,
    encode_errors: u64,
    first_timestamp: Option<i64>,
    last_timestamp: Option<i64>,
    replay_lag_secs: f64,
}

impl<S: EventSource> ReplayEngine<S> {
    /// Build an engine after validating its configuration.
    pub fn new(config: EngineConfig, source: S, sink: Arc<dyn SinkClient>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            sink,
            clock: None,
            metrics: None,
            seek: None,
        })
    }

    /// Wall clock used for timestamps and watermark cadence.
    ///
    /// Defaults to a clock anchored at the start of [`run`](Self::run).
    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_metrics(mut self, metrics: ReplayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Position the source at the first event at or after `timestamp_ms`.
    ///
    /// Both replay clock origins are taken from the first event read after the
    /// seek, when the replay starts.
    pub fn seek(&mut self, timestamp_ms: i64) -> Result<()> {
        info!(seek = %format_millis(timestamp_ms), "seeking event source");
        self.source.seek(timestamp_ms)?;
        self.seek = Some(timestamp_ms);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replay until the source is exhausted and every dispatch has completed.
    pub async fn run(mut self) -> Result<ReplayReport> {
        let clock: Arc<dyn WallClock> = match self.clock.take() {
            Some(clock) => clock,
            None => Arc::new(AnchoredClock::now()),
        };
        let wall_start = Instant::now();
        let start_ms = clock.now_ms();
        let stream = self.config.stream.clone();

        let mut next = self.source.next_event()?;
        let Some(logical_origin) = next.as_ref().map(Event::logical_timestamp) else {
            info!(stream = %stream, "event source is empty; nothing to replay");
            self.log_state(EngineState::Terminated);
            return Ok(ReplayReport {
                stream,
                elapsed: wall_start.elapsed(),
                ..ReplayReport::default()
            });
        };

        let replay_clock = ReplayClock::new(
            wall_start,
            logical_origin,
            self.config.speedup,
            self.config.min_sleep,
        );
        let adapter = TimeAdapter::new(self.config.adapt_time, start_ms, logical_origin);
        let gate = BackpressureGate::new(self.config.max_outstanding);
        let tracker = WatermarkTracker::new(self.config.watermark.clone(), start_ms);
        let mut statistics = StatisticsReporter::new(self.config.statistics_frequency, start_ms);
        let failed = Arc::new(AtomicU64::new(0));
        let mut counters = Counters {
            dispatched: 0,
            encode_errors: 0,
            first_timestamp: None,
            last_timestamp: None,
            replay_lag_secs: 0.0,
        };

        info!(
            stream = %stream,
            sink = self.sink.name(),
            origin = %format_millis(logical_origin),
            speedup = self.config.speedup,
            adapt_time = self.config.adapt_time.as_str(),
            capacity = gate.capacity(),
            seek = ?self.seek,
            watermarks = tracker.is_enabled(),
            "starting replay"
        );
        self.log_state(EngineState::Running);

        while let Some(logical_ts) = next.as_ref().map(Event::logical_timestamp) {
            match replay_clock.decide(Instant::now(), logical_ts) {
                ClockDecision::Sleep { wait, gap_ms } => {
                    counters.replay_lag_secs = replay_clock.replay_lag(gap_ms);
                    tokio::time::sleep(wait).await;
                }
                ClockDecision::Dispatch { gap_ms } => {
                    counters.replay_lag_secs = replay_clock.replay_lag(gap_ms);
                    if let Some(event) = next.take() {
                        self.dispatch(
                            event,
                            &adapter,
                            &gate,
                            &tracker,
                            clock.as_ref(),
                            &failed,
                            &mut counters,
                        )
                        .await?;
                        statistics.record_dispatch();
                    }
                    next = self.source.next_event()?;
                }
            }

            let now_ms = clock.now_ms();
            // Lower bound on the outbound timestamp of the next dispatch.
            let horizon = next
                .as_ref()
                .map(|event| adapter.adapt(event.logical_timestamp(), now_ms));
            if let Some(watermark) =
                tracker.maybe_emit(now_ms, horizon, self.sink.as_ref(), &stream)
            {
                if let Some(metrics) = &self.metrics {
                    metrics.record_watermark(watermark.value);
                }
            }
            if let Some(metrics) = &self.metrics {
                metrics.set_outstanding(gate.outstanding());
                metrics.set_replay_lag(counters.replay_lag_secs);
            }
            statistics.maybe_report(
                now_ms,
                tracker.current_watermark_with_horizon(horizon),
                counters.replay_lag_secs,
            );
        }

        self.log_state(EngineState::Draining);
        debug!(outstanding = gate.outstanding(), "waiting for outstanding dispatches");
        gate.drain().await?;

        let now_ms = clock.now_ms();
        if let Some(watermark) = tracker.emit_now(now_ms, None, self.sink.as_ref(), &stream) {
            if let Some(metrics) = &self.metrics {
                metrics.record_watermark(watermark.value);
            }
        }
        self.sink.flush().await?;
        if let Some(metrics) = &self.metrics {
            metrics.set_outstanding(gate.outstanding());
        }
        self.log_state(EngineState::Terminated);

        let report = ReplayReport {
            stream,
            dispatched: counters.dispatched,
            failed: failed.load(Ordering::SeqCst),
            encode_errors: counters.encode_errors,
            watermarks_emitted: tracker.emitted_count(),
            last_watermark: tracker.current_watermark(),
            first_timestamp: counters.first_timestamp,
            last_timestamp: counters.last_timestamp,
            peak_outstanding: gate.peak_outstanding(),
            elapsed: wall_start.elapsed(),
        };
        info!(
            dispatched = report.dispatched,
            failed = report.failed,
            watermarks = report.watermarks_emitted,
            peak_outstanding = report.peak_outstanding,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "replay finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        event: Event,
        adapter: &TimeAdapter,
        gate: &BackpressureGate,
        tracker: &WatermarkTracker,
        clock: &dyn WallClock,
        failed: &Arc<AtomicU64>,
        counters: &mut Counters,
    ) -> Result<()> {
        let permit = gate.reserve().await?;
        let logical_ts = event.logical_timestamp();
        let outbound_ts = adapter.adapt(logical_ts, clock.now_ms());
        let payload = match encode_event(outbound_ts, &event) {
            Ok(payload) => payload,
            Err(err) => {
                counters.encode_errors += 1;
                warn!(timestamp = logical_ts, error = %err, "dropping event that failed to encode");
                return Ok(());
            }
        };

        let stream = &self.config.stream;
        let completion = self.sink.dispatch(stream, event.partition_key(), payload);
        tracker.track(&PendingDispatch {
            logical_timestamp: outbound_ts,
            completion: completion.clone(),
        });

        let failed = Arc::clone(failed);
        let metrics = self.metrics.clone();
        let partition_key = event.partition_key().to_owned();
        completion.on_complete(move |result| {
            if let Err(err) = result {
                failed.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &metrics {
                    metrics.record_failure();
                }
                warn!(timestamp = logical_ts, partition_key = %partition_key, error = %err, "dispatch failed");
            }
        });
        permit.release_on(&completion);

        counters.dispatched += 1;
        counters.first_timestamp.get_or_insert(logical_ts);
        counters.last_timestamp = Some(logical_ts);
        if let Some(metrics) = &self.metrics {
            metrics.record_dispatch();
        }
        Ok(())
    }

    fn log_state(&self, state: EngineState) {
        info!(?state, stream = %self.config.stream, "replay state");
    }
}

impl<S> std::fmt::Debug for ReplayEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("config", &self.config)
            .field("sink", &self.sink.name())
            .field("seek", &self.seek)
            .finish_non_exhaustive()
    }
}
