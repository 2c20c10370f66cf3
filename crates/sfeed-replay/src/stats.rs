//! ---
//! sfeed_section: "05-replay-engine"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Replay scheduling, flow control, and watermarking."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use std::time::Duration;

use serde::Serialize;
use serde_with::{serde_as, DurationMilliSeconds};
use sfeed_common::time::format_millis;
use tracing::info;

/// Summary returned when a replay terminates.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayReport {
    pub stream: String,
    /// Events handed to the sink.
    pub dispatched: u64,
    /// Dispatches the sink reported as failed.
    pub failed: u64,
    /// Events dropped because they could not be encoded.
    pub encode_errors: u64,
    pub watermarks_emitted: u64,
    pub last_watermark: Option<i64>,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    pub peak_outstanding: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub elapsed: Duration,
}

/// Periodic progress line, printed whenever the statistics time slot changes.
#[derive(Debug)]
pub(crate) struct StatisticsReporter {
    frequency_ms: i64,
    start_ms: i64,
    last_slot: i64,
    events_in_slot: u64,
}

impl StatisticsReporter {
    pub(crate) fn new(frequency: Duration, start_ms: i64) -> Self {
        Self {
            frequency_ms: i64::try_from(frequency.as_millis()).unwrap_or(i64::MAX).max(1),
            start_ms,
            last_slot: 0,
            events_in_slot: 0,
        }
    }

    pub(crate) fn record_dispatch(&mut self) {
        self.events_in_slot += 1;
    }

    /// Log progress if a new slot started. Returns whether a line was written.
    pub(crate) fn maybe_report(
        &mut self,
        now_ms: i64,
        watermark: Option<i64>,
        replay_lag_secs: f64,
    ) -> bool {
        let slot = now_ms.saturating_sub(self.start_ms) / self.frequency_ms;
        if slot == self.last_slot {
            return false;
        }
        let events_per_sec = (1_000.0 * self.events_in_slot as f64 / self.frequency_ms as f64).round();
        let sent_before = watermark
            .map(|value| format_millis(value.saturating_add(1)))
            .unwrap_or_else(|| "-".to_owned());
        info!(
            events_per_sec,
            replay_lag_secs = replay_lag_secs.round(),
            "all events with timestamp before {sent_before} have been sent ({events_per_sec} events/sec, {} sec replay lag)",
            replay_lag_secs.round()
        );
        self.events_in_slot = 0;
        self.last_slot = slot;
        true
    }
}
