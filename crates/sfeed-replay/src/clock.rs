//! ---
//! sfeed_section: "05-replay-engine"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Replay scheduling, flow control, and watermarking."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! Pacing of the replay against scaled logical time.

use std::time::Duration;

use tokio::time::Instant;

/// Outcome of a pacing check for the next event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockDecision {
    /// The event is due; `gap_ms` is how far (in scaled logical ms) the replay
    /// is behind schedule.
    Dispatch { gap_ms: f64 },
    /// The event is early; wait this long before asking again. `gap_ms` is
    /// negative, the scaled logical ms the replay is ahead of schedule.
    Sleep { wait: Duration, gap_ms: f64 },
}

/// Maps elapsed wall-clock time onto elapsed logical time.
///
/// Both origins are fixed when the replay starts (after any seek).
#[derive(Debug, Clone, Copy)]
pub struct ReplayClock {
    wall_origin: Instant,
    logical_origin: i64,
    speedup: f64,
    min_sleep: Duration,
}

impl ReplayClock {
    pub fn new(wall_origin: Instant, logical_origin: i64, speedup: f64, min_sleep: Duration) -> Self {
        Self {
            wall_origin,
            logical_origin,
            speedup,
            min_sleep,
        }
    }

    /// Decide whether an event with `logical_ts` may be dispatched at `now`.
    pub fn decide(&self, now: Instant, logical_ts: i64) -> ClockDecision {
        let elapsed_us = now.saturating_duration_since(self.wall_origin).as_micros();
        let delta_system = elapsed_us as f64 / 1_000.0 * self.speedup;
        let delta_log = logical_ts.saturating_sub(self.logical_origin) as f64;
        let gap = delta_system - delta_log;
        if gap >= 0.0 {
            return ClockDecision::Dispatch { gap_ms: gap };
        }
        let wait_us = (-gap / self.speedup * 1_000.0).ceil();
        let wait = if wait_us >= u64::MAX as f64 {
            Duration::MAX
        } else {
            Duration::from_micros(wait_us as u64)
        };
        ClockDecision::Sleep {
            wait: wait.max(self.min_sleep),
            gap_ms: gap,
        }
    }

    /// Wall-clock seconds the replay trails its schedule; negative when early.
    pub fn replay_lag(&self, gap_ms: f64) -> f64 {
        gap_ms / self.speedup / 1_000.0
    }

    pub fn logical_origin(&self) -> i64 {
        self.logical_origin
    }

    pub fn wall_origin(&self) -> Instant {
        self.wall_origin
    }

    pub fn speedup(&self) -> f64 {
        self.speedup
    }
}
