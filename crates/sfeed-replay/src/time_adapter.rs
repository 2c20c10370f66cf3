//! ---
//! sfeed_section: "05-replay-engine"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Replay scheduling, flow control, and watermarking."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use sfeed_common::AdaptTime;

/// Rewrites outbound timestamps under the policy chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAdapter {
    policy: AdaptTime,
    engine_start_ms: i64,
    logical_origin: i64,
}

impl TimeAdapter {
    pub fn new(policy: AdaptTime, engine_start_ms: i64, logical_origin: i64) -> Self {
        Self {
            policy,
            engine_start_ms,
            logical_origin,
        }
    }

    /// Outbound timestamp for an event dispatched at wall-clock `now_ms`.
    pub fn adapt(&self, logical_ts: i64, now_ms: i64) -> i64 {
        match self.policy {
            AdaptTime::Original => logical_ts,
            AdaptTime::Invocation => self
                .engine_start_ms
                .saturating_add(logical_ts.saturating_sub(self.logical_origin)),
            AdaptTime::Ingestion => now_ms,
        }
    }

    pub fn policy(&self) -> AdaptTime {
        self.policy
    }
}
