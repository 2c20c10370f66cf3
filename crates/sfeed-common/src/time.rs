//! ---
//! sfeed_section: "01-core-functionality"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Shared primitives and utilities for the replay runtime."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::config::ConfigError;

/// Source of wall-clock time in epoch milliseconds.
pub trait WallClock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> i64;
}

/// Reads the system clock directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Epoch clock that advances with the tokio monotonic clock from a fixed anchor.
///
/// Immune to wall-clock steps during a replay and follows `tokio::time::pause`
/// in tests, so pacing and timestamps observed by the engine stay consistent.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    anchor_ms: i64,
    anchor: tokio::time::Instant,
}

impl AnchoredClock {
    /// Anchor at the current system time.
    pub fn now() -> Self {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    /// Anchor at an explicit epoch value.
    pub fn starting_at(anchor_ms: i64) -> Self {
        Self {
            anchor_ms,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl WallClock for AnchoredClock {
    fn now_ms(&self) -> i64 {
        let elapsed = self.anchor.elapsed().as_millis();
        self.anchor_ms + i64::try_from(elapsed).unwrap_or(i64::MAX - self.anchor_ms)
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Parse a user supplied timestamp into epoch milliseconds.
///
/// Accepts RFC 3339, a zone-less ISO date-time or date (interpreted as UTC), or a
/// raw millisecond count.
pub fn parse_timestamp(input: &str) -> Result<i64, ConfigError> {
    let trimmed = input.trim();
    if let Ok(millis) = trimmed.parse::<i64>() {
        return Ok(millis);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    match NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        Ok(date) => {
            let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| invalid(input, "bad date"))?;
            Ok(Utc.from_utc_datetime(&midnight).timestamp_millis())
        }
        Err(err) => Err(invalid(input, &err.to_string())),
    }
}

/// Render epoch milliseconds as RFC 3339 for log output.
pub fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn invalid(input: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidTimestamp {
        input: input.to_owned(),
        reason: reason.to_owned(),
    }
}
