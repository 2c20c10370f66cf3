//! ---
//! sfeed_section: "05-replay-engine"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Replay scheduling, flow control, and watermarking."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! Replay engine for sfeed.
//!
//! Paces a timestamp-ordered event source against a scaled wall clock,
//! bounds the number of unacknowledged dispatches, and broadcasts watermarks
//! that stay below every event still in flight.

pub mod backpressure;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod stats;
pub mod time_adapter;
pub mod watermark;

pub use backpressure::{BackpressureGate, GatePermit};
pub use clock::{ClockDecision, ReplayClock};
pub use config::EngineConfig;
pub use engine::{EngineState, ReplayEngine};
pub use error::{ReplayError, Result};
pub use stats::ReplayReport;
pub use time_adapter::TimeAdapter;
pub use watermark::{PendingDispatch, WatermarkTracker};
