//! ---
//! sfeed_section: "01-core-functionality"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Shared primitives and utilities for the replay runtime."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! Core shared primitives for the sfeed workspace.
//! This crate exposes configuration loading, logging setup, and the wall
//! clocks consumed by the replay engine and its collaborators.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AdaptTime, AppConfig, ConfigError, LoggingConfig, MetricsConfig, ReplayConfig, SinkConfig,
    SourceConfig, WatermarkConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{parse_timestamp, AnchoredClock, ManualClock, SystemClock, WallClock};
