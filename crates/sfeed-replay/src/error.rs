//! ---
//! sfeed_section: "05-replay-engine"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Replay scheduling, flow control, and watermarking."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use sfeed_common::ConfigError;
use sfeed_messaging::MessagingError;
use sfeed_persistence::SourceError;

/// Result alias used throughout the replay crate.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Errors that stop a replay.
///
/// Individual dispatch failures never surface here; they are logged and counted.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Engine configuration rejected before the replay started.
    #[error("invalid replay configuration: {0}")]
    Config(#[from] ConfigError),
    /// Reading the event source failed.
    #[error(transparent)]
    Source(#[from] SourceError),
    /// The sink could not be flushed at shutdown.
    #[error("sink error: {0}")]
    Sink(#[from] MessagingError),
    /// The backpressure gate was closed while the producer waited on it.
    #[error("backpressure gate closed")]
    GateClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_keep_their_message() {
        let err = ReplayError::from(ConfigError::InvalidSpeedup(0.0));
        assert_eq!(
            err.to_string(),
            "invalid replay configuration: speedup factor must be a finite number greater than zero, got 0"
        );
    }
}
