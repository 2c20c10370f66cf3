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

use sfeed_common::{AdaptTime, AppConfig, ConfigError, WatermarkConfig};

/// Everything the engine needs to know, passed in at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Destination stream name.
    pub stream: String,
    /// Replay speed relative to logical time.
    pub speedup: f64,
    /// Lower bound on a single pacing sleep.
    pub min_sleep: Duration,
    /// Capacity of the backpressure gate.
    pub max_outstanding: usize,
    /// Outbound timestamp policy.
    pub adapt_time: AdaptTime,
    /// Period of the progress log line.
    pub statistics_frequency: Duration,
    /// Watermark cadence and on/off switch.
    pub watermark: WatermarkConfig,
}

impl EngineConfig {
    /// Extract the engine settings from the application configuration.
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            stream: config.sink.stream.clone(),
            speedup: config.replay.speedup,
            min_sleep: config.replay.min_sleep,
            max_outstanding: config.replay.max_outstanding,
            adapt_time: config.replay.adapt_time,
            statistics_frequency: config.replay.statistics_frequency,
            watermark: config.watermark.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.trim().is_empty() {
            return Err(ConfigError::EmptyStream);
        }
        if !self.speedup.is_finite() || self.speedup <= 0.0 {
            return Err(ConfigError::InvalidSpeedup(self.speedup));
        }
        if self.max_outstanding == 0 {
            return Err(ConfigError::Zero {
                field: "max_outstanding",
            });
        }
        if self.statistics_frequency.is_zero() {
            return Err(ConfigError::Zero {
                field: "statistics_frequency",
            });
        }
        self.watermark.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_application_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.stream, "taxi-trip-events");
        assert_eq!(config.speedup, 6480.0);
        assert_eq!(config.min_sleep, Duration::from_millis(5));
        assert_eq!(config.max_outstanding, 50_000);
        assert_eq!(config.watermark.interval, Duration::from_millis(5_000));
        assert_eq!(config.watermark.event_threshold, 100_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unusable_values() {
        let mut config = EngineConfig {
            speedup: f64::NAN,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSpeedup(_))));
        config.speedup = 1.0;
        config.max_outstanding = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_outstanding"
            })
        );
        config.max_outstanding = 1;
        config.stream = " ".into();
        assert_eq!(config.validate(), Err(ConfigError::EmptyStream));
    }
}
