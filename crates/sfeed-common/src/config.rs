//! ---
//! sfeed_section: "01-core-functionality"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Shared primitives and utilities for the replay runtime."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::time::parse_timestamp;

fn default_source_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_source_prefix() -> String {
    "artifacts/flink-refarch/data/nyc-tlc-trips".to_owned()
}

fn default_region() -> String {
    "eu-west-1".to_owned()
}

fn default_stream() -> String {
    "taxi-trip-events".to_owned()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("target/streams")
}

fn default_shards() -> usize {
    4
}

fn default_max_aggregate() -> usize {
    100
}

fn default_speedup() -> f64 {
    6480.0
}

fn default_statistics_frequency() -> Duration {
    Duration::from_millis(60_000)
}

fn default_min_sleep() -> Duration {
    Duration::from_millis(5)
}

fn default_max_outstanding() -> usize {
    50_000
}

fn default_watermark_enabled() -> bool {
    true
}

fn default_watermark_interval() -> Duration {
    Duration::from_millis(5_000)
}

fn default_watermark_event_threshold() -> u64 {
    100_000
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Fatal configuration problems detected before a replay starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("speedup factor must be a finite number greater than zero, got {0}")]
    InvalidSpeedup(f64),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("stream name cannot be empty")]
    EmptyStream,
    #[error("invalid timestamp '{input}': {reason}")]
    InvalidTimestamp { input: String, reason: String },
    #[error("unknown time adaptation '{0}' (expected original, invocation or ingestion)")]
    UnknownAdaptTime(String),
}

/// Timestamp rewrite policy applied to outbound events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdaptTime {
    /// Keep the logical timestamp as recorded.
    #[default]
    Original,
    /// Shift the log so its first event lands on the engine start time.
    Invocation,
    /// Stamp events with the wall clock at the moment of dispatch.
    Ingestion,
}

impl AdaptTime {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptTime::Original => "original",
            AdaptTime::Invocation => "invocation",
            AdaptTime::Ingestion => "ingestion",
        }
    }
}

impl std::str::FromStr for AdaptTime {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "original" => Ok(AdaptTime::Original),
            "invocation" => Ok(AdaptTime::Invocation),
            "ingestion" => Ok(AdaptTime::Ingestion),
            other => Err(ConfigError::UnknownAdaptTime(other.to_owned())),
        }
    }
}

/// Primary configuration object for the replay daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub watermark: WatermarkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "SFEED_CONFIG";

    /// Load configuration from disk, respecting the `SFEED_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the file it came from.
    ///
    /// Unlike the daemon flags every section has defaults, so a missing file is
    /// not an error: the built-in defaults are returned with `source: None`.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!("no configuration file found; using defaults");
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .map_err(|err| anyhow!("invalid config file {}: {}", path.display(), err))?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.sink.validate()?;
        self.replay.validate()?;
        self.watermark.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Location of the historical event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory holding the log segments.
    #[serde(default = "default_source_root")]
    pub root: PathBuf,
    /// Only segments whose path relative to `root` starts with this prefix are read.
    #[serde(default = "default_source_prefix")]
    pub prefix: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: default_source_root(),
            prefix: default_source_prefix(),
        }
    }
}

/// Destination stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Pack several events into a single stream record.
    #[serde(default)]
    pub aggregate: bool,
    #[serde(default = "default_max_aggregate")]
    pub max_aggregate: usize,
    /// Deliver to an in-memory sink instead of the output directory.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            stream: default_stream(),
            output_dir: default_output_dir(),
            shards: default_shards(),
            aggregate: false,
            max_aggregate: default_max_aggregate(),
            dry_run: false,
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.stream.trim().is_empty() {
            return Err(ConfigError::EmptyStream);
        }
        if self.shards == 0 {
            return Err(ConfigError::Zero { field: "shards" });
        }
        if self.max_aggregate == 0 {
            return Err(ConfigError::Zero {
                field: "max_aggregate",
            });
        }
        Ok(())
    }
}

/// Pacing and flow-control settings for the replay loop.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_speedup")]
    pub speedup: f64,
    /// Optional start timestamp (RFC 3339 or epoch milliseconds).
    #[serde(default)]
    pub seek: Option<String>,
    #[serde(default = "default_statistics_frequency")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub statistics_frequency: Duration,
    #[serde(default)]
    pub adapt_time: AdaptTime,
    #[serde(default = "default_min_sleep")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_sleep: Duration,
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speedup: default_speedup(),
            seek: None,
            statistics_frequency: default_statistics_frequency(),
            adapt_time: AdaptTime::Original,
            min_sleep: default_min_sleep(),
            max_outstanding: default_max_outstanding(),
        }
    }
}

impl ReplayConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.speedup.is_finite() || self.speedup <= 0.0 {
            return Err(ConfigError::InvalidSpeedup(self.speedup));
        }
        if self.statistics_frequency.is_zero() {
            return Err(ConfigError::Zero {
                field: "statistics_frequency",
            });
        }
        if self.max_outstanding == 0 {
            return Err(ConfigError::Zero {
                field: "max_outstanding",
            });
        }
        self.seek_millis()?;
        Ok(())
    }

    /// Parsed seek target in epoch milliseconds.
    pub fn seek_millis(&self) -> std::result::Result<Option<i64>, ConfigError> {
        self.seek.as_deref().map(parse_timestamp).transpose()
    }
}

/// Watermark emission cadence.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    #[serde(default = "default_watermark_enabled")]
    pub enabled: bool,
    #[serde(default = "default_watermark_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde(default = "default_watermark_event_threshold")]
    pub event_threshold: u64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            enabled: default_watermark_enabled(),
            interval: default_watermark_interval(),
            event_threshold: default_watermark_event_threshold(),
        }
    }
}

impl WatermarkConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.event_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "watermark.event_threshold",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_reference_replay() {
        let config = AppConfig::default();
        assert_eq!(config.replay.speedup, 6480.0);
        assert_eq!(config.replay.max_outstanding, 50_000);
        assert_eq!(config.replay.min_sleep, Duration::from_millis(5));
        assert_eq!(config.watermark.interval, Duration::from_millis(5_000));
        assert_eq!(config.watermark.event_threshold, 100_000);
        assert_eq!(config.sink.stream, "taxi-trip-events");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let config: AppConfig = r#"
            [replay]
            speedup = 60.0
            statistics_frequency = 1000
            adapt_time = "invocation"
            seek = "2016-01-01T00:00:00Z"

            [watermark]
            enabled = false
        "#
        .parse()
        .unwrap();
        assert_eq!(config.replay.speedup, 60.0);
        assert_eq!(config.replay.adapt_time, AdaptTime::Invocation);
        assert_eq!(
            config.replay.statistics_frequency,
            Duration::from_millis(1000)
        );
        assert_eq!(config.replay.seek_millis().unwrap(), Some(1_451_606_400_000));
        assert!(!config.watermark.enabled);
        assert_eq!(config.watermark.event_threshold, 100_000);
    }

    #[test]
    fn rejects_non_positive_speedup() {
        let mut config = AppConfig::default();
        config.replay.speedup = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSpeedup(0.0)));
        config.replay.speedup = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSpeedup(_))
        ));
    }

    #[test]
    fn rejects_zero_capacity_and_shards() {
        let mut config = AppConfig::default();
        config.replay.max_outstanding = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_outstanding"
            })
        );

        let mut config = AppConfig::default();
        config.sink.shards = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero { field: "shards" })
        );
    }

    #[test]
    fn rejects_bad_seek() {
        let mut config = AppConfig::default();
        config.replay.seek = Some("yesterday".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn adapt_time_from_str_is_case_insensitive() {
        assert_eq!("INGESTION".parse::<AdaptTime>(), Ok(AdaptTime::Ingestion));
        assert_eq!(
            "later".parse::<AdaptTime>(),
            Err(ConfigError::UnknownAdaptTime("later".into()))
        );
    }

    #[test]
    fn load_reads_first_existing_candidate() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[sink]\nstream = \"replayed\"\nshards = 2")?;
        file.flush()?;
        let missing = PathBuf::from("does/not/exist.toml");
        let loaded =
            AppConfig::load_with_source(&[missing, file.path().to_path_buf()])?;
        assert_eq!(loaded.config.sink.stream, "replayed");
        assert_eq!(loaded.config.sink.shards, 2);
        assert_eq!(loaded.source.as_deref(), Some(file.path()));
        Ok(())
    }
}
