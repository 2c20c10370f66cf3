//! ---
//! sfeed_section: "06-daemon"
//! sfeed_subsection: "binary"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Binary entrypoint for the sfeed replay daemon."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use sfeed_common::config::{AdaptTime, AppConfig};
use sfeed_common::logging::init_tracing;
use sfeed_messaging::{InMemorySink, SinkClient};
use sfeed_metrics::prometheus::Registry;
use sfeed_metrics::{new_registry, spawn_http_server, DaemonMetrics, ReplayMetrics};
use sfeed_persistence::{FileStreamSink, SegmentedLogSource, StreamOptions};
use sfeed_replay::{EngineConfig, ReplayEngine, ReplayReport};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "configs/sfeedd.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Replays a timestamp-ordered event log into an append-only stream",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[arg(long, help = "Region of the destination stream")]
    region: Option<String>,

    #[arg(long, value_name = "DIR", help = "Root directory of the event log")]
    bucket: Option<PathBuf>,

    #[arg(long, help = "Only replay log segments whose path starts with this prefix")]
    prefix: Option<String>,

    #[arg(long, help = "Name of the destination stream")]
    stream: Option<String>,

    #[arg(long, help = "Speed-up factor relative to logical time")]
    speedup: Option<f64>,

    #[arg(long, help = "Pack several events into one stream record")]
    aggregate: bool,

    #[arg(long, value_name = "TIMESTAMP", help = "Start at the first event at or after this time (RFC 3339 or epoch ms)")]
    seek: Option<String>,

    #[arg(long = "statisticsFrequency", value_name = "MS", help = "Interval between progress lines")]
    statistics_frequency: Option<u64>,

    #[arg(long = "adaptTime", value_enum, help = "Rewrite outbound event timestamps")]
    adapt_time: Option<CliAdaptTime>,

    #[arg(long = "noWatermark", help = "Do not emit watermark markers")]
    no_watermark: bool,

    #[arg(long, value_name = "DIR", help = "Directory the stream shards are written to")]
    output: Option<PathBuf>,

    #[arg(long, help = "Number of stream shards")]
    shards: Option<usize>,

    #[arg(long = "dryRun", help = "Deliver to an in-memory sink instead of the output directory")]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliAdaptTime {
    Original,
    Invocation,
    Ingestion,
}

impl From<CliAdaptTime> for AdaptTime {
    fn from(value: CliAdaptTime) -> Self {
        match value {
            CliAdaptTime::Original => AdaptTime::Original,
            CliAdaptTime::Invocation => AdaptTime::Invocation,
            CliAdaptTime::Ingestion => AdaptTime::Ingestion,
        }
    }
}

impl Cli {
    /// Flags given on the command line win over the configuration file.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(region) = &self.region {
            config.sink.region = region.clone();
        }
        if let Some(bucket) = &self.bucket {
            config.source.root = bucket.clone();
        }
        if let Some(prefix) = &self.prefix {
            config.source.prefix = prefix.clone();
        }
        if let Some(stream) = &self.stream {
            config.sink.stream = stream.clone();
        }
        if let Some(speedup) = self.speedup {
            config.replay.speedup = speedup;
        }
        if self.aggregate {
            config.sink.aggregate = true;
        }
        if let Some(seek) = &self.seek {
            config.replay.seek = Some(seek.clone());
        }
        if let Some(frequency) = self.statistics_frequency {
            config.replay.statistics_frequency = Duration::from_millis(frequency);
        }
        if let Some(adapt_time) = self.adapt_time {
            config.replay.adapt_time = adapt_time.into();
        }
        if self.no_watermark {
            config.watermark.enabled = false;
        }
        if let Some(output) = &self.output {
            config.sink.output_dir = output.clone();
        }
        if let Some(shards) = self.shards {
            config.sink.shards = shards;
        }
        if self.dry_run {
            config.sink.dry_run = true;
        }
    }
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("sfeedd {} ({})", env!("CARGO_PKG_VERSION"), build_profile());
        return Ok(());
    }
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));

    let load_started = Instant::now();
    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let mut config = loaded_config.config;
    cli.apply(&mut config);
    config.validate().context("invalid replay configuration")?;

    init_tracing("sfeedd", &config.logging)?;
    info!(
        config_path = ?loaded_config.source,
        region = %config.sink.region,
        stream = %config.sink.stream,
        "configuration loaded"
    );

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), build_profile());

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(metrics_registry.clone(), config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let outcome = run_replay(&config, &metrics_registry).await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    let report = outcome?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_replay(config: &AppConfig, registry: &Registry) -> Result<ReplayReport> {
    let source = SegmentedLogSource::open(&config.source.root, &config.source.prefix)
        .with_context(|| {
            format!(
                "failed to open event log under {} with prefix '{}'",
                config.source.root.display(),
                config.source.prefix
            )
        })?;

    let sink: Arc<dyn SinkClient> = if config.sink.dry_run {
        info!(shards = config.sink.shards, "dry run; delivering to an in-memory sink");
        Arc::new(InMemorySink::new(config.sink.shards))
    } else {
        let options = StreamOptions {
            shards: config.sink.shards,
            aggregate: config.sink.aggregate,
            max_aggregate: config.sink.max_aggregate,
        };
        let sink = FileStreamSink::open(&config.sink.output_dir, &config.sink.stream, options)
            .with_context(|| {
                format!(
                    "failed to open stream {} under {}",
                    config.sink.stream,
                    config.sink.output_dir.display()
                )
            })?;
        info!(directory = %sink.directory().display(), "writing stream shards");
        Arc::new(sink)
    };

    let metrics = ReplayMetrics::new(registry, &config.sink.stream)?;
    let mut engine = ReplayEngine::new(EngineConfig::from_app(config), source, sink)?
        .with_metrics(metrics);
    if let Some(seek) = config.replay.seek_millis()? {
        engine.seek(seek)?;
    }

    tokio::select! {
        report = engine.run() => Ok(report?),
        interrupted = signal::ctrl_c() => {
            interrupted.context("failed to listen for ctrl-c")?;
            warn!("ctrl-c received; abandoning replay");
            bail!("replay interrupted before the event log was exhausted")
        }
    }
}
