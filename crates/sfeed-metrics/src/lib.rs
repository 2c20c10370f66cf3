//! ---
//! sfeed_section: "04-observability"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Metrics collection and export utilities."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render every metric family in the text exposition format.
pub fn encode_registry(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    match encode_registry(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address (resolves port 0 to the assigned port).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "sfeedd_starts_total",
            "Total number of times the replay daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sfeedd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new("sfeedd_build_info", "Build metadata for the running binary"),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

/// Replay progress, labelled by destination stream.
///
/// Counters are updated from completion callbacks as well as the producer, so
/// every handle here is safe to share across threads.
#[derive(Clone, Debug)]
pub struct ReplayMetrics {
    dispatched: IntCounter,
    failures: IntCounter,
    outstanding: IntGauge,
    watermark: IntGauge,
    replay_lag: Gauge,
    watermarks_emitted: IntCounter,
}

impl ReplayMetrics {
    pub fn new(registry: &Registry, stream: &str) -> Result<Self> {
        let dispatched = IntCounterVec::new(
            Opts::new(
                "sfeed_events_dispatched_total",
                "Events handed to the sink client",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(dispatched.clone()))?;

        let failures = IntCounterVec::new(
            Opts::new(
                "sfeed_dispatch_failures_total",
                "Dispatches the sink client reported as failed",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(failures.clone()))?;

        let outstanding = IntGaugeVec::new(
            Opts::new(
                "sfeed_outstanding_dispatches",
                "Dispatches waiting for a completion",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(outstanding.clone()))?;

        let watermark = IntGaugeVec::new(
            Opts::new("sfeed_watermark_ms", "Last emitted watermark in epoch ms"),
            &["stream"],
        )?;
        registry.register(Box::new(watermark.clone()))?;

        let replay_lag = GaugeVec::new(
            Opts::new(
                "sfeed_replay_lag_seconds",
                "Wall-clock distance between scaled logical time and the replay position",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(replay_lag.clone()))?;

        let watermarks_emitted = IntCounterVec::new(
            Opts::new(
                "sfeed_watermarks_emitted_total",
                "Watermark markers broadcast to the stream",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(watermarks_emitted.clone()))?;

        Ok(Self {
            dispatched: dispatched.with_label_values(&[stream]),
            failures: failures.with_label_values(&[stream]),
            outstanding: outstanding.with_label_values(&[stream]),
            watermark: watermark.with_label_values(&[stream]),
            replay_lag: replay_lag.with_label_values(&[stream]),
            watermarks_emitted: watermarks_emitted.with_label_values(&[stream]),
        })
    }

    pub fn record_dispatch(&self) {
        self.dispatched.inc();
    }

    pub fn record_failure(&self) {
        self.failures.inc();
    }

    pub fn set_outstanding(&self, outstanding: usize) {
        self.outstanding.set(outstanding as i64);
    }

    pub fn record_watermark(&self, value: i64) {
        self.watermark.set(value);
        self.watermarks_emitted.inc();
    }

    pub fn set_replay_lag(&self, seconds: f64) {
        self.replay_lag.set(seconds);
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_metrics_are_exported_per_stream() {
        let registry = new_registry();
        let metrics = ReplayMetrics::new(&registry, "trips").unwrap();
        metrics.record_dispatch();
        metrics.record_dispatch();
        metrics.record_failure();
        metrics.set_outstanding(7);
        metrics.record_watermark(1_000);
        metrics.set_replay_lag(1.5);

        let body = encode_registry(&registry).unwrap();
        assert!(body.contains(r#"sfeed_events_dispatched_total{stream="trips"} 2"#));
        assert!(body.contains(r#"sfeed_dispatch_failures_total{stream="trips"} 1"#));
        assert!(body.contains(r#"sfeed_outstanding_dispatches{stream="trips"} 7"#));
        assert!(body.contains(r#"sfeed_watermark_ms{stream="trips"} 1000"#));
        assert!(body.contains(r#"sfeed_watermarks_emitted_total{stream="trips"} 1"#));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        ReplayMetrics::new(&registry, "a").unwrap();
        assert!(ReplayMetrics::new(&registry, "b").is_err());
    }

    #[test]
    fn daemon_metrics_record_build_info() {
        let metrics = DaemonMetrics::new(new_registry()).unwrap();
        metrics.inc_start();
        metrics.observe_config_load(0.01);
        metrics.set_build_info("0.1.0", "debug");
        let body = encode_registry(&metrics.registry()).unwrap();
        assert!(body.contains("sfeedd_starts_total 1"));
        assert!(body.contains(r#"sfeedd_build_info{profile="debug",version="0.1.0"} 1"#));
    }

    #[tokio::test]
    async fn http_server_binds_and_shuts_down() {
        let server = spawn_http_server(new_registry(), "127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await.unwrap();
    }
}
