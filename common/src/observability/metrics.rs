//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. The player owns its registry
//! and controls which metrics it reports.

use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration for the built-in Prometheus scrape endpoint.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    // ---
    /// Address to bind, e.g. `127.0.0.1:9100`.
    pub bind: SocketAddr,
}

impl MetricsServerConfig {
    // ---
    pub fn new(bind: SocketAddr) -> Self {
        // ---
        Self { bind }
    }
}

/// Prometheus metrics registry + handles.
///
/// This is a thin, explicit wrapper around the `prometheus` crate so hot-path
/// instrumentation is just counter increments / histogram observations.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Media counters
    pub chunks_received_total: IntCounter,
    pub chunks_late_total: IntCounter,
    pub chunks_duplicate_total: IntCounter,
    pub chunks_dropped_total: IntCounter,

    // Clock sync counters
    pub probes_sent_total: IntCounter,
    pub probe_responses_total: IntCounter,

    // Session counters
    pub reconnects_total: IntCounter,

    // Buffer / clock gauges
    pub jitter_buffer_occupancy_chunks: IntGauge,
    pub buffer_ahead_ms: IntGauge,
    pub clock_offset_us: Gauge,
    pub clock_error_us: Gauge,

    // Latency histograms (seconds)
    pub decode_seconds: Histogram,
    pub probe_rtt_seconds: Histogram,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("sendspin".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let chunks_received_total = IntCounter::with_opts(Opts::new(
            "chunks_received_total",
            "Total media chunks received",
        ))?;
        let chunks_late_total = IntCounter::with_opts(Opts::new(
            "chunks_late_total",
            "Total media chunks that missed their playout deadline",
        ))?;
        let chunks_duplicate_total = IntCounter::with_opts(Opts::new(
            "chunks_duplicate_total",
            "Total media chunks dropped as duplicate presentation timestamps",
        ))?;
        let chunks_dropped_total = IntCounter::with_opts(Opts::new(
            "chunks_dropped_total",
            "Total media chunks dropped for decode or format errors",
        ))?;

        let probes_sent_total =
            IntCounter::with_opts(Opts::new("probes_sent_total", "Total time probes sent"))?;
        let probe_responses_total = IntCounter::with_opts(Opts::new(
            "probe_responses_total",
            "Total time probe responses applied to the clock filter",
        ))?;

        let reconnects_total = IntCounter::with_opts(Opts::new(
            "reconnects_total",
            "Total reconnection attempts after a transport error",
        ))?;

        let jitter_buffer_occupancy_chunks = IntGauge::with_opts(Opts::new(
            "jitter_buffer_occupancy_chunks",
            "Current jitter buffer occupancy in chunks",
        ))?;
        let buffer_ahead_ms = IntGauge::with_opts(Opts::new(
            "buffer_ahead_ms",
            "Milliseconds of audio buffered ahead of the playout point",
        ))?;
        let clock_offset_us = Gauge::with_opts(Opts::new(
            "clock_offset_us",
            "Estimated server-minus-client clock offset in microseconds",
        ))?;
        let clock_error_us = Gauge::with_opts(Opts::new(
            "clock_error_us",
            "Estimated clock offset standard error in microseconds",
        ))?;

        let decode_seconds = Histogram::with_opts(HistogramOpts::new(
            "decode_seconds",
            "Chunk decode duration in seconds",
        ))?;
        let probe_rtt_seconds = Histogram::with_opts(HistogramOpts::new(
            "probe_rtt_seconds",
            "Time probe round-trip time in seconds",
        ))?;

        // Register all metrics
        registry.register(Box::new(chunks_received_total.clone()))?;
        registry.register(Box::new(chunks_late_total.clone()))?;
        registry.register(Box::new(chunks_duplicate_total.clone()))?;
        registry.register(Box::new(chunks_dropped_total.clone()))?;
        registry.register(Box::new(probes_sent_total.clone()))?;
        registry.register(Box::new(probe_responses_total.clone()))?;
        registry.register(Box::new(reconnects_total.clone()))?;
        registry.register(Box::new(jitter_buffer_occupancy_chunks.clone()))?;
        registry.register(Box::new(buffer_ahead_ms.clone()))?;
        registry.register(Box::new(clock_offset_us.clone()))?;
        registry.register(Box::new(clock_error_us.clone()))?;
        registry.register(Box::new(decode_seconds.clone()))?;
        registry.register(Box::new(probe_rtt_seconds.clone()))?;

        Ok(Self {
            registry,
            chunks_received_total,
            chunks_late_total,
            chunks_duplicate_total,
            chunks_dropped_total,
            probes_sent_total,
            probe_responses_total,
            reconnects_total,
            jitter_buffer_occupancy_chunks,
            buffer_ahead_ms,
            clock_offset_us,
            clock_error_us,
            decode_seconds,
            probe_rtt_seconds,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Spawns a minimal HTTP server that serves `GET /metrics`.
    ///
    /// This is intentionally explicit (callers decide whether to run it).
    pub fn spawn_metrics_server(&self, cfg: MetricsServerConfig) -> JoinHandle<Result<()>> {
        // ---
        let registry = Arc::new(self.registry.clone());
        tokio::spawn(async move {
            // ---
            let make_svc = make_service_fn(move |_conn| {
                let registry = Arc::clone(&registry);
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let registry = Arc::clone(&registry);
                        async move { handle_metrics_request(req, registry).await }
                    }))
                }
            });

            let server = Server::bind(&cfg.bind).serve(make_svc);
            server.await.map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
    }
}

async fn handle_metrics_request(
    req: Request<Body>,
    registry: Arc<Registry>,
) -> Result<Response<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                let mut resp = Response::new(Body::from(format!("encode error: {e}")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(resp);
            }

            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(resp)
        }
        _ => {
            let mut resp = Response::new(Body::from("not found"));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Ok(resp)
        }
    }
}
