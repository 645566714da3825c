//! Structured logging and Prometheus metrics: plain `tracing-subscriber`
//! output plus a `prometheus::Registry` exposed at `/metrics` (see
//! DESIGN.md for why no OTLP exporter pipeline is carried here).

use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry as TracingRegistry};

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hub_server=info,tower_http=info"));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false);

    TracingRegistry::default().with(env_filter).with(fmt_layer).init();
}

pub struct Metrics {
    pub registry: Registry,
    pub http_requests: IntCounterVec,
    pub http_duration: HistogramVec,
    pub websocket_connections: IntGauge,
    pub agent_connections: IntGauge,
    pub commands_routed: IntCounterVec,
    pub terminal_bytes_flushed: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            prometheus::Opts::new("hub_http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )
        .expect("metric registration");
        let http_duration = HistogramVec::new(
            prometheus::HistogramOpts::new("hub_http_request_duration_seconds", "HTTP request duration"),
            &["method", "path"],
        )
        .expect("metric registration");
        let websocket_connections =
            IntGauge::new("hub_websocket_connections", "Live WebSocket connections").expect("metric registration");
        let agent_connections =
            IntGauge::new("hub_agent_connections", "Authenticated agent connections").expect("metric registration");
        let commands_routed = IntCounterVec::new(
            prometheus::Opts::new("hub_commands_routed_total", "Commands routed by outcome"),
            &["outcome"],
        )
        .expect("metric registration");
        let terminal_bytes_flushed = IntCounterVec::new(
            prometheus::Opts::new("hub_terminal_bytes_flushed_total", "Terminal output bytes flushed to dashboards"),
            &["elided"],
        )
        .expect("metric registration");

        registry.register(Box::new(http_requests.clone())).expect("metric registration");
        registry.register(Box::new(http_duration.clone())).expect("metric registration");
        registry.register(Box::new(websocket_connections.clone())).expect("metric registration");
        registry.register(Box::new(agent_connections.clone())).expect("metric registration");
        registry.register(Box::new(commands_routed.clone())).expect("metric registration");
        registry.register(Box::new(terminal_bytes_flushed.clone())).expect("metric registration");

        Metrics {
            registry,
            http_requests,
            http_duration,
            websocket_connections,
            agent_connections,
            commands_routed,
            terminal_bytes_flushed,
        }
    })
}

pub fn metrics() -> &'static Metrics {
    METRICS.get().expect("metrics not initialized")
}

pub fn render_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let families = metrics().registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub async fn trace_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_string(), |p| p.as_str().to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics().http_requests.with_label_values(&[&method, &path, &status]).inc();
    metrics()
        .http_duration
        .with_label_values(&[&method, &path])
        .observe(start.elapsed().as_secs_f64());

    response
}
