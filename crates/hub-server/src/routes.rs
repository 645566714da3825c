//! HTTP and WebSocket route wiring.

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::health::{health, system_health};
use crate::state::AppState;
use crate::telemetry::{render_metrics, trace_middleware};
use crate::websocket::{agent_handler, dashboard_handler};

async fn metrics_endpoint() -> String {
    render_metrics().unwrap_or_else(|err| format!("# failed to render metrics: {err}\n"))
}

#[must_use]
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/system/health", get(system_health))
        .route("/metrics", get(metrics_endpoint))
        .route("/ws/agent", get(agent_handler::upgrade))
        .route("/ws/dashboard", get(dashboard_handler::upgrade))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(trace_middleware))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
