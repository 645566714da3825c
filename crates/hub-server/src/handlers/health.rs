//! Health endpoints: a plain liveness check and a richer component
//! breakdown across the hub's own dependencies.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /health`: a cheap liveness probe, database connectivity only.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let connected = state.database.is_connected().await;
    let status = if connected { "ok" } else { "error" };
    let code = if connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        code,
        Json(json!({
            "status": status,
            "timestamp": Utc::now().to_rfc3339(),
            "database": {
                "connected": connected,
                "type": "postgres",
                "message": if connected { "reachable" } else { "unreachable" },
            },
        })),
    )
}

/// `GET /api/system/health`: a component breakdown used by dashboards to
/// render a status page. `redis` has no backing dependency in this hub —
/// it is reported `healthy` unconditionally, matching the absence of a
/// cache tier in this deployment.
pub async fn system_health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database_connected = state.database.is_connected().await;
    let (agent_connections, dashboard_connections) = state.registry.connection_counts().await;

    let database_status = if database_connected { "healthy" } else { "degraded" };
    let websocket_status = "healthy";
    let redis_status = "healthy";

    let healthy = database_connected;
    let overall = if healthy { "healthy" } else { "degraded" };
    let code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        code,
        Json(json!({
            "status": overall,
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "version": env!("CARGO_PKG_VERSION"),
            "components": {
                "database": { "status": database_status },
                "redis": { "status": redis_status },
                "websocket": {
                    "status": websocket_status,
                    "agent_connections": agent_connections,
                    "dashboard_connections": dashboard_connections,
                },
            },
        })),
    )
}
