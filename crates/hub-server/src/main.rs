//! Binary entry point: wires configuration, persistence, the hub's
//! in-memory components, and the HTTP/WebSocket router, then serves until
//! a shutdown signal triggers a best-effort drain.

use std::sync::Arc;
use std::time::Instant;

use hub_server::auth::{JwtTokenVerifier, TokenVerifier};
use hub_server::config::Config;
use hub_server::database::Database;
use hub_server::hub::{
    CommandTracker, ConnectionRegistry, HeartbeatManager, HubEvent, MessageRouter, OfflineQueue, TerminalStreamConfig,
    TerminalStreamManager, TokenManager,
};
use hub_server::repositories::{AgentRepo, AuditRepo, CommandRepo, PgAgentRepo, PgAuditRepo, PgCommandRepo};
use hub_server::telemetry;
use hub_server::{create_app, AppState};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();
    telemetry::init_metrics();

    let config = Arc::new(Config::from_env()?);
    let database = Database::new(&config.database_url).await?;

    let agent_repo: Arc<dyn AgentRepo> = Arc::new(PgAgentRepo::new(database.pool().clone()));
    let command_repo: Arc<dyn CommandRepo> = Arc::new(PgCommandRepo::new(database.pool().clone()));
    let audit_repo: Arc<dyn AuditRepo> = Arc::new(PgAuditRepo::new(database.pool().clone()));
    let token_verifier: Arc<dyn TokenVerifier> = Arc::new(JwtTokenVerifier::new(config.jwt_secret.clone()));

    let registry = ConnectionRegistry::new();
    let command_tracker = CommandTracker::new();
    let offline_queue = OfflineQueue::new(config.queue_max, config.queue_ttl);
    let terminal_streams = TerminalStreamManager::new(
        registry.clone(),
        TerminalStreamConfig {
            buffer_bytes: config.buffer_bytes,
            buffer_lines: config.buffer_lines,
            flush_interval: config.flush_interval,
            send_high_water: config.send_high_water,
            send_low_water: config.send_low_water,
            linger: config.linger,
            session_max_age: config.session_max_age,
        },
    );

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel::<HubEvent>();
    let heartbeat = HeartbeatManager::new(registry.clone(), events_tx.clone(), config.ping_interval, config.max_missed);
    let token_manager = TokenManager::new(token_verifier.clone(), events_tx, config.refresh_lead);

    let router = MessageRouter::new(
        registry.clone(),
        command_tracker.clone(),
        offline_queue.clone(),
        terminal_streams.clone(),
        agent_repo.clone(),
        command_repo.clone(),
        audit_repo.clone(),
    );

    let shutdown = CancellationToken::new();
    let state = AppState {
        config: config.clone(),
        database,
        registry: registry.clone(),
        command_tracker: command_tracker.clone(),
        offline_queue: offline_queue.clone(),
        terminal_streams: terminal_streams.clone(),
        heartbeat,
        token_manager,
        router,
        token_verifier,
        agent_repo,
        command_repo,
        audit_repo,
        started_at: Instant::now(),
        shutdown: shutdown.clone(),
    };

    offline_queue.spawn_sweeper(config.queue_ttl);
    command_tracker.spawn_sweeper(config.command_track_ttl, std::time::Duration::from_secs(60));
    terminal_streams.spawn_background_tasks(std::time::Duration::from_secs(30));
    spawn_event_consumer(events_rx, state.registry.clone(), state.token_manager.clone(), state.audit_repo.clone());

    let app = create_app(state.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "hub-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

fn spawn_event_consumer(
    mut events: tokio::sync::mpsc::UnboundedReceiver<HubEvent>,
    registry: ConnectionRegistry,
    token_manager: TokenManager,
    audit_repo: Arc<dyn hub_server::repositories::AuditRepo>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                HubEvent::TokenRefreshed { connection_id, new_token, new_expiry } => {
                    let payload = hub_shared::protocol::Envelope::new(
                        uuid::Uuid::new_v4().to_string(),
                        hub_shared::protocol::AgentOutbound::TokenRefresh { token: new_token, expires_at: new_expiry },
                    );
                    if let Ok(json) = serde_json::to_string(&payload) {
                        let _ = registry.send_to_connection(connection_id, json).await;
                    }
                }
                HubEvent::TokenExpired { connection_id } | HubEvent::ConnectionTimeout { connection_id } => {
                    warn!(%connection_id, "closing connection due to token expiry or heartbeat timeout");
                    token_manager.unregister(connection_id).await;
                    registry.close(connection_id).await;
                    let _ = audit_repo
                        .log_event(hub_shared::AuditEvent::new(
                            "connection_closed",
                            serde_json::json!({ "connectionId": connection_id }),
                        ))
                        .await;
                }
                HubEvent::AgentSuperseded { connection_id } => {
                    registry.close(connection_id).await;
                }
            }
        }
    });
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, draining connections");
    state.shutdown.cancel();

    let shutdown_frame = serde_json::to_string(&hub_shared::protocol::Envelope::new(
        uuid::Uuid::new_v4().to_string(),
        hub_shared::protocol::DashboardOutbound::ServerShutdown,
    ))
    .unwrap_or_default();
    state.registry.broadcast_to_dashboards(shutdown_frame).await;
    state.terminal_streams.flush_all().await;

    let agent_ids = state.registry.iterate_agents().await;
    for agent_id in &agent_ids {
        if let Some(connection_id) = state.registry.find_by_agent(*agent_id).await {
            state.registry.close(connection_id).await;
        }
    }

    tokio::time::sleep(state.config.shutdown_deadline).await;
    info!("shutdown deadline elapsed, forcing close");
}
