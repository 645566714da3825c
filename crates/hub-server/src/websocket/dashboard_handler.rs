//! Dashboard-facing connection lifecycle, mirroring
//! [`crate::websocket::agent_handler`] but keyed by `DASHBOARD_CONNECT`
//! and a `user_id` rather than an `agent_id`. A user may hold several
//! concurrent dashboard connections; none of them supersede each other.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use hub_shared::protocol::{DashboardInbound, DashboardOutbound, Envelope, ErrorPayload, PongPayload};
use hub_shared::{ErrorCode, HubError};

use crate::hub::ConnectionKind;
use crate::state::AppState;
use crate::websocket::run_writer;

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_error(tx: &tokio::sync::mpsc::UnboundedSender<String>, code: ErrorCode, message: &str) {
    let envelope = Envelope::new(Uuid::new_v4().to_string(), DashboardOutbound::Error(ErrorPayload::new(code, message)));
    if let Ok(json) = serde_json::to_string(&envelope) {
        let _ = tx.send(json);
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let (sink, mut stream) = socket.split();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(run_writer(sink, rx, state.registry.clone(), connection_id, cancel.clone()));

    let first = tokio::time::timeout(state.config.auth_grace, stream.next()).await;
    let Ok(Some(Ok(Message::Text(text)))) = first else {
        debug!(%connection_id, "dashboard connection dropped before DASHBOARD_CONNECT");
        cancel.cancel();
        let _ = writer.await;
        return;
    };

    let Ok(envelope) = serde_json::from_str::<Envelope<DashboardInbound>>(&text) else {
        send_error(&tx, ErrorCode::InvalidMessage, "could not parse DASHBOARD_CONNECT").await;
        cancel.cancel();
        let _ = writer.await;
        return;
    };

    let DashboardInbound::DashboardConnect { token } = envelope.body else {
        send_error(&tx, ErrorCode::InvalidMessageType, "expected DASHBOARD_CONNECT").await;
        cancel.cancel();
        let _ = writer.await;
        return;
    };

    let verified = match state.token_verifier.verify(&token).await {
        Ok(v) => v,
        Err(err) => {
            send_error(&tx, ErrorCode::from(&err), "token verification failed").await;
            cancel.cancel();
            let _ = writer.await;
            return;
        }
    };
    let user_id = verified.principal_id;

    state
        .registry
        .add(connection_id, ConnectionKind::Dashboard { user_id }, tx.clone(), cancel.clone())
        .await;
    state.token_manager.register_token(connection_id, verified.expires_at, verified.refresh_token).await;
    state.heartbeat.monitor(connection_id).await;

    let ack = Envelope::new(
        envelope.id,
        DashboardOutbound::ConnectionAck {
            connection_id,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            features: vec!["terminal-stream".to_string(), "trace-stream".to_string(), "emergency-stop".to_string()],
        },
    );
    if let Ok(json) = serde_json::to_string(&ack) {
        let _ = tx.send(json);
    }

    let agent_ids = state.registry.iterate_agents().await;
    let mut agents = Vec::with_capacity(agent_ids.len());
    for agent_id in agent_ids {
        if let Ok(Some(agent)) = state.agent_repo.get(agent_id).await {
            agents.push(agent);
        }
    }
    let list = Envelope::new(Uuid::new_v4().to_string(), DashboardOutbound::AgentList { agents });
    if let Ok(json) = serde_json::to_string(&list) {
        let _ = tx.send(json);
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = dispatch(&state, user_id, connection_id, &text).await {
                            warn!(%connection_id, %err, "failed to dispatch dashboard message");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%connection_id, %err, "dashboard socket error");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = writer.await;
    state.registry.remove(connection_id).await;
    state.heartbeat.stop(connection_id).await;
    state.token_manager.unregister(connection_id).await;
    state.command_tracker.retire_all_from_connection(connection_id).await;
}

async fn dispatch(state: &AppState, user_id: Uuid, connection_id: Uuid, text: &str) -> Result<(), HubError> {
    let envelope: Envelope<DashboardInbound> =
        serde_json::from_str(text).map_err(|e| HubError::InvalidMessage(e.to_string()))?;

    match envelope.body {
        DashboardInbound::DashboardConnect { .. } => {
            return Err(HubError::InvalidMessageType);
        }
        DashboardInbound::CommandRequest { target_agents, broadcast, priority, payload } => {
            state.router.route_command_request(connection_id, user_id, target_agents, broadcast, priority, payload).await?;
        }
        DashboardInbound::CommandCancel { command_id } => {
            state.router.route_command_cancel(connection_id, command_id).await?;
        }
        DashboardInbound::EmergencyStop { reason } => {
            state.router.emergency_stop(reason).await;
            debug!(%connection_id, %user_id, "emergency stop issued by dashboard");
        }
        DashboardInbound::SubscribeTraces { command_id } => {
            debug!(%connection_id, %command_id, "dashboard subscribed to traces");
        }
        DashboardInbound::UnsubscribeTraces { command_id } => {
            debug!(%connection_id, %command_id, "dashboard unsubscribed from traces");
        }
        DashboardInbound::Ping(payload) => {
            let pong = Envelope::new(
                Uuid::new_v4().to_string(),
                DashboardOutbound::Pong(PongPayload { echoed_timestamp: payload.timestamp }),
            );
            if let Ok(json) = serde_json::to_string(&pong) {
                state.registry.send_to_connection(connection_id, json).await?;
            }
        }
        DashboardInbound::Pong(payload) => {
            state.heartbeat.record_pong(connection_id, payload.echoed_timestamp).await;
        }
    }
    Ok(())
}
