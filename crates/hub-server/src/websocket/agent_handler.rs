//! Agent-facing connection lifecycle: `OPEN -> AWAIT_AUTH -> AUTHENTICATED
//! -> CLOSING -> CLOSED`. An agent gets `AUTH_GRACE` to send `AGENT_CONNECT`
//! before the socket is dropped. A dedicated handler per role, since agent
//! and dashboard sessions speak disjoint message vocabularies.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hub_shared::protocol::{AgentInbound, AgentOutbound, AckPayload, Envelope, ErrorPayload, PongPayload};
use hub_shared::{ErrorCode, HubError, TerminalLine};

use crate::state::AppState;
use crate::websocket::run_writer;

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_error(tx: &tokio::sync::mpsc::UnboundedSender<String>, code: ErrorCode, message: &str) {
    let envelope = Envelope::new(Uuid::new_v4().to_string(), AgentOutbound::Error(ErrorPayload::new(code, message)));
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
        debug!(%connection_id, "agent connection dropped before AGENT_CONNECT");
        cancel.cancel();
        let _ = writer.await;
        return;
    };

    let Ok(envelope) = serde_json::from_str::<Envelope<AgentInbound>>(&text) else {
        send_error(&tx, ErrorCode::InvalidMessage, "could not parse AGENT_CONNECT").await;
        cancel.cancel();
        let _ = writer.await;
        return;
    };

    let AgentInbound::AgentConnect { agent_id, token } = envelope.body else {
        send_error(&tx, ErrorCode::InvalidMessageType, "expected AGENT_CONNECT").await;
        cancel.cancel();
        let _ = writer.await;
        return;
    };

    let verified = match state.token_verifier.verify(&token).await {
        Ok(v) if v.principal_id == agent_id => v,
        Ok(_) => {
            send_error(&tx, ErrorCode::Unauthorized, "token does not match agent id").await;
            cancel.cancel();
            let _ = writer.await;
            return;
        }
        Err(err) => {
            send_error(&tx, ErrorCode::from(&err), "token verification failed").await;
            cancel.cancel();
            let _ = writer.await;
            return;
        }
    };

    if state.agent_repo.get(agent_id).await.ok().flatten().is_none() {
        send_error(&tx, ErrorCode::UnknownAgent, "agent is not registered with this hub").await;
        cancel.cancel();
        let _ = writer.await;
        return;
    }

    if let Some(evicted) = state.registry.bind_agent(connection_id, agent_id, tx.clone(), cancel.clone()).await {
        info!(%agent_id, %evicted, "agent reconnected, superseding prior connection");
        state.router.handle_superseded_connection(evicted, agent_id).await;
    }

    let _ = state.agent_repo.set_connected(agent_id).await;
    state.token_manager.register_token(connection_id, verified.expires_at, verified.refresh_token).await;
    state.heartbeat.monitor(connection_id).await;
    state.router.drain_offline_queue(agent_id, connection_id).await;
    state.router.announce_agent_connected(agent_id).await;

    let ack = Envelope::new(envelope.id, AgentOutbound::Ack(AckPayload { acknowledged_id: Uuid::new_v4().to_string() }));
    if let Ok(json) = serde_json::to_string(&ack) {
        let _ = tx.send(json);
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = dispatch(&state, agent_id, connection_id, &text).await {
                            warn!(%connection_id, %err, "failed to dispatch agent message");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%connection_id, %err, "agent socket error");
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
    let _ = state.agent_repo.set_disconnected(agent_id).await;
    state.router.announce_agent_disconnected(agent_id).await;
}

async fn dispatch(state: &AppState, agent_id: Uuid, connection_id: Uuid, text: &str) -> Result<(), HubError> {
    let envelope: Envelope<AgentInbound> =
        serde_json::from_str(text).map_err(|e| HubError::InvalidMessage(e.to_string()))?;

    match envelope.body {
        AgentInbound::AgentConnect { .. } => {
            return Err(HubError::InvalidMessageType);
        }
        AgentInbound::AgentHeartbeat { status: _ } => {
            state.agent_repo.update_heartbeat(agent_id).await?;
        }
        AgentInbound::AgentError { message, details } => {
            warn!(%agent_id, %message, ?details, "agent reported an error");
        }
        AgentInbound::CommandAck { command_id } => {
            debug!(%agent_id, %command_id, "command acknowledged by agent");
            state.router.route_command_status(command_id, hub_shared::CommandStatus::Executing, None).await;
        }
        AgentInbound::CommandComplete { command_id, status, result } => {
            state.router.route_command_complete(command_id, agent_id, status, result).await;
        }
        AgentInbound::TerminalOutput { command_id, content, stream, ansi } => {
            let line = TerminalLine { content, stream, sequence: 0, timestamp: Utc::now(), ansi };
            state.router.route_terminal_output(command_id, agent_id, line).await;
        }
        AgentInbound::TraceEvent { command_id, event } => {
            state.router.route_trace_event(command_id, agent_id, event).await;
        }
        AgentInbound::InvestigationReport { command_id, report } => {
            state.command_repo.create_investigation_report(command_id, report).await?;
        }
        AgentInbound::Ping(payload) => {
            let pong = Envelope::new(Uuid::new_v4().to_string(), AgentOutbound::Pong(PongPayload { echoed_timestamp: payload.timestamp }));
            if let Ok(json) = serde_json::to_string(&pong) {
                state.registry.send_to_connection(connection_id, json).await?;
            }
        }
        AgentInbound::Pong(payload) => {
            state.heartbeat.record_pong(connection_id, payload.echoed_timestamp).await;
        }
    }
    Ok(())
}
