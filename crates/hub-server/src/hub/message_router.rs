//! MessageRouter: the authoritative routing policy for every validated
//! message kind. Connection handlers parse and authenticate frames; this
//! component decides who receives what, consulting C1/C4/C5/C6 and
//! persisting through the repository traits.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use hub_shared::protocol::{AgentOutbound, DashboardOutbound, Envelope, ErrorPayload};
use hub_shared::{AuditEvent, Command, CommandStatus, ErrorCode, HubError, TerminalLine};

use crate::hub::command_tracker::CommandTracker;
use crate::hub::connection_registry::ConnectionRegistry;
use crate::hub::offline_queue::OfflineQueue;
use crate::hub::terminal_stream::TerminalStreamManager;
use crate::repositories::{AgentRepo, AuditRepo, CommandRepo};

#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
    command_tracker: CommandTracker,
    offline_queue: OfflineQueue,
    terminal_streams: TerminalStreamManager,
    agent_repo: Arc<dyn AgentRepo>,
    command_repo: Arc<dyn CommandRepo>,
    audit_repo: Arc<dyn AuditRepo>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        registry: ConnectionRegistry,
        command_tracker: CommandTracker,
        offline_queue: OfflineQueue,
        terminal_streams: TerminalStreamManager,
        agent_repo: Arc<dyn AgentRepo>,
        command_repo: Arc<dyn CommandRepo>,
        audit_repo: Arc<dyn AuditRepo>,
    ) -> Self {
        Self { registry, command_tracker, offline_queue, terminal_streams, agent_repo, command_repo, audit_repo }
    }

    async fn send_to_dashboard(&self, connection_id: Uuid, payload: DashboardOutbound) {
        let envelope = Envelope::new(Uuid::new_v4().to_string(), payload);
        if let Ok(json) = serde_json::to_string(&envelope) {
            let _ = self.registry.send_to_connection(connection_id, json).await;
        }
    }

    async fn send_to_agent(&self, connection_id: Uuid, payload: AgentOutbound) {
        let envelope = Envelope::new(Uuid::new_v4().to_string(), payload);
        if let Ok(json) = serde_json::to_string(&envelope) {
            let _ = self.registry.send_to_connection(connection_id, json).await;
        }
    }

    /// Broadcasts `agentConnected`/`agentDisconnected` after C1 binding
    /// changes, and on AGENT_CONNECT snapshots C4/C5 state is untouched —
    /// this only handles the dashboard fan-out.
    pub async fn announce_agent_connected(&self, agent_id: Uuid) {
        let dashboards = self.registry.iterate_dashboards().await;
        for connection_id in dashboards {
            self.send_to_dashboard(connection_id, DashboardOutbound::AgentConnected { agent_id }).await;
        }
    }

    pub async fn announce_agent_disconnected(&self, agent_id: Uuid) {
        let dashboards = self.registry.iterate_dashboards().await;
        for connection_id in dashboards {
            self.send_to_dashboard(connection_id, DashboardOutbound::AgentDisconnected { agent_id }).await;
        }
        self.cancel_in_flight_for_agent(agent_id).await;
    }

    /// `COMMAND_REQUEST` from a dashboard: forwards to the agent if online,
    /// otherwise enqueues for delivery on reconnect. Always registers
    /// origin tracking and acknowledges the issuing dashboard.
    pub async fn route_command_request(
        &self,
        origin_connection_id: Uuid,
        issuer_user_id: Uuid,
        target_agents: Vec<Uuid>,
        broadcast: bool,
        priority: u8,
        payload: Value,
    ) -> Result<Command, HubError> {
        let now = Utc::now();
        let command = Command {
            command_id: Uuid::new_v4(),
            issuer_user_id,
            target_agents: target_agents.clone(),
            broadcast,
            priority,
            payload,
            status: CommandStatus::Pending,
            issued_at: now,
            updated_at: now,
        };
        let command = self.command_repo.create(command).await?;
        self.command_tracker.register(command.command_id, origin_connection_id).await;

        for agent_id in &target_agents {
            if self.registry.is_agent_online(*agent_id).await {
                self.command_repo.update_status(command.command_id, CommandStatus::Executing).await?;
                self.send_to_agent(
                    self.registry.find_by_agent(*agent_id).await.ok_or(HubError::UnknownAgent(*agent_id))?,
                    AgentOutbound::CommandRequest { command: command.clone() },
                )
                .await;
            } else {
                self.command_repo.update_status(command.command_id, CommandStatus::Queued).await?;
                self.offline_queue.enqueue(*agent_id, command.clone()).await;
            }
        }

        self.send_to_dashboard(origin_connection_id, DashboardOutbound::CommandQueued { command_id: command.command_id })
            .await;
        Ok(command)
    }

    /// Delivers everything queued for `agent_id`, highest priority first,
    /// and marks each as executing. Called right after an agent
    /// authenticates.
    pub async fn drain_offline_queue(&self, agent_id: Uuid, agent_connection_id: Uuid) {
        let drained = self.offline_queue.drain(agent_id).await;
        for command in drained {
            if self.command_repo.update_status(command.command_id, CommandStatus::Executing).await.is_err() {
                warn!(command_id = %command.command_id, "failed to persist executing status on drain");
            }
            if let Some(origin) = self.command_tracker.origin(command.command_id).await {
                self.send_to_dashboard(
                    origin,
                    DashboardOutbound::CommandStatus { command_id: command.command_id, status: CommandStatus::Executing, result: None },
                )
                .await;
            }
            self.send_to_agent(agent_connection_id, AgentOutbound::CommandRequest { command }).await;
        }
    }

    /// `COMMAND_CANCEL` from a dashboard. Only the origin connection may
    /// cancel; anyone else is rejected to preserve cross-user isolation.
    pub async fn route_command_cancel(&self, requesting_connection_id: Uuid, command_id: Uuid) -> Result<(), HubError> {
        let Some(origin) = self.command_tracker.origin(command_id).await else {
            return Err(HubError::Validation("no tracking entry for command".to_string()));
        };
        if origin != requesting_connection_id {
            return Err(HubError::Unauthorized);
        }

        self.command_repo.update_status(command_id, CommandStatus::Cancelled).await?;
        self.command_tracker.retire(command_id).await;
        self.send_to_dashboard(
            origin,
            DashboardOutbound::CommandStatus { command_id, status: CommandStatus::Cancelled, result: None },
        )
        .await;
        Ok(())
    }

    /// `COMMAND_ACK` / `COMMAND_STATUS` from an agent: delivered only to
    /// the command's origin connection.
    pub async fn route_command_status(&self, command_id: Uuid, status: CommandStatus, result: Option<Value>) {
        let Some(origin) = self.command_tracker.origin(command_id).await else {
            if let Err(err) = self.command_repo.update_status(command_id, status).await {
                warn!(%command_id, %err, "status persisted with no live origin to notify");
            }
            return;
        };

        let _ = self.command_repo.update_status(command_id, status).await;
        self.send_to_dashboard(origin, DashboardOutbound::CommandStatus { command_id, status, result }).await;
        if matches!(status, CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled) {
            self.command_tracker.retire(command_id).await;
        }
    }

    /// `COMMAND_COMPLETE` from an agent: same delivery as status, plus
    /// ending the terminal session.
    pub async fn route_command_complete(&self, command_id: Uuid, agent_id: Uuid, status: CommandStatus, result: Option<Value>) {
        self.route_command_status(command_id, status, result).await;
        self.terminal_streams.end_session(command_id, agent_id).await;
    }

    /// `TERMINAL_OUTPUT` from an agent: handed to C6 for coalescing. The
    /// origin connection is looked up once here so C6 never needs to know
    /// about command tracking.
    pub async fn route_terminal_output(&self, command_id: Uuid, agent_id: Uuid, line: TerminalLine) {
        let Some(origin) = self.command_tracker.origin(command_id).await else {
            warn!(%command_id, "terminal output for command with no live origin, dropped");
            return;
        };
        if let Err(err) = self
            .command_repo
            .append_output(command_id, agent_id, line.content.clone(), if line.stream == hub_shared::TerminalStreamKind::Stderr { "stderr" } else { "stdout" })
            .await
        {
            warn!(%command_id, %err, "failed to persist terminal output, still forwarding");
        }
        self.terminal_streams.submit(command_id, agent_id, origin, line).await;
    }

    /// `TRACE_EVENT` from an agent: delivered only to the origin.
    pub async fn route_trace_event(&self, command_id: Uuid, agent_id: Uuid, event: Value) {
        let _ = self.command_repo.add_trace(command_id, event.clone()).await;
        let Some(origin) = self.command_tracker.origin(command_id).await else { return };
        self.send_to_dashboard(origin, DashboardOutbound::TraceStream { command_id, agent_id, event }).await;
    }

    /// `EMERGENCY_STOP`: the sole dashboard-to-many-agents broadcast.
    /// Cancels every in-flight command, clears all offline queues, and
    /// notifies each command's origin.
    pub async fn emergency_stop(&self, reason: String) {
        info!(%reason, "emergency stop issued");
        let _ = self
            .audit_repo
            .log_event(AuditEvent::new("emergency_stop", serde_json::json!({ "reason": reason })))
            .await;
        let mut agents = self.registry.iterate_agents().await;
        for agent_id in self.offline_queue.agent_ids().await {
            if !agents.contains(&agent_id) {
                agents.push(agent_id);
            }
        }
        for agent_id in &agents {
            if let Some(connection_id) = self.registry.find_by_agent(*agent_id).await {
                self.send_to_agent(connection_id, AgentOutbound::EmergencyStop { reason: reason.clone() }).await;
            }
            for command in self.command_repo.get_running(*agent_id).await.unwrap_or_default() {
                self.route_command_status(command.command_id, CommandStatus::Cancelled, None).await;
            }
            for command in self.command_repo.get_queued(*agent_id).await.unwrap_or_default() {
                self.route_command_status(command.command_id, CommandStatus::Cancelled, None).await;
            }
        }
        self.offline_queue.clear_all().await;
    }

    /// Synthetic `AGENT_DISCONNECT`: cancels the agent's in-flight
    /// commands and notifies their origins. Dashboard broadcast is done
    /// separately by `announce_agent_disconnected`.
    async fn cancel_in_flight_for_agent(&self, agent_id: Uuid) {
        for command in self.command_repo.get_running(agent_id).await.unwrap_or_default() {
            self.route_command_status(command.command_id, CommandStatus::Cancelled, None).await;
        }
    }

    /// `AGENT_CONNECT` supersede path: closes the evicted connection,
    /// cancels its in-flight commands, and notifies their origins.
    pub async fn handle_superseded_connection(&self, evicted_connection_id: Uuid, agent_id: Uuid) {
        let payload = AgentOutbound::Error(ErrorPayload::new(ErrorCode::Superseded, "superseded by a newer connection"));
        self.send_to_agent(evicted_connection_id, payload).await;
        self.registry.close(evicted_connection_id).await;
        self.cancel_in_flight_for_agent(agent_id).await;
        let _ = self.agent_repo.set_disconnected(agent_id).await;
        let _ = self
            .audit_repo
            .log_event(AuditEvent::new("agent_superseded", serde_json::json!({ "agentId": agent_id })))
            .await;
    }
}
