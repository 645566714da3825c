//! Shared application state handed to every HTTP and WebSocket handler
//! via axum's typed `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::database::Database;
use crate::hub::{CommandTracker, ConnectionRegistry, HeartbeatManager, MessageRouter, OfflineQueue, TerminalStreamManager, TokenManager};
use crate::repositories::{AgentRepo, AuditRepo, CommandRepo};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub database: Database,
    pub registry: ConnectionRegistry,
    pub command_tracker: CommandTracker,
    pub offline_queue: OfflineQueue,
    pub terminal_streams: TerminalStreamManager,
    pub heartbeat: HeartbeatManager,
    pub token_manager: TokenManager,
    pub router: MessageRouter,
    pub token_verifier: Arc<dyn TokenVerifier>,
    pub agent_repo: Arc<dyn AgentRepo>,
    pub command_repo: Arc<dyn CommandRepo>,
    pub audit_repo: Arc<dyn AuditRepo>,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}
