use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical agent identity, persisted externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: Uuid,
    pub owner_user_id: Uuid,
    pub name: String,
    pub agent_type: String,
    pub status: AgentStatus,
    pub activity: ActivityStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Offline,
    Connecting,
    Online,
    Error,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Offline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Idle,
    Processing,
    Queued,
}

impl Default for ActivityStatus {
    fn default() -> Self {
        Self::Idle
    }
}

/// Persisted command entity. Transitions are monotonic along
/// `Pending -> Queued -> Executing -> {Completed|Failed|Cancelled}`;
/// `Cancelled` is also reachable from `Pending` or `Queued`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: Uuid,
    pub issuer_user_id: Uuid,
    pub target_agents: Vec<Uuid>,
    pub broadcast: bool,
    pub priority: u8,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Command {
    /// Whether emergency-stop accounting should treat this command as
    /// still in flight (see DESIGN.md open question).
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            CommandStatus::Pending | CommandStatus::Queued | CommandStatus::Executing
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

/// One line of terminal output submitted by an agent for a `(command_id,
/// agent_id)` session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalLine {
    pub content: String,
    pub stream: TerminalStreamKind,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub ansi: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStreamKind {
    Stdout,
    Stderr,
}

/// An audit trail entry, written through `AuditRepo::log_event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub kind: String,
    pub detail: serde_json::Value,
}

impl AuditEvent {
    #[must_use]
    pub fn new(kind: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            kind: kind.into(),
            detail,
        }
    }
}
