//! Wire protocol: four `{type, id, timestamp, payload}` message families,
//! one per peer direction. Each family is a closed, adjacently-tagged enum
//! (`type` selects the variant, `payload` carries its body) wrapped in a
//! generic [`Envelope`] that owns the peer-chosen `id` and `timestamp`.
//! Unknown `type` values fail to deserialize rather than being silently
//! accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::ErrorCode;
use crate::models::{AgentStatus, Command, CommandStatus, TerminalStreamKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: String,
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(id: impl Into<String>, body: T) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now().timestamp_millis(),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub acknowledged_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    pub echoed_timestamp: i64,
}

// --- Agent -> Server -------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentInbound {
    #[serde(rename = "AGENT_CONNECT")]
    AgentConnect { agent_id: Uuid, token: String },
    #[serde(rename = "AGENT_HEARTBEAT")]
    AgentHeartbeat { status: AgentStatus },
    #[serde(rename = "AGENT_ERROR")]
    AgentError { message: String, details: Option<Value> },
    #[serde(rename = "COMMAND_ACK")]
    CommandAck { command_id: Uuid },
    #[serde(rename = "COMMAND_COMPLETE")]
    CommandComplete {
        command_id: Uuid,
        status: CommandStatus,
        result: Option<Value>,
    },
    #[serde(rename = "TERMINAL_OUTPUT")]
    TerminalOutput {
        command_id: Uuid,
        content: String,
        stream: TerminalStreamKind,
        ansi: bool,
    },
    #[serde(rename = "TRACE_EVENT")]
    TraceEvent { command_id: Uuid, event: Value },
    #[serde(rename = "INVESTIGATION_REPORT")]
    InvestigationReport { command_id: Uuid, report: Value },
    #[serde(rename = "PING")]
    Ping(PingPayload),
    #[serde(rename = "PONG")]
    Pong(PongPayload),
}

// --- Server -> Agent --------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentOutbound {
    #[serde(rename = "COMMAND_REQUEST")]
    CommandRequest { command: Command },
    #[serde(rename = "COMMAND_CANCEL")]
    CommandCancel { command_id: Uuid },
    #[serde(rename = "EMERGENCY_STOP")]
    EmergencyStop { reason: String },
    #[serde(rename = "SERVER_HEARTBEAT")]
    ServerHeartbeat,
    #[serde(rename = "TOKEN_REFRESH")]
    TokenRefresh { token: String, expires_at: DateTime<Utc> },
    #[serde(rename = "ACK")]
    Ack(AckPayload),
    #[serde(rename = "ERROR")]
    Error(ErrorPayload),
    #[serde(rename = "PING")]
    Ping(PingPayload),
    #[serde(rename = "PONG")]
    Pong(PongPayload),
}

// --- Dashboard -> Server -----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DashboardInbound {
    #[serde(rename = "DASHBOARD_CONNECT")]
    DashboardConnect { token: String },
    #[serde(rename = "COMMAND_REQUEST")]
    CommandRequest {
        target_agents: Vec<Uuid>,
        broadcast: bool,
        priority: u8,
        payload: Value,
    },
    #[serde(rename = "COMMAND_CANCEL")]
    CommandCancel { command_id: Uuid },
    #[serde(rename = "EMERGENCY_STOP")]
    EmergencyStop { reason: String },
    #[serde(rename = "SUBSCRIBE_TRACES")]
    SubscribeTraces { command_id: Uuid },
    #[serde(rename = "UNSUBSCRIBE_TRACES")]
    UnsubscribeTraces { command_id: Uuid },
    #[serde(rename = "PING")]
    Ping(PingPayload),
    #[serde(rename = "PONG")]
    Pong(PongPayload),
}

// --- Server -> Dashboard -----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DashboardOutbound {
    #[serde(rename = "CONNECTION_ACK")]
    ConnectionAck {
        connection_id: Uuid,
        server_version: String,
        features: Vec<String>,
    },
    #[serde(rename = "AGENT_LIST")]
    AgentList { agents: Vec<crate::models::Agent> },
    #[serde(rename = "AGENT_CONNECTED")]
    AgentConnected { agent_id: Uuid },
    #[serde(rename = "AGENT_DISCONNECTED")]
    AgentDisconnected { agent_id: Uuid },
    #[serde(rename = "COMMAND_STATUS")]
    CommandStatus {
        command_id: Uuid,
        status: CommandStatus,
        result: Option<Value>,
    },
    #[serde(rename = "TERMINAL_STREAM")]
    TerminalStream {
        command_id: Uuid,
        agent_id: Uuid,
        content: String,
        stream: TerminalStreamKind,
        ansi: bool,
        elided: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        elided_bytes: Option<usize>,
    },
    #[serde(rename = "TRACE_STREAM")]
    TraceStream {
        command_id: Uuid,
        agent_id: Uuid,
        event: Value,
    },
    #[serde(rename = "TOKEN_REFRESH")]
    TokenRefresh { token: String, expires_at: DateTime<Utc> },
    #[serde(rename = "COMMAND_QUEUED")]
    CommandQueued { command_id: Uuid },
    #[serde(rename = "ACK")]
    Ack(AckPayload),
    #[serde(rename = "ERROR")]
    Error(ErrorPayload),
    #[serde(rename = "PING")]
    Ping(PingPayload),
    #[serde(rename = "PONG")]
    Pong(PongPayload),
    #[serde(rename = "SERVER_SHUTDOWN")]
    ServerShutdown,
}
