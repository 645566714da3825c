//! Internal event channel types (design note: "Event emitters... become
//! typed event channels"). Managers that drive background timers publish
//! to a shared `mpsc::UnboundedSender<HubEvent>`; the connection handler
//! that owns the matching connection consumes and acts on them.

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum HubEvent {
    TokenRefreshed { connection_id: Uuid, new_token: String, new_expiry: DateTime<Utc> },
    TokenExpired { connection_id: Uuid },
    ConnectionTimeout { connection_id: Uuid },
    AgentSuperseded { connection_id: Uuid },
}
