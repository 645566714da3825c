//! Agent persistence, kept behind a trait so the hub core can run against
//! an in-memory fake in tests. Uses the runtime-checked `query_as::<_, T>`
//! form rather than the compile-time checked `query_as!` macro, since this
//! crate never has a live database to check queries against at build time.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use hub_shared::{ActivityStatus, Agent, AgentStatus, HubError};

#[async_trait]
pub trait AgentRepo: Send + Sync {
    async fn get(&self, agent_id: Uuid) -> Result<Option<Agent>, HubError>;
    async fn get_by_name(&self, owner_user_id: Uuid, name: &str) -> Result<Option<Agent>, HubError>;
    async fn register(&self, agent: Agent) -> Result<Agent, HubError>;
    async fn update(&self, agent: Agent) -> Result<(), HubError>;
    async fn set_connected(&self, agent_id: Uuid) -> Result<(), HubError>;
    async fn set_disconnected(&self, agent_id: Uuid) -> Result<(), HubError>;
    async fn update_heartbeat(&self, agent_id: Uuid) -> Result<(), HubError>;
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    agent_id: Uuid,
    owner_user_id: Uuid,
    name: String,
    agent_type: String,
    status: String,
    activity: String,
    last_heartbeat: Option<chrono::DateTime<Utc>>,
    created_at: chrono::DateTime<Utc>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = HubError;

    fn try_from(row: AgentRow) -> Result<Self, HubError> {
        Ok(Agent {
            agent_id: row.agent_id,
            owner_user_id: row.owner_user_id,
            name: row.name,
            agent_type: row.agent_type,
            status: parse_status(&row.status)?,
            activity: parse_activity(&row.activity)?,
            last_heartbeat: row.last_heartbeat,
            created_at: row.created_at,
        })
    }
}

fn parse_status(value: &str) -> Result<AgentStatus, HubError> {
    match value {
        "offline" => Ok(AgentStatus::Offline),
        "connecting" => Ok(AgentStatus::Connecting),
        "online" => Ok(AgentStatus::Online),
        "error" => Ok(AgentStatus::Error),
        other => Err(HubError::Internal(format!("unknown agent status in storage: {other}"))),
    }
}

fn parse_activity(value: &str) -> Result<ActivityStatus, HubError> {
    match value {
        "idle" => Ok(ActivityStatus::Idle),
        "processing" => Ok(ActivityStatus::Processing),
        "queued" => Ok(ActivityStatus::Queued),
        other => Err(HubError::Internal(format!("unknown activity status in storage: {other}"))),
    }
}

fn status_str(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Offline => "offline",
        AgentStatus::Connecting => "connecting",
        AgentStatus::Online => "online",
        AgentStatus::Error => "error",
    }
}

fn activity_str(activity: ActivityStatus) -> &'static str {
    match activity {
        ActivityStatus::Idle => "idle",
        ActivityStatus::Processing => "processing",
        ActivityStatus::Queued => "queued",
    }
}

pub struct PgAgentRepo {
    pool: PgPool,
}

impl PgAgentRepo {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentRepo for PgAgentRepo {
    async fn get(&self, agent_id: Uuid) -> Result<Option<Agent>, HubError> {
        let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HubError::Repository(e.to_string()))?;
        row.map(Agent::try_from).transpose()
    }

    async fn get_by_name(&self, owner_user_id: Uuid, name: &str) -> Result<Option<Agent>, HubError> {
        let row = sqlx::query_as::<_, AgentRow>(
            "SELECT * FROM agents WHERE owner_user_id = $1 AND name = $2",
        )
        .bind(owner_user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| HubError::Repository(e.to_string()))?;
        row.map(Agent::try_from).transpose()
    }

    async fn register(&self, agent: Agent) -> Result<Agent, HubError> {
        sqlx::query(
            r"
            INSERT INTO agents (agent_id, owner_user_id, name, agent_type, status, activity, last_heartbeat, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(agent.agent_id)
        .bind(agent.owner_user_id)
        .bind(&agent.name)
        .bind(&agent.agent_type)
        .bind(status_str(agent.status))
        .bind(activity_str(agent.activity))
        .bind(agent.last_heartbeat)
        .bind(agent.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(agent)
    }

    async fn update(&self, agent: Agent) -> Result<(), HubError> {
        sqlx::query(
            "UPDATE agents SET status = $1, activity = $2, last_heartbeat = $3 WHERE agent_id = $4",
        )
        .bind(status_str(agent.status))
        .bind(activity_str(agent.activity))
        .bind(agent.last_heartbeat)
        .bind(agent.agent_id)
        .execute(&self.pool)
        .await
        .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn set_connected(&self, agent_id: Uuid) -> Result<(), HubError> {
        sqlx::query("UPDATE agents SET status = 'online', last_heartbeat = $1 WHERE agent_id = $2")
            .bind(Utc::now())
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn set_disconnected(&self, agent_id: Uuid) -> Result<(), HubError> {
        sqlx::query("UPDATE agents SET status = 'offline' WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn update_heartbeat(&self, agent_id: Uuid) -> Result<(), HubError> {
        sqlx::query("UPDATE agents SET last_heartbeat = $1 WHERE agent_id = $2")
            .bind(Utc::now())
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(())
    }
}

/// In-memory stand-in used by hub-core tests so they never need a
/// database.
#[derive(Default, Clone)]
pub struct InMemoryAgentRepo {
    agents: Arc<RwLock<HashMap<Uuid, Agent>>>,
}

impl InMemoryAgentRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepo for InMemoryAgentRepo {
    async fn get(&self, agent_id: Uuid) -> Result<Option<Agent>, HubError> {
        Ok(self.agents.read().await.get(&agent_id).cloned())
    }

    async fn get_by_name(&self, owner_user_id: Uuid, name: &str) -> Result<Option<Agent>, HubError> {
        Ok(self
            .agents
            .read()
            .await
            .values()
            .find(|a| a.owner_user_id == owner_user_id && a.name == name)
            .cloned())
    }

    async fn register(&self, agent: Agent) -> Result<Agent, HubError> {
        self.agents.write().await.insert(agent.agent_id, agent.clone());
        Ok(agent)
    }

    async fn update(&self, agent: Agent) -> Result<(), HubError> {
        self.agents.write().await.insert(agent.agent_id, agent);
        Ok(())
    }

    async fn set_connected(&self, agent_id: Uuid) -> Result<(), HubError> {
        if let Some(agent) = self.agents.write().await.get_mut(&agent_id) {
            agent.status = AgentStatus::Online;
            agent.last_heartbeat = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_disconnected(&self, agent_id: Uuid) -> Result<(), HubError> {
        if let Some(agent) = self.agents.write().await.get_mut(&agent_id) {
            agent.status = AgentStatus::Offline;
        }
        Ok(())
    }

    async fn update_heartbeat(&self, agent_id: Uuid) -> Result<(), HubError> {
        if let Some(agent) = self.agents.write().await.get_mut(&agent_id) {
            agent.last_heartbeat = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent() -> Agent {
        Agent {
            agent_id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            name: "probe-1".to_string(),
            agent_type: "generic".to_string(),
            status: AgentStatus::Offline,
            activity: ActivityStatus::Idle,
            last_heartbeat: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let repo = InMemoryAgentRepo::new();
        let agent = sample_agent();
        repo.register(agent.clone()).await.unwrap();
        let fetched = repo.get(agent.agent_id).await.unwrap().unwrap();
        assert_eq!(fetched.name, agent.name);
    }

    #[tokio::test]
    async fn set_connected_updates_status_and_heartbeat() {
        let repo = InMemoryAgentRepo::new();
        let agent = sample_agent();
        repo.register(agent.clone()).await.unwrap();
        repo.set_connected(agent.agent_id).await.unwrap();
        let fetched = repo.get(agent.agent_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, AgentStatus::Online);
        assert!(fetched.last_heartbeat.is_some());
    }

    #[test]
    fn parse_status_rejects_unknown_values() {
        assert!(parse_status("quantum").is_err());
        assert!(parse_status("online").is_ok());
    }
}
