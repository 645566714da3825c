//! Command persistence plus the append-only trace/terminal-output side
//! tables.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use hub_shared::{Command, CommandStatus, HubError};

#[async_trait]
pub trait CommandRepo: Send + Sync {
    async fn create(&self, command: Command) -> Result<Command, HubError>;
    async fn update_status(&self, command_id: Uuid, status: CommandStatus) -> Result<(), HubError>;
    async fn complete(&self, command_id: Uuid, status: CommandStatus, result: Option<Value>) -> Result<(), HubError>;
    async fn get_running(&self, agent_id: Uuid) -> Result<Vec<Command>, HubError>;
    async fn get_queued(&self, agent_id: Uuid) -> Result<Vec<Command>, HubError>;
    async fn add_trace(&self, command_id: Uuid, event: Value) -> Result<(), HubError>;
    async fn create_investigation_report(&self, command_id: Uuid, report: Value) -> Result<(), HubError>;
    async fn append_output(&self, command_id: Uuid, agent_id: Uuid, content: String, stream: &str) -> Result<(), HubError>;
}

#[derive(sqlx::FromRow)]
struct CommandRow {
    command_id: Uuid,
    issuer_user_id: Uuid,
    target_agents: Vec<Uuid>,
    broadcast: bool,
    priority: i16,
    payload: Value,
    status: String,
    issued_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

fn status_str(status: CommandStatus) -> &'static str {
    match status {
        CommandStatus::Pending => "pending",
        CommandStatus::Queued => "queued",
        CommandStatus::Executing => "executing",
        CommandStatus::Completed => "completed",
        CommandStatus::Failed => "failed",
        CommandStatus::Cancelled => "cancelled",
    }
}

fn parse_status(value: &str) -> Result<CommandStatus, HubError> {
    match value {
        "pending" => Ok(CommandStatus::Pending),
        "queued" => Ok(CommandStatus::Queued),
        "executing" => Ok(CommandStatus::Executing),
        "completed" => Ok(CommandStatus::Completed),
        "failed" => Ok(CommandStatus::Failed),
        "cancelled" => Ok(CommandStatus::Cancelled),
        other => Err(HubError::Internal(format!("unknown command status in storage: {other}"))),
    }
}

impl TryFrom<CommandRow> for Command {
    type Error = HubError;

    fn try_from(row: CommandRow) -> Result<Self, HubError> {
        Ok(Command {
            command_id: row.command_id,
            issuer_user_id: row.issuer_user_id,
            target_agents: row.target_agents,
            broadcast: row.broadcast,
            priority: u8::try_from(row.priority).unwrap_or(0),
            payload: row.payload,
            status: parse_status(&row.status)?,
            issued_at: row.issued_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct PgCommandRepo {
    pool: PgPool,
}

impl PgCommandRepo {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommandRepo for PgCommandRepo {
    async fn create(&self, command: Command) -> Result<Command, HubError> {
        sqlx::query(
            r"
            INSERT INTO commands (command_id, issuer_user_id, target_agents, broadcast, priority, payload, status, issued_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(command.command_id)
        .bind(command.issuer_user_id)
        .bind(&command.target_agents)
        .bind(command.broadcast)
        .bind(i16::from(command.priority))
        .bind(&command.payload)
        .bind(status_str(command.status))
        .bind(command.issued_at)
        .bind(command.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(command)
    }

    async fn update_status(&self, command_id: Uuid, status: CommandStatus) -> Result<(), HubError> {
        sqlx::query("UPDATE commands SET status = $1, updated_at = $2 WHERE command_id = $3")
            .bind(status_str(status))
            .bind(Utc::now())
            .bind(command_id)
            .execute(&self.pool)
            .await
            .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn complete(&self, command_id: Uuid, status: CommandStatus, result: Option<Value>) -> Result<(), HubError> {
        sqlx::query(
            "UPDATE commands SET status = $1, updated_at = $2, result = $3 WHERE command_id = $4",
        )
        .bind(status_str(status))
        .bind(Utc::now())
        .bind(result)
        .bind(command_id)
        .execute(&self.pool)
        .await
        .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn get_running(&self, agent_id: Uuid) -> Result<Vec<Command>, HubError> {
        let rows = sqlx::query_as::<_, CommandRow>(
            "SELECT * FROM commands WHERE $1 = ANY(target_agents) AND status = 'executing'",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HubError::Repository(e.to_string()))?;
        rows.into_iter().map(Command::try_from).collect()
    }

    async fn get_queued(&self, agent_id: Uuid) -> Result<Vec<Command>, HubError> {
        let rows = sqlx::query_as::<_, CommandRow>(
            "SELECT * FROM commands WHERE $1 = ANY(target_agents) AND status = 'queued'",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HubError::Repository(e.to_string()))?;
        rows.into_iter().map(Command::try_from).collect()
    }

    async fn add_trace(&self, command_id: Uuid, event: Value) -> Result<(), HubError> {
        sqlx::query("INSERT INTO command_traces (command_id, event, recorded_at) VALUES ($1, $2, $3)")
            .bind(command_id)
            .bind(event)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn create_investigation_report(&self, command_id: Uuid, report: Value) -> Result<(), HubError> {
        sqlx::query("INSERT INTO investigation_reports (command_id, report, created_at) VALUES ($1, $2, $3)")
            .bind(command_id)
            .bind(report)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(())
    }

    async fn append_output(&self, command_id: Uuid, agent_id: Uuid, content: String, stream: &str) -> Result<(), HubError> {
        sqlx::query(
            "INSERT INTO command_output (command_id, agent_id, content, stream, recorded_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(command_id)
        .bind(agent_id)
        .bind(content)
        .bind(stream)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| HubError::Repository(e.to_string()))?;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryCommandRepo {
    commands: Arc<RwLock<HashMap<Uuid, Command>>>,
}

impl InMemoryCommandRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandRepo for InMemoryCommandRepo {
    async fn create(&self, command: Command) -> Result<Command, HubError> {
        self.commands.write().await.insert(command.command_id, command.clone());
        Ok(command)
    }

    async fn update_status(&self, command_id: Uuid, status: CommandStatus) -> Result<(), HubError> {
        if let Some(command) = self.commands.write().await.get_mut(&command_id) {
            command.status = status;
            command.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete(&self, command_id: Uuid, status: CommandStatus, _result: Option<Value>) -> Result<(), HubError> {
        self.update_status(command_id, status).await
    }

    async fn get_running(&self, agent_id: Uuid) -> Result<Vec<Command>, HubError> {
        Ok(self
            .commands
            .read()
            .await
            .values()
            .filter(|c| c.status == CommandStatus::Executing && c.target_agents.contains(&agent_id))
            .cloned()
            .collect())
    }

    async fn get_queued(&self, agent_id: Uuid) -> Result<Vec<Command>, HubError> {
        Ok(self
            .commands
            .read()
            .await
            .values()
            .filter(|c| c.status == CommandStatus::Queued && c.target_agents.contains(&agent_id))
            .cloned()
            .collect())
    }

    async fn add_trace(&self, _command_id: Uuid, _event: Value) -> Result<(), HubError> {
        Ok(())
    }

    async fn create_investigation_report(&self, _command_id: Uuid, _report: Value) -> Result<(), HubError> {
        Ok(())
    }

    async fn append_output(&self, _command_id: Uuid, _agent_id: Uuid, _content: String, _stream: &str) -> Result<(), HubError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_command(status: CommandStatus, agent_id: Uuid) -> Command {
        Command {
            command_id: Uuid::new_v4(),
            issuer_user_id: Uuid::new_v4(),
            target_agents: vec![agent_id],
            broadcast: false,
            priority: 0,
            payload: json!({}),
            status,
            issued_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn update_status_changes_recorded_command() {
        let repo = InMemoryCommandRepo::new();
        let agent_id = Uuid::new_v4();
        let command = sample_command(CommandStatus::Pending, agent_id);
        repo.create(command.clone()).await.unwrap();
        repo.update_status(command.command_id, CommandStatus::Executing).await.unwrap();
        let running = repo.get_running(agent_id).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].command_id, command.command_id);
    }

    #[tokio::test]
    async fn get_queued_only_returns_queued_commands_for_that_agent() {
        let repo = InMemoryCommandRepo::new();
        let agent_a = Uuid::new_v4();
        let agent_b = Uuid::new_v4();
        repo.create(sample_command(CommandStatus::Queued, agent_a)).await.unwrap();
        repo.create(sample_command(CommandStatus::Queued, agent_b)).await.unwrap();
        repo.create(sample_command(CommandStatus::Executing, agent_a)).await.unwrap();

        let queued = repo.get_queued(agent_a).await.unwrap();
        assert_eq!(queued.len(), 1);
    }
}
