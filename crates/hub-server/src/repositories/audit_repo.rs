//! Audit trail persistence: a proper repository for routing decisions of
//! note (supersede, emergency stop, token expiry, queue eviction) so audit
//! entries are queryable rather than log-only.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use hub_shared::{AuditEvent, HubError};

#[async_trait]
pub trait AuditRepo: Send + Sync {
    async fn log_event(&self, event: AuditEvent) -> Result<(), HubError>;
}

pub struct PgAuditRepo {
    pool: PgPool,
}

impl PgAuditRepo {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepo for PgAuditRepo {
    async fn log_event(&self, event: AuditEvent) -> Result<(), HubError> {
        sqlx::query(
            "INSERT INTO audit_events (event_id, occurred_at, kind, detail) VALUES ($1, $2, $3, $4)",
        )
        .bind(event.event_id)
        .bind(event.occurred_at)
        .bind(&event.kind)
        .bind(&event.detail)
        .execute(&self.pool)
        .await
        .map_err(|e| HubError::Repository(e.to_string()))?;
        info!(kind = %event.kind, "audit event recorded");
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryAuditRepo {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl InMemoryAuditRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl AuditRepo for InMemoryAuditRepo {
    async fn log_event(&self, event: AuditEvent) -> Result<(), HubError> {
        self.events.write().await.push(event);
        Ok(())
    }
}
