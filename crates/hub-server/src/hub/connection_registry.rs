//! ConnectionRegistry: tracks live WebSocket peers by connection id and,
//! for agents, by agent id. `bind_agent` performs an atomic
//! supersede-then-install so a second connection for the same agent id
//! evicts the prior one rather than silently overwriting the index.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hub_shared::HubError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Agent { agent_id: Uuid },
    Dashboard { user_id: Uuid },
}

#[derive(Clone)]
pub struct Connection {
    pub connection_id: Uuid,
    pub kind: ConnectionKind,
    sender: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    /// Approximate bytes handed to the writer but not yet confirmed written
    /// to the socket, tracked for send-buffer backpressure decisions.
    pending_bytes: Arc<AtomicUsize>,
}

impl Connection {
    pub fn send(&self, payload: String) -> Result<(), HubError> {
        self.pending_bytes.fetch_add(payload.len(), Ordering::SeqCst);
        self.sender
            .send(payload)
            .map_err(|_| HubError::ConnectionFailed(self.connection_id.to_string()))
    }

    /// Signals the owning handler's select loop to close this socket.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::SeqCst)
    }

    /// Called by the connection handler's writer loop after a frame is
    /// actually flushed to the socket.
    pub fn ack_sent(&self, bytes: usize) {
        self.pending_bytes.fetch_sub(bytes.min(self.pending_bytes()), Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, Connection>>>,
    agent_index: Arc<RwLock<HashMap<Uuid, Uuid>>>,
    dashboard_index: Arc<RwLock<HashMap<Uuid, Vec<Uuid>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a not-yet-bound connection (pre-auth or dashboard).
    pub async fn add(
        &self,
        connection_id: Uuid,
        kind: ConnectionKind,
        sender: mpsc::UnboundedSender<String>,
        shutdown: CancellationToken,
    ) {
        let connection = Connection {
            connection_id,
            kind,
            sender,
            shutdown,
            pending_bytes: Arc::new(AtomicUsize::new(0)),
        };
        self.connections.write().await.insert(connection_id, connection);
        match kind {
            ConnectionKind::Agent { agent_id } => {
                self.agent_index.write().await.insert(agent_id, connection_id);
            }
            ConnectionKind::Dashboard { user_id } => {
                self.dashboard_index
                    .write()
                    .await
                    .entry(user_id)
                    .or_default()
                    .push(connection_id);
            }
        }
    }

    /// Atomically installs `connection_id` as the live binding for
    /// `agent_id`, evicting any prior connection. Returns the evicted
    /// connection id, if any, so the caller can close it and emit
    /// `ERROR{code=Superseded}` on it.
    pub async fn bind_agent(
        &self,
        connection_id: Uuid,
        agent_id: Uuid,
        sender: mpsc::UnboundedSender<String>,
        shutdown: CancellationToken,
    ) -> Option<Uuid> {
        let mut connections = self.connections.write().await;
        let mut agent_index = self.agent_index.write().await;

        let superseded = agent_index.insert(agent_id, connection_id);
        connections.insert(
            connection_id,
            Connection {
                connection_id,
                kind: ConnectionKind::Agent { agent_id },
                sender,
                shutdown,
                pending_bytes: Arc::new(AtomicUsize::new(0)),
            },
        );

        if let Some(prev) = superseded {
            if prev != connection_id {
                return Some(prev);
            }
        }
        None
    }

    pub async fn remove(&self, connection_id: Uuid) -> Option<ConnectionKind> {
        let mut connections = self.connections.write().await;
        let connection = connections.remove(&connection_id)?;
        match connection.kind {
            ConnectionKind::Agent { agent_id } => {
                let mut agent_index = self.agent_index.write().await;
                if agent_index.get(&agent_id) == Some(&connection_id) {
                    agent_index.remove(&agent_id);
                }
            }
            ConnectionKind::Dashboard { user_id } => {
                let mut dashboard_index = self.dashboard_index.write().await;
                if let Some(ids) = dashboard_index.get_mut(&user_id) {
                    ids.retain(|id| *id != connection_id);
                    if ids.is_empty() {
                        dashboard_index.remove(&user_id);
                    }
                }
            }
        }
        Some(connection.kind)
    }

    pub async fn get(&self, connection_id: Uuid) -> Option<Connection> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    pub async fn find_by_agent(&self, agent_id: Uuid) -> Option<Uuid> {
        self.agent_index.read().await.get(&agent_id).copied()
    }

    pub async fn is_agent_online(&self, agent_id: Uuid) -> bool {
        self.agent_index.read().await.contains_key(&agent_id)
    }

    pub async fn iterate_agents(&self) -> Vec<Uuid> {
        self.agent_index.read().await.keys().copied().collect()
    }

    pub async fn iterate_dashboards(&self) -> Vec<Uuid> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| matches!(c.kind, ConnectionKind::Dashboard { .. }))
            .map(|c| c.connection_id)
            .collect()
    }

    pub async fn send_to_agent(&self, agent_id: Uuid, payload: String) -> Result<(), HubError> {
        let connection_id = self
            .find_by_agent(agent_id)
            .await
            .ok_or(HubError::UnknownAgent(agent_id))?;
        self.send_to_connection(connection_id, payload).await
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, payload: String) -> Result<(), HubError> {
        let connection = self
            .get(connection_id)
            .await
            .ok_or_else(|| HubError::ConnectionFailed(connection_id.to_string()))?;
        connection.send(payload)
    }

    pub async fn broadcast_to_agents(&self, payload: String) -> usize {
        let connections = self.connections.read().await;
        let mut sent = 0;
        for connection in connections.values() {
            if matches!(connection.kind, ConnectionKind::Agent { .. }) && connection.send(payload.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub async fn broadcast_to_dashboards(&self, payload: String) -> usize {
        let connections = self.connections.read().await;
        let mut sent = 0;
        for connection in connections.values() {
            if matches!(connection.kind, ConnectionKind::Dashboard { .. }) && connection.send(payload.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub async fn close(&self, connection_id: Uuid) {
        if let Some(connection) = self.connections.read().await.get(&connection_id) {
            connection.close();
        }
    }

    pub async fn pending_bytes(&self, connection_id: Uuid) -> usize {
        self.get(connection_id).await.map_or(0, |c| c.pending_bytes())
    }

    pub async fn ack_sent(&self, connection_id: Uuid, bytes: usize) {
        if let Some(connection) = self.connections.read().await.get(&connection_id) {
            connection.ack_sent(bytes);
        }
    }

    pub async fn connection_counts(&self) -> (usize, usize) {
        let agents = self.agent_index.read().await.len();
        let dashboards = self.dashboard_index.read().await.values().map(Vec::len).sum();
        (agents, dashboards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn bind_agent_evicts_prior_connection() {
        let registry = ConnectionRegistry::new();
        let agent_id = Uuid::new_v4();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(registry
            .bind_agent(first, agent_id, tx1, CancellationToken::new())
            .await
            .is_none());
        let superseded = registry
            .bind_agent(second, agent_id, tx2, CancellationToken::new())
            .await;
        assert_eq!(superseded, Some(first));
        assert_eq!(registry.find_by_agent(agent_id).await, Some(second));
    }

    #[tokio::test]
    async fn at_most_one_agent_binding_at_a_time() {
        let registry = ConnectionRegistry::new();
        let agent_id = Uuid::new_v4();
        let (tx1, _rx1) = channel();
        registry
            .bind_agent(Uuid::new_v4(), agent_id, tx1, CancellationToken::new())
            .await;
        assert_eq!(registry.iterate_agents().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_cleans_dashboard_index() {
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        let (tx, _rx) = channel();
        registry
            .add(
                connection_id,
                ConnectionKind::Dashboard { user_id },
                tx,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(registry.iterate_dashboards().await, vec![connection_id]);
        registry.remove(connection_id).await;
        assert!(registry.iterate_dashboards().await.is_empty());
    }
}
