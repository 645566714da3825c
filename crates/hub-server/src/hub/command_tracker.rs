//! CommandTracker: `commandId -> originatingConnectionId`, in-memory only.
//! Ownership here is a single connection id per command, not a list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::debug;
use uuid::Uuid;

struct Entry {
    origin: Uuid,
    registered_at: Instant,
}

#[derive(Clone, Default)]
pub struct CommandTracker {
    entries: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, command_id: Uuid, origin_connection_id: Uuid) {
        self.entries.write().await.insert(
            command_id,
            Entry { origin: origin_connection_id, registered_at: Instant::now() },
        );
    }

    pub async fn origin(&self, command_id: Uuid) -> Option<Uuid> {
        self.entries.read().await.get(&command_id).map(|e| e.origin)
    }

    pub async fn retire(&self, command_id: Uuid) {
        self.entries.write().await.remove(&command_id);
    }

    /// Retires every command tracked for `connection_id` immediately on
    /// disconnect, rather than waiting for the periodic sweep below.
    pub async fn retire_all_from_connection(&self, connection_id: Uuid) -> Vec<Uuid> {
        let mut entries = self.entries.write().await;
        let retired: Vec<Uuid> = entries
            .iter()
            .filter(|(_, e)| e.origin == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &retired {
            entries.remove(id);
        }
        retired
    }

    async fn sweep(&self, ttl: StdDuration) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.registered_at.elapsed() < ttl);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "command tracker sweep evicted stale entries");
        }
    }

    /// Spawns the periodic TTL sweep. Returns a handle the caller can abort
    /// on shutdown.
    pub fn spawn_sweeper(&self, ttl: StdDuration, cadence: StdDuration) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(cadence);
            loop {
                ticker.tick().await;
                tracker.sweep(ttl).await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_origin_round_trips() {
        let tracker = CommandTracker::new();
        let command_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        tracker.register(command_id, connection_id).await;
        assert_eq!(tracker.origin(command_id).await, Some(connection_id));
    }

    #[tokio::test]
    async fn retire_removes_entry() {
        let tracker = CommandTracker::new();
        let command_id = Uuid::new_v4();
        tracker.register(command_id, Uuid::new_v4()).await;
        tracker.retire(command_id).await;
        assert_eq!(tracker.origin(command_id).await, None);
    }

    #[tokio::test]
    async fn retire_all_from_connection_only_touches_that_origin() {
        let tracker = CommandTracker::new();
        let connection_a = Uuid::new_v4();
        let connection_b = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        tracker.register(c1, connection_a).await;
        tracker.register(c2, connection_b).await;

        let retired = tracker.retire_all_from_connection(connection_a).await;
        assert_eq!(retired, vec![c1]);
        assert_eq!(tracker.origin(c1).await, None);
        assert_eq!(tracker.origin(c2).await, Some(connection_b));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_entries_older_than_ttl() {
        let tracker = CommandTracker::new();
        let command_id = Uuid::new_v4();
        tracker.register(command_id, Uuid::new_v4()).await;
        let _handle = tracker.spawn_sweeper(StdDuration::from_millis(20), StdDuration::from_millis(5));
        tokio::time::advance(StdDuration::from_millis(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(tracker.origin(command_id).await, None);
    }
}
