//! OfflineQueue: per-agent priority FIFO for commands addressed to a
//! currently disconnected agent. Per-agent structures are behind their
//! own mutex so contention on one agent's queue never blocks another's.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, warn};
use uuid::Uuid;

use hub_shared::Command;

struct Entry {
    command: Command,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    RejectedFull,
}

#[derive(Clone)]
pub struct OfflineQueue {
    queues: Arc<RwLock<HashMap<Uuid, Arc<Mutex<Vec<Entry>>>>>>,
    max_len: usize,
    ttl: StdDuration,
}

impl OfflineQueue {
    #[must_use]
    pub fn new(max_len: usize, ttl: StdDuration) -> Self {
        Self { queues: Arc::new(RwLock::new(HashMap::new())), max_len, ttl }
    }

    async fn queue_for(&self, agent_id: Uuid) -> Arc<Mutex<Vec<Entry>>> {
        if let Some(queue) = self.queues.read().await.get(&agent_id) {
            return queue.clone();
        }
        self.queues
            .write()
            .await
            .entry(agent_id)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Enqueues `command` for `agent_id`. The capacity bound is enforced by
    /// evicting the oldest entry rather than rejecting the new one, so this
    /// always returns `Accepted` in practice; `RejectedFull` is kept in the
    /// type for a future strict-capacity policy (see DESIGN.md).
    pub async fn enqueue(&self, agent_id: Uuid, command: Command) -> EnqueueOutcome {
        let queue = self.queue_for(agent_id).await;
        let mut queue = queue.lock().await;

        if queue.len() >= self.max_len {
            queue.remove(0);
            warn!(%agent_id, max = self.max_len, "offline queue full, evicted oldest entry");
        }

        queue.push(Entry { command, enqueued_at: Instant::now() });
        EnqueueOutcome::Accepted
    }

    /// Drains all non-expired entries for `agent_id`, highest priority
    /// first and FIFO within a priority tier, and clears the queue.
    pub async fn drain(&self, agent_id: Uuid) -> Vec<Command> {
        let queue = self.queue_for(agent_id).await;
        let mut queue = queue.lock().await;

        let ttl = self.ttl;
        queue.retain(|e| e.enqueued_at.elapsed() < ttl);

        let mut drained = std::mem::take(&mut *queue);
        drained.sort_by_key(|e| std::cmp::Reverse(e.command.priority));
        drained.into_iter().map(|e| e.command).collect()
    }

    pub async fn len(&self, agent_id: Uuid) -> usize {
        self.queue_for(agent_id).await.lock().await.len()
    }

    pub async fn clear(&self, agent_id: Uuid) {
        self.queue_for(agent_id).await.lock().await.clear();
    }

    /// Emergency stop: clears every agent's queue.
    pub async fn clear_all(&self) {
        let queues = self.queues.read().await;
        for queue in queues.values() {
            queue.lock().await.clear();
        }
    }

    /// Ids of every agent with a known offline queue, whether or not it
    /// currently holds entries. Used by emergency stop to find agents that
    /// have queued work but no live connection, so their commands can be
    /// cancelled even though they never show up in the connection registry.
    pub async fn agent_ids(&self) -> Vec<Uuid> {
        self.queues.read().await.keys().copied().collect()
    }

    async fn sweep(&self) {
        let queues = self.queues.read().await;
        let ttl = self.ttl;
        for queue in queues.values() {
            let mut queue = queue.lock().await;
            let before = queue.len();
            queue.retain(|e| e.enqueued_at.elapsed() < ttl);
            if queue.len() < before {
                debug!(removed = before - queue.len(), "offline queue sweep evicted expired entries");
            }
        }
    }

    pub fn spawn_sweeper(&self, cadence: StdDuration) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(cadence);
            loop {
                ticker.tick().await;
                queue.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hub_shared::CommandStatus;

    fn make_command(priority: u8) -> Command {
        Command {
            command_id: Uuid::new_v4(),
            issuer_user_id: Uuid::new_v4(),
            target_agents: vec![],
            broadcast: false,
            priority,
            payload: serde_json::json!({}),
            status: CommandStatus::Queued,
            issued_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn drain_orders_by_priority_then_fifo() {
        let queue = OfflineQueue::new(1024, StdDuration::from_secs(900));
        let agent_id = Uuid::new_v4();
        let c1 = make_command(5);
        let c2 = make_command(5);
        let c3 = make_command(9);

        queue.enqueue(agent_id, c1.clone()).await;
        queue.enqueue(agent_id, c2.clone()).await;
        queue.enqueue(agent_id, c3.clone()).await;

        let drained = queue.drain(agent_id).await;
        let ids: Vec<Uuid> = drained.iter().map(|c| c.command_id).collect();
        assert_eq!(ids, vec![c3.command_id, c1.command_id, c2.command_id]);
    }

    #[tokio::test]
    async fn drain_empties_the_queue() {
        let queue = OfflineQueue::new(1024, StdDuration::from_secs(900));
        let agent_id = Uuid::new_v4();
        queue.enqueue(agent_id, make_command(0)).await;
        queue.drain(agent_id).await;
        assert_eq!(queue.len(agent_id).await, 0);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_entry() {
        let queue = OfflineQueue::new(2, StdDuration::from_secs(900));
        let agent_id = Uuid::new_v4();
        let c1 = make_command(0);
        let c2 = make_command(0);
        let c3 = make_command(0);
        queue.enqueue(agent_id, c1.clone()).await;
        queue.enqueue(agent_id, c2.clone()).await;
        let outcome = queue.enqueue(agent_id, c3.clone()).await;
        assert_eq!(outcome, EnqueueOutcome::Accepted);
        assert_eq!(queue.len(agent_id).await, 2);
        let drained = queue.drain(agent_id).await;
        let ids: Vec<Uuid> = drained.iter().map(|c| c.command_id).collect();
        assert_eq!(ids, vec![c2.command_id, c3.command_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_never_delivered() {
        let queue = OfflineQueue::new(1024, StdDuration::from_millis(10));
        let agent_id = Uuid::new_v4();
        queue.enqueue(agent_id, make_command(0)).await;
        tokio::time::advance(StdDuration::from_millis(20)).await;
        assert!(queue.drain(agent_id).await.is_empty());
    }

    #[tokio::test]
    async fn clear_all_empties_every_agent_queue() {
        let queue = OfflineQueue::new(1024, StdDuration::from_secs(900));
        let a1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();
        queue.enqueue(a1, make_command(0)).await;
        queue.enqueue(a2, make_command(0)).await;
        queue.clear_all().await;
        assert_eq!(queue.len(a1).await, 0);
        assert_eq!(queue.len(a2).await, 0);
    }
}
