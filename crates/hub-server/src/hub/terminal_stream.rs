//! TerminalStreamManager: coalesces per-`(commandId, agentId)` terminal
//! output into latency-bounded flushes delivered to the command's origin
//! dashboard connection, with backpressure elision when that connection's
//! outbound buffer backs up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, warn};
use uuid::Uuid;

use hub_shared::protocol::{DashboardOutbound, Envelope};
use hub_shared::{TerminalLine, TerminalStreamKind};

use crate::hub::connection_registry::ConnectionRegistry;

#[derive(Clone, Copy, Debug)]
pub struct TerminalStreamConfig {
    pub buffer_bytes: usize,
    pub buffer_lines: usize,
    pub flush_interval: StdDuration,
    pub send_high_water: usize,
    pub send_low_water: usize,
    pub linger: StdDuration,
    pub session_max_age: StdDuration,
}

struct Session {
    command_id: Uuid,
    agent_id: Uuid,
    origin_connection_id: Uuid,
    buffer: Vec<TerminalLine>,
    buffered_bytes: usize,
    next_sequence: u64,
    last_flush_at: Instant,
    last_activity_at: Instant,
    ended_at: Option<Instant>,
}

impl Session {
    fn new(command_id: Uuid, agent_id: Uuid, origin_connection_id: Uuid) -> Self {
        let now = Instant::now();
        Self {
            command_id,
            agent_id,
            origin_connection_id,
            buffer: Vec::new(),
            buffered_bytes: 0,
            next_sequence: 0,
            last_flush_at: now,
            last_activity_at: now,
            ended_at: None,
        }
    }

}

#[derive(Clone)]
pub struct TerminalStreamManager {
    registry: ConnectionRegistry,
    sessions: Arc<RwLock<HashMap<(Uuid, Uuid), Session>>>,
    suppressed: Arc<RwLock<HashMap<Uuid, bool>>>,
    config: TerminalStreamConfig,
}

impl TerminalStreamManager {
    #[must_use]
    pub fn new(registry: ConnectionRegistry, config: TerminalStreamConfig) -> Self {
        Self {
            registry,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            suppressed: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Appends a line submitted by an agent, creating the session on first
    /// use, and flushes immediately if the line itself crosses a
    /// size/line/stderr threshold.
    pub async fn submit(
        &self,
        command_id: Uuid,
        agent_id: Uuid,
        origin_connection_id: Uuid,
        mut line: TerminalLine,
    ) {
        let key = (command_id, agent_id);
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(key)
            .or_insert_with(|| Session::new(command_id, agent_id, origin_connection_id));

        line.sequence = session.next_sequence;
        session.next_sequence += 1;
        session.buffered_bytes += line.content.len();
        let is_stderr = line.stream == TerminalStreamKind::Stderr;
        session.buffer.push(line);
        session.last_activity_at = Instant::now();

        let should_flush = is_stderr
            || session.buffered_bytes >= self.config.buffer_bytes
            || session.buffer.len() >= self.config.buffer_lines;

        if should_flush {
            self.flush_locked(&mut sessions, key).await;
        }
    }

    /// Ticks every session whose time-based flush predicate fires. Runs on
    /// `FLUSH_INTERVAL` cadence in the caller-owned background task.
    async fn tick(&self) {
        let due: Vec<(Uuid, Uuid)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, s)| {
                    !s.buffer.is_empty() && s.last_flush_at.elapsed() >= self.config.flush_interval
                })
                .map(|(k, _)| *k)
                .collect()
        };

        let mut sessions = self.sessions.write().await;
        for key in due {
            self.flush_locked(&mut sessions, key).await;
        }
    }

    async fn flush_locked(&self, sessions: &mut HashMap<(Uuid, Uuid), Session>, key: (Uuid, Uuid)) {
        let Some(session) = sessions.get_mut(&key) else { return };
        if session.buffer.is_empty() {
            return;
        }

        let content: String = session.buffer.iter().map(|l| l.content.as_str()).collect();
        let stream = session.buffer[0].stream;
        let ansi = session.buffer.iter().any(|l| l.ansi);
        let bytes = session.buffered_bytes;
        let origin = session.origin_connection_id;

        session.buffer.clear();
        session.buffered_bytes = 0;
        session.last_flush_at = Instant::now();

        let pending = self.registry.pending_bytes(origin).await;
        let mut suppressed_now = self.suppressed.read().await.get(&origin).copied().unwrap_or(false);
        if suppressed_now && pending <= self.config.send_low_water {
            suppressed_now = false;
            self.suppressed.write().await.remove(&origin);
        }

        let elide = suppressed_now || pending >= self.config.send_high_water;
        if elide {
            self.suppressed.write().await.insert(origin, true);
            let marker = DashboardOutbound::TerminalStream {
                command_id: key.0,
                agent_id: key.1,
                content: String::new(),
                stream,
                ansi: false,
                elided: true,
                elided_bytes: Some(bytes),
            };
            self.send(origin, marker).await;
            return;
        }

        let payload = DashboardOutbound::TerminalStream {
            command_id: key.0,
            agent_id: key.1,
            content,
            stream,
            ansi,
            elided: false,
            elided_bytes: None,
        };
        self.send(origin, payload).await;
    }

    async fn send(&self, connection_id: Uuid, payload: DashboardOutbound) {
        let envelope = Envelope::new(Uuid::new_v4().to_string(), payload);
        let Ok(json) = serde_json::to_string(&envelope) else { return };
        if self.registry.send_to_connection(connection_id, json).await.is_err() {
            warn!(%connection_id, "terminal stream flush dropped, connection gone");
        }
    }

    /// Final flush and grace period before the session is garbage
    /// collected.
    pub async fn end_session(&self, command_id: Uuid, agent_id: Uuid) {
        let key = (command_id, agent_id);
        let mut sessions = self.sessions.write().await;
        self.flush_locked(&mut sessions, key).await;
        if let Some(session) = sessions.get_mut(&key) {
            session.ended_at = Some(Instant::now());
        }
    }

    async fn collect_garbage(&self) {
        let mut sessions = self.sessions.write().await;
        let linger = self.config.linger;
        let max_age = self.config.session_max_age;
        let before = sessions.len();
        sessions.retain(|_, s| {
            if let Some(ended_at) = s.ended_at {
                return ended_at.elapsed() < linger;
            }
            s.last_activity_at.elapsed() < max_age
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "terminal sessions garbage collected");
        }
    }

    pub fn spawn_background_tasks(&self, gc_cadence: StdDuration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let flush_interval = self.config.flush_interval;
        tokio::spawn(async move {
            let mut flush_ticker = interval(flush_interval);
            let mut gc_ticker = interval(gc_cadence);
            loop {
                tokio::select! {
                    _ = flush_ticker.tick() => manager.tick().await,
                    _ = gc_ticker.tick() => manager.collect_garbage().await,
                }
            }
        })
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Flushes every session with buffered output, used on graceful
    /// shutdown so in-flight terminal output is not lost mid-buffer.
    pub async fn flush_all(&self) {
        let keys: Vec<(Uuid, Uuid)> = self.sessions.read().await.keys().copied().collect();
        let mut sessions = self.sessions.write().await;
        for key in keys {
            self.flush_locked(&mut sessions, key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::connection_registry::ConnectionKind;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    fn test_config() -> TerminalStreamConfig {
        TerminalStreamConfig {
            buffer_bytes: 4096,
            buffer_lines: 50,
            flush_interval: StdDuration::from_millis(100),
            send_high_water: 1024 * 1024,
            send_low_water: 256 * 1024,
            linger: StdDuration::from_secs(5),
            session_max_age: StdDuration::from_secs(300),
        }
    }

    fn line(content: &str, stream: TerminalStreamKind) -> TerminalLine {
        TerminalLine { content: content.to_string(), stream, sequence: 0, timestamp: Utc::now(), ansi: false }
    }

    async fn dashboard_connection(registry: &ConnectionRegistry) -> (Uuid, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        registry
            .add(connection_id, ConnectionKind::Dashboard { user_id: Uuid::new_v4() }, tx, CancellationToken::new())
            .await;
        (connection_id, rx)
    }

    #[tokio::test]
    async fn stderr_line_triggers_immediate_flush() {
        let registry = ConnectionRegistry::new();
        let (connection_id, mut rx) = dashboard_connection(&registry).await;
        let manager = TerminalStreamManager::new(registry, test_config());
        let command_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();

        manager.submit(command_id, agent_id, connection_id, line("boom", TerminalStreamKind::Stderr)).await;

        let frame = rx.recv().await.expect("flush sent");
        assert!(frame.contains("\"TERMINAL_STREAM\""));
        assert!(frame.contains("boom"));
    }

    #[tokio::test]
    async fn content_order_preserved_across_accumulated_lines() {
        let registry = ConnectionRegistry::new();
        let (connection_id, mut rx) = dashboard_connection(&registry).await;
        let manager = TerminalStreamManager::new(registry, test_config());
        let command_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();

        for i in 0..5 {
            manager
                .submit(command_id, agent_id, connection_id, line(&format!("line{i}"), TerminalStreamKind::Stdout))
                .await;
        }
        manager.end_session(command_id, agent_id).await;

        let frame = rx.recv().await.expect("flush sent");
        assert!(frame.contains("line0line1line2line3line4"));
    }

    #[tokio::test]
    async fn saturated_connection_elides_with_gap_marker() {
        let registry = ConnectionRegistry::new();
        let (connection_id, mut rx) = dashboard_connection(&registry).await;
        let mut config = test_config();
        config.send_high_water = 1;
        let manager = TerminalStreamManager::new(registry.clone(), config);
        let command_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();

        registry.send_to_connection(connection_id, "x".repeat(10)).await.unwrap();
        let _ = rx.recv().await;

        manager.submit(command_id, agent_id, connection_id, line("data", TerminalStreamKind::Stdout)).await;
        let frame = rx.recv().await.expect("gap marker sent");
        assert!(frame.contains("\"elided\":true"));
    }

    #[tokio::test]
    async fn end_session_marks_for_linger_gc() {
        let registry = ConnectionRegistry::new();
        let (connection_id, _rx) = dashboard_connection(&registry).await;
        let manager = TerminalStreamManager::new(registry, test_config());
        let command_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        manager.submit(command_id, agent_id, connection_id, line("x", TerminalStreamKind::Stdout)).await;
        manager.end_session(command_id, agent_id).await;
        assert_eq!(manager.session_count().await, 1);
    }
}
