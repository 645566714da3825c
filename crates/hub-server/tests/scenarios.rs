//! End-to-end scenario tests that wire the hub's components together the
//! way `AppState` does, rather than exercising any one component in
//! isolation. Uses in-memory repository fakes; no database or real socket
//! is involved.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hub_server::auth::{TokenVerifier, VerifiedToken};
use hub_server::hub::{
    CommandTracker, ConnectionKind, ConnectionRegistry, HeartbeatManager, HubEvent, MessageRouter, OfflineQueue,
    TerminalStreamConfig, TerminalStreamManager, TokenManager,
};
use hub_server::repositories::{InMemoryAgentRepo, InMemoryAuditRepo, InMemoryCommandRepo};
use hub_shared::{CommandStatus, HubError, TerminalLine, TerminalStreamKind};

struct Harness {
    registry: ConnectionRegistry,
    router: MessageRouter,
    offline_queue: OfflineQueue,
}

fn harness() -> Harness {
    let registry = ConnectionRegistry::new();
    let command_tracker = CommandTracker::new();
    let offline_queue = OfflineQueue::new(1024, Duration::from_secs(900));
    let terminal_streams = TerminalStreamManager::new(
        registry.clone(),
        TerminalStreamConfig {
            buffer_bytes: 4096,
            buffer_lines: 50,
            flush_interval: Duration::from_millis(50),
            send_high_water: 1024 * 1024,
            send_low_water: 256 * 1024,
            linger: Duration::from_secs(5),
            session_max_age: Duration::from_secs(300),
        },
    );
    let router = MessageRouter::new(
        registry.clone(),
        command_tracker,
        offline_queue.clone(),
        terminal_streams,
        Arc::new(InMemoryAgentRepo::new()),
        Arc::new(InMemoryCommandRepo::new()),
        Arc::new(InMemoryAuditRepo::new()),
    );
    Harness { registry, router, offline_queue }
}

async fn add_dashboard(registry: &ConnectionRegistry) -> (Uuid, UnboundedReceiver<String>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let connection_id = Uuid::new_v4();
    registry.add(connection_id, ConnectionKind::Dashboard { user_id: Uuid::new_v4() }, tx, CancellationToken::new()).await;
    (connection_id, rx)
}

async fn bind_agent(registry: &ConnectionRegistry, agent_id: Uuid) -> (Uuid, UnboundedReceiver<String>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let connection_id = Uuid::new_v4();
    registry.bind_agent(connection_id, agent_id, tx, CancellationToken::new()).await;
    (connection_id, rx)
}

fn command_id_in(frame: &str, command_id: Uuid) -> bool {
    frame.contains(&command_id.to_string())
}

#[tokio::test]
async fn offline_queue_drains_highest_priority_first_on_reconnect() {
    let h = harness();
    let (d1, mut d1_rx) = add_dashboard(&h.registry).await;
    let agent_id = Uuid::new_v4();

    let c1 = h.router.route_command_request(d1, Uuid::new_v4(), vec![agent_id], false, 5, json!({"i": 1})).await.unwrap();
    let c2 = h.router.route_command_request(d1, Uuid::new_v4(), vec![agent_id], false, 5, json!({"i": 2})).await.unwrap();
    let c3 = h.router.route_command_request(d1, Uuid::new_v4(), vec![agent_id], false, 9, json!({"i": 3})).await.unwrap();

    for _ in 0..3 {
        assert!(d1_rx.recv().await.unwrap().contains("COMMAND_QUEUED"));
    }

    let (agent_connection, mut agent_rx) = bind_agent(&h.registry, agent_id).await;
    h.router.drain_offline_queue(agent_id, agent_connection).await;

    // Expected delivery order to the agent: c3 (priority 9), then c1, c2 (FIFO within priority 5).
    let expected_order = [c3.command_id, c1.command_id, c2.command_id];
    for expected in expected_order {
        let status_frame = d1_rx.recv().await.unwrap();
        assert!(status_frame.contains("COMMAND_STATUS"));
        assert!(command_id_in(&status_frame, expected));

        let agent_frame = agent_rx.recv().await.unwrap();
        assert!(command_id_in(&agent_frame, expected));
    }

    assert_eq!(h.offline_queue.len(agent_id).await, 0);
}

#[tokio::test]
async fn dashboard_isolation_status_and_terminal_output_reach_only_their_origin() {
    let h = harness();
    let (d1, mut d1_rx) = add_dashboard(&h.registry).await;
    let (d2, mut d2_rx) = add_dashboard(&h.registry).await;
    let (d3, mut d3_rx) = add_dashboard(&h.registry).await;
    let agent_id = Uuid::new_v4();
    bind_agent(&h.registry, agent_id).await;

    let c1 = h.router.route_command_request(d1, Uuid::new_v4(), vec![agent_id], false, 0, json!({})).await.unwrap();
    let _ = d1_rx.recv().await; // COMMAND_QUEUED on d1
    let c2 = h.router.route_command_request(d2, Uuid::new_v4(), vec![agent_id], false, 0, json!({})).await.unwrap();
    let _ = d2_rx.recv().await; // COMMAND_QUEUED on d2

    h.router.route_command_status(c1.command_id, CommandStatus::Executing, None).await;
    let status_frame = d1_rx.recv().await.unwrap();
    assert!(status_frame.contains("COMMAND_STATUS"));
    assert!(command_id_in(&status_frame, c1.command_id));

    h.router.route_terminal_output(
        c2.command_id,
        agent_id,
        TerminalLine { content: "hi".to_string(), stream: TerminalStreamKind::Stdout, sequence: 0, timestamp: chrono::Utc::now(), ansi: false },
    ).await;
    let terminal_frame = d2_rx.recv().await.unwrap();
    assert!(terminal_frame.contains("TERMINAL_STREAM"));
    assert!(terminal_frame.contains("hi"));

    // Neither message crosses over, and the uninvolved dashboard gets nothing.
    assert!(d2_rx.try_recv().is_err());
    assert!(d1_rx.try_recv().is_err());
    assert!(d3_rx.try_recv().is_err());
    let _ = d3;
}

#[tokio::test]
async fn agent_supersede_closes_evicted_connection_and_cancels_its_command() {
    let h = harness();
    let (d1, mut d1_rx) = add_dashboard(&h.registry).await;
    let agent_id = Uuid::new_v4();
    let (old_connection, mut old_rx) = bind_agent(&h.registry, agent_id).await;

    let c1 = h.router.route_command_request(d1, Uuid::new_v4(), vec![agent_id], false, 0, json!({})).await.unwrap();
    let _ = d1_rx.recv().await; // COMMAND_QUEUED
    let _ = old_rx.recv().await; // forwarded COMMAND_REQUEST
    h.router.route_command_status(c1.command_id, CommandStatus::Executing, None).await;
    let _ = d1_rx.recv().await; // COMMAND_STATUS executing

    let (new_tx, _new_rx) = tokio::sync::mpsc::unbounded_channel();
    let new_connection = Uuid::new_v4();
    let superseded = h.registry.bind_agent(new_connection, agent_id, new_tx, CancellationToken::new()).await;
    assert_eq!(superseded, Some(old_connection));
    h.router.handle_superseded_connection(old_connection, agent_id).await;

    let error_frame = old_rx.recv().await.unwrap();
    assert!(error_frame.contains("Superseded"));

    let cancelled_frame = d1_rx.recv().await.unwrap();
    assert!(cancelled_frame.contains("COMMAND_STATUS"));
    assert!(cancelled_frame.to_lowercase().contains("cancelled"));

    assert_eq!(h.registry.find_by_agent(agent_id).await, Some(new_connection));
}

#[tokio::test]
async fn terminal_output_coalesces_and_stderr_forces_immediate_flush() {
    let h = harness();
    let (d1, mut d1_rx) = add_dashboard(&h.registry).await;
    let agent_id = Uuid::new_v4();
    bind_agent(&h.registry, agent_id).await;

    let command = h.router.route_command_request(d1, Uuid::new_v4(), vec![agent_id], false, 0, json!({})).await.unwrap();
    let _ = d1_rx.recv().await; // COMMAND_QUEUED

    let mut expected = String::new();
    for i in 0..5 {
        let content = format!("line{i}\n");
        expected.push_str(&content);
        h.router.route_terminal_output(
            command.command_id,
            agent_id,
            TerminalLine { content, stream: TerminalStreamKind::Stdout, sequence: 0, timestamp: chrono::Utc::now(), ansi: false },
        ).await;
    }
    // Below buffer/line thresholds, so nothing has flushed yet.
    assert!(d1_rx.try_recv().is_err());

    h.router.route_terminal_output(
        command.command_id,
        agent_id,
        TerminalLine { content: "boom\n".to_string(), stream: TerminalStreamKind::Stderr, sequence: 0, timestamp: chrono::Utc::now(), ansi: false },
    ).await;

    let frame = d1_rx.recv().await.unwrap();
    assert!(frame.contains("TERMINAL_STREAM"));
    expected.push_str("boom\n");
    let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(parsed["content"].as_str().unwrap(), expected);
}

#[tokio::test]
async fn emergency_stop_cancels_running_and_queued_commands_and_clears_queues() {
    let h = harness();
    let (d1, mut d1_rx) = add_dashboard(&h.registry).await;
    let running_agent = Uuid::new_v4();
    let offline_agent = Uuid::new_v4();
    bind_agent(&h.registry, running_agent).await;

    let c1 = h.router.route_command_request(d1, Uuid::new_v4(), vec![running_agent], false, 0, json!({})).await.unwrap();
    let _ = d1_rx.recv().await; // COMMAND_QUEUED
    h.router.route_command_status(c1.command_id, CommandStatus::Executing, None).await;
    let _ = d1_rx.recv().await; // COMMAND_STATUS executing

    let c2 = h.router.route_command_request(d1, Uuid::new_v4(), vec![offline_agent], false, 0, json!({})).await.unwrap();
    let _ = d1_rx.recv().await; // COMMAND_QUEUED
    assert_eq!(h.offline_queue.len(offline_agent).await, 1);

    h.router.emergency_stop("drill".to_string()).await;

    let mut cancelled = Vec::new();
    for _ in 0..2 {
        let frame = d1_rx.recv().await.unwrap();
        assert!(frame.to_lowercase().contains("cancelled"));
        cancelled.push(frame);
    }
    assert!(cancelled.iter().any(|f| command_id_in(f, c1.command_id)));
    assert!(cancelled.iter().any(|f| command_id_in(f, c2.command_id)));
    assert_eq!(h.offline_queue.len(offline_agent).await, 0);
}

struct ExpiringNoRefresh;

#[async_trait]
impl TokenVerifier for ExpiringNoRefresh {
    async fn verify(&self, _token: &str) -> Result<VerifiedToken, HubError> {
        Err(HubError::Unauthorized)
    }
    async fn refresh(&self, _refresh_token: &str) -> Result<(String, VerifiedToken), HubError> {
        Err(HubError::InvalidRefreshToken)
    }
}

#[tokio::test(start_paused = true)]
async fn token_expiry_with_no_refresh_token_closes_connection_and_retires_tracking() {
    let h = harness();
    let (d1, _d1_rx) = add_dashboard(&h.registry).await;
    let agent_id = Uuid::new_v4();
    bind_agent(&h.registry, agent_id).await;

    let command_tracker = CommandTracker::new();
    command_tracker.register(Uuid::new_v4(), d1).await;

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel::<HubEvent>();
    let token_manager = TokenManager::new(Arc::new(ExpiringNoRefresh), events_tx, Duration::from_secs(30));
    // Token expires in 90s, refresh lead 30s -> fires at t=60s with no refresh token.
    token_manager
        .register_token(d1, chrono::Utc::now() + chrono::Duration::seconds(90), None)
        .await;

    tokio::time::advance(Duration::from_secs(61)).await;
    let event = events_rx.recv().await.unwrap();
    assert!(matches!(event, HubEvent::TokenExpired { connection_id } if connection_id == d1));

    h.registry.close(d1).await;
    let retired = command_tracker.retire_all_from_connection(d1).await;
    assert_eq!(retired.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_after_max_missed_pongs_fires_connection_timeout() {
    let registry = ConnectionRegistry::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let connection_id = Uuid::new_v4();
    registry.add(connection_id, ConnectionKind::Dashboard { user_id: Uuid::new_v4() }, tx, CancellationToken::new()).await;

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let heartbeat = HeartbeatManager::new(registry, events_tx, Duration::from_millis(10), 2);
    heartbeat.monitor(connection_id).await;

    tokio::time::advance(Duration::from_millis(11)).await;
    let _ = rx.recv().await; // first PING, unanswered
    tokio::time::advance(Duration::from_millis(11)).await;
    let _ = rx.recv().await; // second PING, unanswered

    let event = events_rx.recv().await.unwrap();
    assert!(matches!(event, HubEvent::ConnectionTimeout { connection_id: c } if c == connection_id));
}
