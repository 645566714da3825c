//! HeartbeatManager: drives per-connection ping/pong, flags missed
//! deadlines. Ping/pong frames bypass the message router entirely, so this
//! manager talks straight to the [`ConnectionRegistry`] rather than
//! through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use hub_shared::protocol::PingPayload;

use crate::hub::connection_registry::ConnectionRegistry;
use crate::hub::events::HubEvent;

struct Tracked {
    missed: u32,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct HeartbeatManager {
    registry: ConnectionRegistry,
    events: mpsc::UnboundedSender<HubEvent>,
    tracked: Arc<RwLock<HashMap<Uuid, Tracked>>>,
    ping_interval: StdDuration,
    max_missed: u32,
}

impl HeartbeatManager {
    #[must_use]
    pub fn new(
        registry: ConnectionRegistry,
        events: mpsc::UnboundedSender<HubEvent>,
        ping_interval: StdDuration,
        max_missed: u32,
    ) -> Self {
        Self {
            registry,
            events,
            tracked: Arc::new(RwLock::new(HashMap::new())),
            ping_interval,
            max_missed,
        }
    }

    /// Encodes a PING frame the way the connection handler would for any
    /// other outbound message, without going through `MessageRouter`.
    fn ping_frame() -> String {
        let envelope = hub_shared::protocol::Envelope::new(
            Uuid::new_v4().to_string(),
            PingPayload { timestamp: Utc::now().timestamp_millis() },
        );
        serde_json::to_string(&envelope).unwrap_or_default()
    }

    pub async fn monitor(&self, connection_id: Uuid) {
        let cancel = CancellationToken::new();
        self.tracked.write().await.insert(connection_id, Tracked { missed: 0, cancel: cancel.clone() });

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(manager.ping_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if manager.registry.send_to_connection(connection_id, Self::ping_frame()).await.is_err() {
                            manager.stop(connection_id).await;
                            return;
                        }

                        let timed_out = {
                            let mut tracked = manager.tracked.write().await;
                            let Some(entry) = tracked.get_mut(&connection_id) else { return };
                            entry.missed += 1;
                            entry.missed >= manager.max_missed
                        };

                        if timed_out {
                            warn!(%connection_id, "heartbeat timeout, missed max consecutive pongs");
                            let _ = manager.events.send(HubEvent::ConnectionTimeout { connection_id });
                            manager.stop(connection_id).await;
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Resets the missed-pong counter on any pong received for this
    /// connection.
    pub async fn record_pong(&self, connection_id: Uuid, echoed_timestamp: i64) {
        let mut tracked = self.tracked.write().await;
        if let Some(entry) = tracked.get_mut(&connection_id) {
            entry.missed = 0;
        }
        let rtt = Utc::now().timestamp_millis() - echoed_timestamp;
        debug!(%connection_id, rtt_ms = rtt, "pong received");
    }

    pub async fn stop(&self, connection_id: Uuid) {
        if let Some(entry) = self.tracked.write().await.remove(&connection_id) {
            entry.cancel.cancel();
        }
    }
}
