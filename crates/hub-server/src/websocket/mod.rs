pub mod agent_handler;
pub mod dashboard_handler;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::hub::ConnectionRegistry;

/// Drains the outbound channel onto the socket until cancelled or the
/// channel closes, acknowledging each frame against the registry's
/// per-connection backpressure counter once it is actually written.
pub(crate) async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::UnboundedReceiver<String>,
    registry: ConnectionRegistry,
    connection_id: Uuid,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = outbox.recv() => {
                let Some(frame) = frame else { break };
                let bytes = frame.len();
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
                registry.ack_sent(connection_id, bytes).await;
            }
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    debug!(%connection_id, "writer task exiting");
}
