//! WebSocket adapter for the signaling channel.
//!
//! Each socket becomes one peer: a `ConnectionActor` handles its requests
//! and a writer task drains its egress queue onto the socket. Responses and
//! notifications share that queue, so a peer sees them in the order the
//! core produced them.

use crate::actors::{ActorMetrics, ConnectionActor, RoomRegistryHandle};
use crate::errors::SfuError;

use super::protocol::{ClientEnvelope, ServerMessage};
use super::PeerSink;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use common::types::PeerId;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long a closing socket waits for its queued frames to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by every signaling socket.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: RoomRegistryHandle,
    pub metrics: Arc<ActorMetrics>,
    /// Capacity of each peer's egress queue.
    pub egress_buffer: usize,
}

/// Create the signaling router.
///
/// Routes:
/// - `GET /ws` - upgrade to a signaling WebSocket
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one signaling connection until either side closes it.
async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let peer_id = PeerId::new();
    let (sink, egress) = PeerSink::channel(peer_id.clone(), state.egress_buffer);
    let (connection, task_handle) = ConnectionActor::spawn(
        peer_id.clone(),
        sink.clone(),
        state.registry.clone(),
        Arc::clone(&state.metrics),
    );
    let cancel_token = state.registry.child_token();

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_frames(peer_id.clone(), ws_tx, egress));

    info!(target: "sfu.signaling", peer_id = %peer_id, "Signaling connection opened");

    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => break,
            () = sink.evicted() => {
                warn!(
                    target: "sfu.signaling",
                    peer_id = %peer_id,
                    "Peer fell behind on notifications, closing connection"
                );
                break;
            }
            frame = ws_rx.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                let reply = ServerMessage::error(
                    None,
                    &SfuError::InvalidMessage("binary frames are not supported".to_string()),
                );
                if sink.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(
                    target: "sfu.signaling",
                    peer_id = %peer_id,
                    error = %e,
                    "WebSocket read failed"
                );
                break;
            }
        };

        let reply = match ClientEnvelope::parse(&text) {
            Ok(envelope) => {
                let result = connection.request(envelope.request).await;
                if let Err(e) = &result {
                    if e.is_fatal() {
                        // The process is going down; the peer is not told why
                        error!(
                            target: "sfu.signaling",
                            peer_id = %peer_id,
                            error = %e,
                            "Fatal engine failure during request"
                        );
                        break;
                    }
                }
                ServerMessage::reply(envelope.id, &result)
            }
            Err(invalid) => ServerMessage::error(invalid.id, &invalid.error),
        };

        if sink.send(reply).await.is_err() {
            break;
        }
    }

    if let Err(e) = connection.disconnect().await {
        debug!(
            target: "sfu.signaling",
            peer_id = %peer_id,
            error = %e,
            "Connection already stopped"
        );
    }
    drop(connection);
    drop(sink);
    if let Err(e) = task_handle.await {
        warn!(
            target: "sfu.signaling",
            peer_id = %peer_id,
            error = ?e,
            "Connection actor failed"
        );
    }

    // The egress queue closes once the room and the connection actor have
    // dropped their sinks; give the writer a moment to flush.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
        debug!(target: "sfu.signaling", peer_id = %peer_id, "Writer did not drain in time");
    }

    info!(target: "sfu.signaling", peer_id = %peer_id, "Signaling connection closed");
}

/// Serialize queued messages onto the socket until the queue closes.
async fn write_frames<S>(
    peer_id: PeerId,
    mut ws_tx: S,
    mut egress: mpsc::Receiver<ServerMessage>,
) where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = egress.recv().await {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "sfu.signaling",
                    peer_id = %peer_id,
                    error = %e,
                    "Dropping unencodable frame"
                );
                continue;
            }
        };
        if let Err(e) = ws_tx.send(Message::Text(text)).await {
            debug!(
                target: "sfu.signaling",
                peer_id = %peer_id,
                error = %e,
                "WebSocket write failed"
            );
            break;
        }
    }
    let _ = ws_tx.close().await;
}
