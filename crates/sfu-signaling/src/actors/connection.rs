//! `ConnectionActor` - per-signaling-connection actor.
//!
//! Each `ConnectionActor`:
//! - Handles exactly one signaling connection, and so one peer
//! - Tracks whether the peer has joined a room
//! - Resolves rooms through the registry and forwards media requests to
//!   the peer's `RoomActor`
//!
//! # Lifecycle
//!
//! ```text
//! Initial ──join──► Joined ──leave──► Initial
//!    │                 │
//!    └──disconnect─────┴──────────────► Closed
//! ```
//!
//! Every exit path (disconnect, cancellation, dropped handle) removes the
//! peer from its room, so a peer's transports, producers and consumers
//! never outlive its connection.

use crate::errors::SfuError;
use crate::observability::metrics;
use crate::signaling::{ClientRequest, PeerSink, SignalingResponse};

use super::messages::{ConnectionMessage, ConnectionState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomRegistryHandle;
use super::room::RoomActorHandle;

use common::types::{PeerId, RoomId};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
}

impl ConnectionActorHandle {
    /// Get the peer ID.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Process one client request and return its outcome.
    pub async fn request(&self, request: ClientRequest) -> Result<SignalingResponse, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ConnectionMessage::Request {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Report that the connection closed. Waits until the peer has been
    /// removed from its room.
    pub async fn disconnect(&self) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ConnectionMessage::Disconnect { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current session state.
    pub async fn get_state(&self) -> Result<ConnectionState, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ConnectionMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Where the peer is in its session.
enum SessionPhase {
    Initial,
    Joined {
        room_id: RoomId,
        room: RoomActorHandle,
    },
    Closed,
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    peer_id: PeerId,
    /// Egress queue shared with the room for notifications.
    sink: PeerSink,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    registry: RoomRegistryHandle,
    phase: SessionPhase,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        peer_id: PeerId,
        sink: PeerSink,
        registry: RoomRegistryHandle,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let cancel_token = registry.child_token();

        metrics.connection_opened();

        let actor = Self {
            peer_id: peer_id.clone(),
            sink,
            receiver,
            cancel_token: cancel_token.clone(),
            registry,
            phase: SessionPhase::Initial,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, peer_id.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            peer_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.connection", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.connection",
            peer_id = %self.peer_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.connection",
                        peer_id = %self.peer_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_receive(self.receiver.len());
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "sfu.actor.connection",
                                peer_id = %self.peer_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.close().await;
        self.metrics.connection_closed();

        info!(
            target: "sfu.actor.connection",
            peer_id = %self.peer_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Request {
                request,
                respond_to,
            } => {
                let request_type = request.request_type();
                let start = Instant::now();
                let result = self.handle_request(request).await;

                let status = match &result {
                    Ok(_) => "success",
                    Err(e) => e.error_type_label(),
                };
                metrics::record_signaling_request(request_type, status, start.elapsed());

                if let Err(e) = &result {
                    debug!(
                        target: "sfu.actor.connection",
                        peer_id = %self.peer_id,
                        request_type,
                        error = %e,
                        "Request failed"
                    );
                }

                let _ = respond_to.send(result);
                false
            }

            ConnectionMessage::Disconnect { respond_to } => {
                self.close().await;
                let _ = respond_to.send(());
                true
            }

            ConnectionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
                false
            }
        }
    }

    async fn handle_request(
        &mut self,
        request: ClientRequest,
    ) -> Result<SignalingResponse, SfuError> {
        if matches!(self.phase, SessionPhase::Closed) {
            return Err(SfuError::ProtocolViolation("session is closed".to_string()));
        }

        match request {
            ClientRequest::Join { room_id } => {
                if matches!(self.phase, SessionPhase::Joined { .. }) {
                    return Err(SfuError::ProtocolViolation(
                        "already joined a room".to_string(),
                    ));
                }
                self.join(room_id).await
            }

            ClientRequest::Leave => {
                let SessionPhase::Joined { room_id, room } = &self.phase else {
                    return Err(SfuError::ProtocolViolation("not in a room".to_string()));
                };
                let room_id = room_id.clone();
                let result = room.leave(self.peer_id.clone()).await;
                self.phase = SessionPhase::Initial;
                result?;
                Ok(SignalingResponse::Left { room_id })
            }

            request => {
                let SessionPhase::Joined { room, .. } = &self.phase else {
                    return Err(SfuError::ProtocolViolation("join a room first".to_string()));
                };
                room.signal(self.peer_id.clone(), request).await
            }
        }
    }

    /// Join a room, resolving it again once if it closed underneath us.
    async fn join(&mut self, room_id: RoomId) -> Result<SignalingResponse, SfuError> {
        let mut attempts = 0;
        let (room, result) = loop {
            attempts += 1;
            let room = self.registry.get_or_create_room(room_id.clone()).await?;
            match room.join(self.peer_id.clone(), self.sink.clone()).await {
                Err(SfuError::RoomNotFound(_)) if attempts < 2 => {
                    debug!(
                        target: "sfu.actor.connection",
                        peer_id = %self.peer_id,
                        room_id = %room_id,
                        "Room closed during join, retrying"
                    );
                }
                result => break (room, result?),
            }
        };

        self.phase = SessionPhase::Joined {
            room_id: room_id.clone(),
            room,
        };

        Ok(SignalingResponse::Joined {
            room_id,
            peer_id: self.peer_id.clone(),
            peers: result.peers,
        })
    }

    /// Leave the current room, if any, and refuse further requests.
    async fn close(&mut self) {
        let phase = std::mem::replace(&mut self.phase, SessionPhase::Closed);
        if let SessionPhase::Joined { room_id, room } = phase {
            match room.leave(self.peer_id.clone()).await {
                Ok(()) => {}
                // Already evicted by the room
                Err(SfuError::PeerNotFound(_)) => {
                    debug!(
                        target: "sfu.actor.connection",
                        peer_id = %self.peer_id,
                        room_id = %room_id,
                        "Peer already removed from room"
                    );
                }
                Err(e) => {
                    warn!(
                        target: "sfu.actor.connection",
                        peer_id = %self.peer_id,
                        room_id = %room_id,
                        error = %e,
                        "Leave on disconnect failed"
                    );
                }
            }
        }
    }

    fn state(&self) -> ConnectionState {
        let (room_id, is_closed) = match &self.phase {
            SessionPhase::Initial => (None, false),
            SessionPhase::Joined { room_id, .. } => (Some(room_id.clone()), false),
            SessionPhase::Closed => (None, true),
        };
        ConnectionState {
            peer_id: self.peer_id.clone(),
            room_id,
            is_closed,
        }
    }
}
