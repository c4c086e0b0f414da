//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Replies travel back on `tokio::sync::oneshot`.

use crate::errors::SfuError;
use crate::signaling::{ClientRequest, PeerSink, SignalingResponse};

use super::room::RoomActorHandle;

use common::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportDirection, TransportId};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the room's actor, creating it if this is the first join.
    GetOrCreateRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// Return an existing room's actor.
    GetRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// Remove an empty room. Fails if peers are still present.
    RemoveRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// A room's last peer left (eager reclaim only).
    RoomEmptied { room_id: RoomId },

    /// Registry status for health checks and diagnostics.
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Initiate graceful shutdown.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// A peer enters the room.
    Join {
        peer_id: PeerId,
        sink: PeerSink,
        respond_to: oneshot::Sender<Result<JoinResult, SfuError>>,
    },

    /// A media request from a joined peer.
    Signal {
        peer_id: PeerId,
        request: ClientRequest,
        respond_to: oneshot::Sender<Result<SignalingResponse, SfuError>>,
    },

    /// A peer leaves, explicitly or because its connection closed.
    Leave {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Snapshot of the room for diagnostics.
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Close the room if it has no peers. Replies whether it closed.
    TryClose { respond_to: oneshot::Sender<bool> },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// One parsed request from the client.
    Request {
        request: ClientRequest,
        respond_to: oneshot::Sender<Result<SignalingResponse, SfuError>>,
    },

    /// The transport under the connection closed.
    Disconnect { respond_to: oneshot::Sender<()> },

    /// Current session state.
    GetState {
        respond_to: oneshot::Sender<ConnectionState>,
    },
}

// ---- Supporting Types ----

/// Result of joining a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResult {
    /// Other members at the time of joining.
    pub peers: Vec<PeerId>,
}

/// Registry status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub peer_count: usize,
    pub connection_count: usize,
    pub router_count: usize,
    /// Routers per worker, by worker index.
    pub worker_loads: Vec<usize>,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Room diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomState {
    pub room_id: RoomId,
    pub router_id: Option<String>,
    pub worker_index: Option<usize>,
    pub peers: Vec<PeerSummary>,
    pub is_closed: bool,
    pub mailbox_depth: usize,
}

/// One peer's media entities, as seen by its room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub transports: Vec<TransportSummary>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportSummary {
    pub transport_id: TransportId,
    pub direction: TransportDirection,
    pub connected: bool,
}

/// Connection session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub peer_id: PeerId,
    /// The room the peer is in, if joined.
    pub room_id: Option<RoomId>,
    pub is_closed: bool,
}
