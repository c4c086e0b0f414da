//! Signaling channel: wire format, per-peer egress and the WebSocket adapter.

pub mod protocol;
pub mod ws;

use crate::errors::SfuError;
use crate::observability::metrics;
use protocol::{Notification, ServerMessage};

use common::types::PeerId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

pub use protocol::{ClientEnvelope, ClientRequest, ErrorBody, InvalidFrame, SignalingResponse};

/// Outcome of a fire-and-forget delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Egress queue full. The notification was not queued and the peer is
    /// now evicted.
    Overflowed,
    /// The peer's channel is gone.
    Closed,
}

/// Write side of a peer's egress queue.
///
/// Notifications never wait, so a slow peer cannot stall the room that
/// broadcasts them. A peer whose queue overflows has missed room state it
/// cannot recover, so its sink is marked evicted: nothing further is queued
/// to it, the room removes it and its connection closes. Responses wait for
/// capacity.
#[derive(Debug, Clone)]
pub struct PeerSink {
    peer_id: PeerId,
    tx: mpsc::Sender<ServerMessage>,
    evicted: CancellationToken,
}

impl PeerSink {
    #[must_use]
    pub fn new(peer_id: PeerId, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            peer_id,
            tx,
            evicted: CancellationToken::new(),
        }
    }

    /// Create a sink and the receiving end of its egress queue.
    #[must_use]
    pub fn channel(peer_id: PeerId, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(peer_id, tx), rx)
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Queue a notification without waiting.
    ///
    /// Once the sink is evicted every later notification is refused too, so
    /// the peer never sees a stream with a gap in it.
    pub fn notify(&self, notification: Notification) -> Delivery {
        if self.evicted.is_cancelled() {
            return Delivery::Overflowed;
        }
        match self.tx.try_send(ServerMessage::Notification { notification }) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                metrics::record_notification_dropped();
                warn!(
                    target: "sfu.signaling",
                    peer_id = %self.peer_id,
                    "Egress queue full, evicting peer"
                );
                self.evicted.cancel();
                Delivery::Overflowed
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "sfu.signaling",
                    peer_id = %self.peer_id,
                    "Egress queue closed, notification discarded"
                );
                Delivery::Closed
            }
        }
    }

    /// Queue a response or error, waiting for capacity.
    pub async fn send(&self, message: ServerMessage) -> Result<(), SfuError> {
        self.tx
            .send(message)
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether a notification overflowed this peer's queue.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Resolves once the peer is evicted.
    pub fn evicted(&self) -> WaitForCancellationFuture<'_> {
        self.evicted.cancelled()
    }
}
