//! Per-peer media state owned by a room.
//!
//! A peer holds at most one transport per direction. Producers live on the
//! sender transport, consumers on the receiver transport, and a peer
//! consumes a given producer at most once.

use crate::engine::{EngineConsumer, EngineProducer, EngineTransport};
use crate::signaling::protocol::Notification;
use crate::signaling::{Delivery, PeerSink};

use super::messages::{PeerSummary, TransportSummary};

use common::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportDirection, TransportId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// DTLS progress of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    /// `connect` is in flight on the engine.
    Connecting,
    Connected,
}

pub struct TransportEntry {
    pub transport: Arc<dyn EngineTransport>,
    pub direction: TransportDirection,
    pub state: TransportState,
}

pub struct ProducerEntry {
    pub producer: Arc<dyn EngineProducer>,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub paused: bool,
}

pub struct ConsumerEntry {
    pub consumer: Arc<dyn EngineConsumer>,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    /// Consumers start paused until the client resumes them.
    pub paused: bool,
}

/// A peer's membership in a room.
pub struct PeerSession {
    pub peer_id: PeerId,
    pub sink: PeerSink,
    pub transports: BTreeMap<TransportId, TransportEntry>,
    pub producers: BTreeMap<ProducerId, ProducerEntry>,
    pub consumers: BTreeMap<ConsumerId, ConsumerEntry>,
}

impl PeerSession {
    #[must_use]
    pub fn new(peer_id: PeerId, sink: PeerSink) -> Self {
        Self {
            peer_id,
            sink,
            transports: BTreeMap::new(),
            producers: BTreeMap::new(),
            consumers: BTreeMap::new(),
        }
    }

    /// The peer's transport for `direction`, if created.
    #[must_use]
    pub fn transport_for(
        &self,
        direction: TransportDirection,
    ) -> Option<(&TransportId, &TransportEntry)> {
        self.transports
            .iter()
            .find(|(_, entry)| entry.direction == direction)
    }

    #[must_use]
    pub fn producer_of_kind(&self, kind: MediaKind) -> Option<&ProducerId> {
        self.producers
            .iter()
            .find(|(_, entry)| entry.kind == kind)
            .map(|(id, _)| id)
    }

    /// The peer's consumer of `producer_id`, if any.
    #[must_use]
    pub fn consumer_of(&self, producer_id: &ProducerId) -> Option<&ConsumerId> {
        self.consumers
            .iter()
            .find(|(_, entry)| &entry.producer_id == producer_id)
            .map(|(id, _)| id)
    }

    /// Producers carried by `transport_id`.
    #[must_use]
    pub fn producers_on(&self, transport_id: &TransportId) -> Vec<ProducerId> {
        self.producers
            .iter()
            .filter(|(_, entry)| &entry.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Consumers carried by `transport_id`.
    #[must_use]
    pub fn consumers_on(&self, transport_id: &TransportId) -> Vec<ConsumerId> {
        self.consumers
            .iter()
            .filter(|(_, entry)| &entry.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn notify(&self, notification: Notification) -> Delivery {
        self.sink.notify(notification)
    }

    #[must_use]
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            transports: self
                .transports
                .iter()
                .map(|(id, entry)| TransportSummary {
                    transport_id: id.clone(),
                    direction: entry.direction,
                    connected: entry.state == TransportState::Connected,
                })
                .collect(),
            producers: self.producers.keys().cloned().collect(),
            consumers: self.consumers.keys().cloned().collect(),
        }
    }
}
