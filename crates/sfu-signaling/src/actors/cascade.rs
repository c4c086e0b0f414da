//! Cascading closure of media entities.
//!
//! Closing an entity closes everything that depends on it, in the room's
//! bookkeeping as well as in the engine:
//!
//! ```text
//! peer ──► transports ──► producers ──► other peers' consumers
//!                    └──► consumers
//! ```
//!
//! Every other member hears exactly one `producerRemoved` per producer and
//! one `peerLeft` per departing peer, regardless of which entity triggered
//! the closure. A member whose egress queue overflows is evicted rather than
//! left out of step, and the room tears it down after the current request. Engine `close` calls are idempotent, so closing a consumer
//! the engine already cascaded is harmless.

use crate::errors::SfuError;
use crate::observability::metrics;
use crate::signaling::protocol::Notification;
use crate::signaling::Delivery;

use super::peer::PeerSession;

use common::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
use std::collections::BTreeMap;
use tracing::debug;

/// Entities closed by one cascade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub transports: u64,
    pub producers: u64,
    pub consumers: u64,
    /// Notifications actually queued to other members. A member whose queue
    /// overflowed is evicted instead and is not counted.
    pub notifications: u64,
}

impl CascadeReport {
    fn merge(&mut self, other: CascadeReport) {
        self.transports += other.transports;
        self.producers += other.producers;
        self.consumers += other.consumers;
        self.notifications += other.notifications;
    }

    /// Emit the `sfu_cascade_closed_total` counters.
    pub fn record(&self) {
        metrics::record_cascade_closed("transport", self.transports);
        metrics::record_cascade_closed("producer", self.producers);
        metrics::record_cascade_closed("consumer", self.consumers);
    }
}

/// Closure operations over one room's peers.
pub struct CascadeCleanup<'a> {
    room_id: &'a RoomId,
    peers: &'a mut BTreeMap<PeerId, PeerSession>,
}

impl<'a> CascadeCleanup<'a> {
    pub fn new(room_id: &'a RoomId, peers: &'a mut BTreeMap<PeerId, PeerSession>) -> Self {
        Self { room_id, peers }
    }

    /// Close a producer owned by `owner` and every consumer of it.
    pub async fn close_producer(
        &mut self,
        owner: &PeerId,
        producer_id: &ProducerId,
    ) -> Result<CascadeReport, SfuError> {
        let entry = self
            .peers
            .get_mut(owner)
            .ok_or_else(|| SfuError::PeerNotFound(owner.clone()))?
            .producers
            .remove(producer_id)
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.clone()))?;

        entry.producer.close().await;
        let mut report = CascadeReport {
            producers: 1,
            ..CascadeReport::default()
        };

        for (peer_id, peer) in self.peers.iter_mut() {
            let orphaned: Vec<ConsumerId> = peer
                .consumers
                .iter()
                .filter(|(_, c)| &c.producer_id == producer_id)
                .map(|(id, _)| id.clone())
                .collect();
            for consumer_id in orphaned {
                if let Some(consumer) = peer.consumers.remove(&consumer_id) {
                    consumer.consumer.close().await;
                    report.consumers += 1;
                }
            }

            if peer_id != owner {
                let delivery = peer.notify(Notification::ProducerRemoved {
                    room_id: self.room_id.clone(),
                    producer_id: producer_id.clone(),
                });
                if delivery == Delivery::Sent {
                    report.notifications += 1;
                }
            }
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %owner,
            producer_id = %producer_id,
            consumers_closed = report.consumers,
            "Producer closed"
        );
        Ok(report)
    }

    /// Close one of `peer_id`'s consumers. Nobody else is notified.
    pub async fn close_consumer(
        &mut self,
        peer_id: &PeerId,
        consumer_id: &ConsumerId,
    ) -> Result<CascadeReport, SfuError> {
        let entry = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))?
            .consumers
            .remove(consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.clone()))?;

        entry.consumer.close().await;
        Ok(CascadeReport {
            consumers: 1,
            ..CascadeReport::default()
        })
    }

    /// Close a transport with its producers and consumers.
    pub async fn close_transport(
        &mut self,
        peer_id: &PeerId,
        transport_id: &TransportId,
    ) -> Result<CascadeReport, SfuError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))?;
        if !peer.transports.contains_key(transport_id) {
            return Err(SfuError::TransportNotFound(transport_id.clone()));
        }
        let producers = peer.producers_on(transport_id);
        let consumers = peer.consumers_on(transport_id);

        let mut report = CascadeReport::default();
        for producer_id in &producers {
            report.merge(self.close_producer(peer_id, producer_id).await?);
        }
        for consumer_id in &consumers {
            // Already gone if it consumed one of the producers above
            if let Ok(closed) = self.close_consumer(peer_id, consumer_id).await {
                report.merge(closed);
            }
        }

        if let Some(entry) = self
            .peers
            .get_mut(peer_id)
            .and_then(|peer| peer.transports.remove(transport_id))
        {
            entry.transport.close().await;
            report.transports += 1;
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            producers_closed = report.producers,
            consumers_closed = report.consumers,
            "Transport closed"
        );
        Ok(report)
    }

    /// Remove a peer from the room, closing everything it owns.
    ///
    /// Other members receive `producerRemoved` for each of its producers,
    /// then one `peerLeft`.
    pub async fn teardown_peer(
        &mut self,
        peer_id: &PeerId,
    ) -> Result<(PeerSession, CascadeReport), SfuError> {
        let transports: Vec<TransportId> = self
            .peers
            .get(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))?
            .transports
            .keys()
            .cloned()
            .collect();

        let mut report = CascadeReport::default();
        for transport_id in &transports {
            report.merge(self.close_transport(peer_id, transport_id).await?);
        }

        let session = self
            .peers
            .remove(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))?;

        for peer in self.peers.values() {
            let delivery = peer.notify(Notification::PeerLeft {
                room_id: self.room_id.clone(),
                peer_id: peer_id.clone(),
            });
            if delivery == Delivery::Sent {
                report.notifications += 1;
            }
        }

        Ok((session, report))
    }
}
