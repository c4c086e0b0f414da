//! `RoomActor` - per-room actor that owns room state.
//!
//! Each `RoomActor`:
//! - Owns the membership map and every peer's transports, producers and
//!   consumers
//! - Acquires the room's router on first join and releases it on close
//! - Broadcasts room events to other members through their `PeerSink`s
//!
//! All mutations run on the actor task, one message at a time, so a peer's
//! requests are applied in the order they were sent and cleanup never races
//! an in-flight engine call.
//!
//! # Reclaim
//!
//! Under the eager policy the room tells the registry when its last peer
//! leaves. The registry then asks the room to close; a room that gained a
//! member in between refuses and stays open.

use crate::config::{ReclaimPolicy, RoomSettings};
use crate::engine::WebRtcTransportOptions;
use crate::errors::SfuError;
use crate::routers::{RoomRouter, RouterRegistry};
use crate::signaling::protocol::Notification;
use crate::signaling::{ClientRequest, PeerSink, SignalingResponse};

use super::cascade::CascadeCleanup;
use super::messages::{JoinResult, RegistryMessage, RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::peer::{ConsumerEntry, PeerSession, ProducerEntry, TransportEntry, TransportState};

use common::types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Shared dependencies handed to every room.
#[derive(Clone)]
pub struct RoomContext {
    pub routers: Arc<RouterRegistry>,
    pub settings: Arc<RoomSettings>,
    pub reclaim: ReclaimPolicy,
    pub metrics: Arc<ActorMetrics>,
    /// Registry mailbox for emptied notices. Weak so rooms never keep the
    /// registry alive.
    pub registry: mpsc::WeakSender<RegistryMessage>,
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
}

impl RoomActorHandle {
    /// Get the room ID.
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Add a peer to the room.
    ///
    /// Fails with `RoomNotFound` if the room closed after it was looked up;
    /// callers resolve the room again and retry.
    pub async fn join(&self, peer_id: PeerId, sink: PeerSink) -> Result<JoinResult, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                peer_id,
                sink,
                respond_to: tx,
            })
            .await
            .map_err(|_| SfuError::RoomNotFound(self.room_id.clone()))?;

        rx.await
            .map_err(|_| SfuError::RoomNotFound(self.room_id.clone()))?
    }

    /// Apply a media request on behalf of a joined peer.
    pub async fn signal(
        &self,
        peer_id: PeerId,
        request: ClientRequest,
    ) -> Result<SignalingResponse, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Signal {
                peer_id,
                request,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a peer and everything it owns.
    pub async fn leave(&self, peer_id: PeerId) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::Leave {
                peer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get the current room state.
    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Close the room if it is empty. Returns whether it closed.
    pub async fn try_close(&self) -> Result<bool, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RoomMessage::TryClose { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: RoomId,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    ctx: RoomContext,
    /// Set once the first peer joins.
    router: Option<RoomRouter>,
    peers: BTreeMap<PeerId, PeerSession>,
    mailbox: MailboxMonitor,
    /// No further joins are accepted.
    closed: bool,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: RoomId,
        cancel_token: CancellationToken,
        ctx: RoomContext,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            ctx,
            router: None,
            peers: BTreeMap::new(),
            mailbox: MailboxMonitor::new(ActorType::Room, room_id.as_str()),
            closed: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_receive(self.receiver.len());
                            let should_exit = self.handle_message(message).await;
                            self.evict_overflowed().await;
                            self.mailbox.record_processed(self.receiver.len());
                            self.ctx.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peers_remaining = self.peers.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::Join {
                peer_id,
                sink,
                respond_to,
            } => {
                let result = self.join(peer_id, sink).await;
                let _ = respond_to.send(result);
                false
            }

            RoomMessage::Signal {
                peer_id,
                request,
                respond_to,
            } => {
                let result = self.signal(&peer_id, request).await;
                let _ = respond_to.send(result);
                false
            }

            RoomMessage::Leave {
                peer_id,
                respond_to,
            } => {
                let result = self.leave(&peer_id).await;
                let _ = respond_to.send(result);
                false
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
                false
            }

            RoomMessage::TryClose { respond_to } => {
                let closed = self.try_close().await;
                let _ = respond_to.send(closed);
                closed
            }
        }
    }

    fn router(&self) -> Result<&RoomRouter, SfuError> {
        self.router
            .as_ref()
            .ok_or_else(|| SfuError::Internal("room has no router".to_string()))
    }

    fn peer(&self, peer_id: &PeerId) -> Result<&PeerSession, SfuError> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))
    }

    fn peer_mut(&mut self, peer_id: &PeerId) -> Result<&mut PeerSession, SfuError> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))
    }

    /// Send `notification` to every member except `except`.
    fn broadcast(&self, except: &PeerId, notification: &Notification) {
        for (peer_id, peer) in &self.peers {
            if peer_id != except {
                peer.notify(notification.clone());
            }
        }
    }

    async fn join(&mut self, peer_id: PeerId, sink: PeerSink) -> Result<JoinResult, SfuError> {
        if self.closed {
            return Err(SfuError::RoomNotFound(self.room_id.clone()));
        }
        if self.peers.contains_key(&peer_id) {
            return Err(SfuError::ProtocolViolation(
                "peer is already in this room".to_string(),
            ));
        }

        if self.router.is_none() {
            let router = self.ctx.routers.get_or_create(&self.room_id).await?;
            debug!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                router_id = %router.router.id(),
                worker_index = router.worker.index,
                "Router acquired"
            );
            self.router = Some(router);
        }

        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        self.broadcast(
            &peer_id,
            &Notification::PeerJoined {
                room_id: self.room_id.clone(),
                peer_id: peer_id.clone(),
            },
        );

        let session = PeerSession::new(peer_id.clone(), sink);
        for (owner, peer) in &self.peers {
            for (producer_id, entry) in &peer.producers {
                session.notify(Notification::ProducerAvailable {
                    room_id: self.room_id.clone(),
                    producer_id: producer_id.clone(),
                    peer_id: owner.clone(),
                    kind: entry.kind,
                });
            }
        }

        self.peers.insert(peer_id.clone(), session);
        self.ctx.metrics.peer_joined();

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peer_count = self.peers.len(),
            "Peer joined"
        );

        Ok(JoinResult { peers })
    }

    async fn signal(
        &mut self,
        peer_id: &PeerId,
        request: ClientRequest,
    ) -> Result<SignalingResponse, SfuError> {
        self.peer(peer_id)?;

        match request {
            ClientRequest::GetRouterCapabilities => Ok(SignalingResponse::RouterCapabilities {
                rtp_capabilities: self.router()?.router.rtp_capabilities(),
            }),

            ClientRequest::CreateTransport { direction } => {
                self.create_transport(peer_id, direction).await
            }

            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.connect_transport(peer_id, transport_id, dtls_parameters)
                    .await
            }

            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                self.produce(peer_id, transport_id, kind, rtp_parameters)
                    .await
            }

            ClientRequest::Consume {
                producer_id,
                rtp_capabilities,
            } => self.consume(peer_id, producer_id, rtp_capabilities).await,

            ClientRequest::Resume { consumer_id } => {
                self.resume_consumer(peer_id, consumer_id).await
            }

            ClientRequest::PauseProducer { producer_id } => {
                self.set_producer_paused(peer_id, &producer_id, true).await?;
                Ok(SignalingResponse::ProducerPaused { producer_id })
            }

            ClientRequest::ResumeProducer { producer_id } => {
                self.set_producer_paused(peer_id, &producer_id, false)
                    .await?;
                Ok(SignalingResponse::ProducerResumed { producer_id })
            }

            ClientRequest::CloseTransport { transport_id } => {
                let report = CascadeCleanup::new(&self.room_id, &mut self.peers)
                    .close_transport(peer_id, &transport_id)
                    .await?;
                report.record();
                Ok(SignalingResponse::TransportClosed { transport_id })
            }

            ClientRequest::CloseProducer { producer_id } => {
                let report = CascadeCleanup::new(&self.room_id, &mut self.peers)
                    .close_producer(peer_id, &producer_id)
                    .await?;
                report.record();
                Ok(SignalingResponse::ProducerClosed { producer_id })
            }

            ClientRequest::CloseConsumer { consumer_id } => {
                let report = CascadeCleanup::new(&self.room_id, &mut self.peers)
                    .close_consumer(peer_id, &consumer_id)
                    .await?;
                report.record();
                Ok(SignalingResponse::ConsumerClosed { consumer_id })
            }

            ClientRequest::Chat { text } => {
                self.broadcast(
                    peer_id,
                    &Notification::ChatMessage {
                        room_id: self.room_id.clone(),
                        peer_id: peer_id.clone(),
                        text,
                    },
                );
                Ok(SignalingResponse::ChatSent)
            }

            ClientRequest::Join { .. } | ClientRequest::Leave => Err(SfuError::Internal(
                "membership changes are not room signals".to_string(),
            )),
        }
    }

    fn transport_options(&self, router: &RoomRouter) -> WebRtcTransportOptions {
        let settings = &self.ctx.settings.transport;
        WebRtcTransportOptions {
            listen_ip: settings.listen_ip,
            announced_address: settings.announced_address.clone(),
            port_range: router.worker.port_range,
            enable_udp: settings.enable_udp,
            enable_tcp: settings.enable_tcp,
            prefer_udp: settings.prefer_udp,
            initial_available_outgoing_bitrate: settings.initial_available_outgoing_bitrate,
            max_incoming_bitrate: settings.max_incoming_bitrate,
        }
    }

    async fn create_transport(
        &mut self,
        peer_id: &PeerId,
        direction: TransportDirection,
    ) -> Result<SignalingResponse, SfuError> {
        if self.peer(peer_id)?.transport_for(direction).is_some() {
            return Err(SfuError::ProtocolViolation(format!(
                "{direction} transport already exists"
            )));
        }

        let router = self.router()?.clone();
        let options = self.transport_options(&router);
        let transport = router.router.create_webrtc_transport(&options).await?;
        let parameters = transport.parameters();

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %parameters.id,
            direction = %direction,
            "Transport created"
        );

        self.peer_mut(peer_id)?.transports.insert(
            parameters.id.clone(),
            TransportEntry {
                transport,
                direction,
                state: TransportState::Created,
            },
        );

        Ok(SignalingResponse::TransportCreated {
            direction,
            transport: parameters,
        })
    }

    async fn connect_transport(
        &mut self,
        peer_id: &PeerId,
        transport_id: TransportId,
        dtls_parameters: Value,
    ) -> Result<SignalingResponse, SfuError> {
        let entry = self
            .peer_mut(peer_id)?
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        if entry.state != TransportState::Created {
            return Err(SfuError::ProtocolViolation(
                "transport is already connected".to_string(),
            ));
        }

        entry.state = TransportState::Connecting;
        let result = entry.transport.connect(dtls_parameters).await;
        entry.state = if result.is_ok() {
            TransportState::Connected
        } else {
            TransportState::Created
        };
        result?;

        Ok(SignalingResponse::TransportConnected { transport_id })
    }

    async fn produce(
        &mut self,
        peer_id: &PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<SignalingResponse, SfuError> {
        let peer = self.peer(peer_id)?;
        let entry = peer
            .transports
            .get(&transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        if entry.direction != TransportDirection::Sender {
            return Err(SfuError::ProtocolViolation(
                "produce requires the sender transport".to_string(),
            ));
        }
        if entry.state != TransportState::Connected {
            return Err(SfuError::ProtocolViolation(
                "transport is not connected".to_string(),
            ));
        }
        if peer.producer_of_kind(kind).is_some() {
            return Err(SfuError::ProtocolViolation(format!(
                "{kind} producer already exists"
            )));
        }

        let transport = Arc::clone(&entry.transport);
        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();

        self.peer_mut(peer_id)?.producers.insert(
            producer_id.clone(),
            ProducerEntry {
                producer,
                transport_id,
                kind,
                paused: false,
            },
        );

        self.broadcast(
            peer_id,
            &Notification::ProducerAvailable {
                room_id: self.room_id.clone(),
                producer_id: producer_id.clone(),
                peer_id: peer_id.clone(),
                kind,
            },
        );

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );

        Ok(SignalingResponse::Produced { producer_id })
    }

    /// Checks run in a fixed order so clients see a stable error for each
    /// misuse: receiver transport, its connection, producer existence,
    /// duplicate consumption, then codec compatibility.
    async fn consume(
        &mut self,
        peer_id: &PeerId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
    ) -> Result<SignalingResponse, SfuError> {
        let router = Arc::clone(&self.router()?.router);
        let peer = self.peer(peer_id)?;

        let (transport_id, entry) = peer
            .transport_for(TransportDirection::Receiver)
            .ok_or(SfuError::NoReceiverTransport)?;
        if entry.state != TransportState::Connected {
            return Err(SfuError::ProtocolViolation(
                "receiver transport is not connected".to_string(),
            ));
        }
        let transport_id = transport_id.clone();
        let transport = Arc::clone(&entry.transport);

        let kind = self
            .peers
            .values()
            .find_map(|p| p.producers.get(&producer_id).map(|e| e.kind))
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.clone()))?;

        if peer.consumer_of(&producer_id).is_some() {
            return Err(SfuError::ProtocolViolation(
                "producer is already consumed".to_string(),
            ));
        }
        if !router.can_consume(&producer_id, &rtp_capabilities) {
            return Err(SfuError::IncompatibleCapabilities(producer_id));
        }

        let consumer = transport
            .consume(&producer_id, rtp_capabilities, true)
            .await?;
        let consumer_type = consumer.consumer_type();

        if consumer_type == "simulcast" {
            let layers = self.ctx.settings.preferred_layers;
            if let Err(e) = consumer
                .set_preferred_layers(layers.spatial, layers.temporal)
                .await
            {
                warn!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    consumer_id = %consumer.id(),
                    error = %e,
                    "Failed to set preferred layers"
                );
            }
        }

        let consumer_id = consumer.id();
        let response = SignalingResponse::Consumed {
            consumer_id: consumer_id.clone(),
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type,
            producer_paused: consumer.producer_paused(),
        };

        self.peer_mut(peer_id)?.consumers.insert(
            consumer_id,
            ConsumerEntry {
                consumer,
                transport_id,
                producer_id,
                paused: true,
            },
        );

        Ok(response)
    }

    async fn resume_consumer(
        &mut self,
        peer_id: &PeerId,
        consumer_id: ConsumerId,
    ) -> Result<SignalingResponse, SfuError> {
        let entry = self
            .peer_mut(peer_id)?
            .consumers
            .get_mut(&consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.clone()))?;

        if !entry.paused {
            return Err(SfuError::ProtocolViolation(
                "consumer is not paused".to_string(),
            ));
        }

        entry.consumer.resume().await?;
        entry.paused = false;

        Ok(SignalingResponse::ConsumerResumed { consumer_id })
    }

    async fn set_producer_paused(
        &mut self,
        peer_id: &PeerId,
        producer_id: &ProducerId,
        paused: bool,
    ) -> Result<(), SfuError> {
        let entry = self
            .peer_mut(peer_id)?
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.clone()))?;

        if entry.paused == paused {
            let state = if paused { "already paused" } else { "not paused" };
            return Err(SfuError::ProtocolViolation(format!("producer is {state}")));
        }

        if paused {
            entry.producer.pause().await?;
        } else {
            entry.producer.resume().await?;
        }
        entry.paused = paused;

        let notification = if paused {
            Notification::ProducerPaused {
                room_id: self.room_id.clone(),
                producer_id: producer_id.clone(),
            }
        } else {
            Notification::ProducerResumed {
                room_id: self.room_id.clone(),
                producer_id: producer_id.clone(),
            }
        };
        self.broadcast(peer_id, &notification);

        Ok(())
    }

    async fn leave(&mut self, peer_id: &PeerId) -> Result<(), SfuError> {
        let (_session, report) = CascadeCleanup::new(&self.room_id, &mut self.peers)
            .teardown_peer(peer_id)
            .await?;
        report.record();
        self.ctx.metrics.peer_left();

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peer_count = self.peers.len(),
            transports_closed = report.transports,
            producers_closed = report.producers,
            consumers_closed = report.consumers,
            "Peer left"
        );

        if self.peers.is_empty() && self.ctx.reclaim == ReclaimPolicy::Eager {
            self.notify_emptied();
        }

        Ok(())
    }

    /// Remove every peer whose egress queue overflowed.
    ///
    /// Each removal notifies the remaining members, which can overflow
    /// another queue, so this repeats until no evicted peer is left.
    async fn evict_overflowed(&mut self) {
        loop {
            let evicted: Vec<PeerId> = self
                .peers
                .iter()
                .filter(|(_, peer)| peer.sink.is_evicted())
                .map(|(peer_id, _)| peer_id.clone())
                .collect();
            if evicted.is_empty() {
                return;
            }

            for peer_id in evicted {
                warn!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    peer_id = %peer_id,
                    "Evicting peer with an overflowed egress queue"
                );
                if let Err(e) = self.leave(&peer_id).await {
                    warn!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        error = %e,
                        "Eviction failed"
                    );
                    // Drop the session anyway so the loop terminates
                    self.peers.remove(&peer_id);
                }
            }
        }
    }

    /// Tell the registry this room is empty. Sent from a separate task so
    /// the room never waits on the registry.
    fn notify_emptied(&self) {
        let Some(registry) = self.ctx.registry.upgrade() else {
            return;
        };
        let room_id = self.room_id.clone();
        tokio::spawn(async move {
            let _ = registry
                .send(RegistryMessage::RoomEmptied { room_id })
                .await;
        });
    }

    async fn try_close(&mut self) -> bool {
        if !self.peers.is_empty() {
            debug!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                peer_count = self.peers.len(),
                "Close abandoned, room is occupied"
            );
            return false;
        }

        self.release_router().await;
        self.closed = true;
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            "Room closed"
        );
        true
    }

    async fn release_router(&mut self) {
        if self.router.take().is_some() {
            self.ctx.routers.release(&self.room_id).await;
        }
    }

    fn state(&self) -> RoomState {
        RoomState {
            room_id: self.room_id.clone(),
            router_id: self.router.as_ref().map(|r| r.router.id()),
            worker_index: self.router.as_ref().map(|r| r.worker.index),
            peers: self.peers.values().map(PeerSession::summary).collect(),
            is_closed: self.closed,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Tear down every peer and release the router.
    async fn graceful_shutdown(&mut self) {
        let peer_ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            match CascadeCleanup::new(&self.room_id, &mut self.peers)
                .teardown_peer(&peer_id)
                .await
            {
                Ok((_, report)) => {
                    report.record();
                    self.ctx.metrics.peer_left();
                }
                Err(e) => {
                    warn!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        error = %e,
                        "Peer teardown failed during shutdown"
                    );
                }
            }
        }

        self.release_router().await;
        self.closed = true;
    }
}
