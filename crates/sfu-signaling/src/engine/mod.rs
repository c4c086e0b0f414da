//! Media engine seam.
//!
//! The routing engine (ICE, DTLS, SRTP, RTP forwarding) lives outside this
//! crate. The signaling core reaches it only through the traits below, which
//! mirror the engine object hierarchy:
//!
//! ```text
//! MediaEngine
//! └── EngineWorker          (one per port-range slice)
//!     └── EngineRouter      (one per room)
//!         └── EngineTransport   (per peer, sender or receiver)
//!             ├── EngineProducer
//!             └── EngineConsumer
//! ```
//!
//! Closing a parent closes everything below it. Negotiation payloads
//! (capabilities, DTLS and RTP parameters, ICE data) are opaque JSON blobs
//! passed through untouched.

pub mod loopback;
#[cfg(feature = "mediasoup")]
pub mod mediasoup;

use common::config::PortRange;
use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

pub use loopback::{LoopbackEngine, LoopbackStats};
#[cfg(feature = "mediasoup")]
pub use self::mediasoup::MediasoupEngine;

/// Codecs every router is created with: Opus audio and VP8 video.
pub(crate) fn default_codecs() -> Vec<Value> {
    vec![
        json!({
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2,
            "preferredPayloadType": 100
        }),
        json!({
            "kind": "video",
            "mimeType": "video/VP8",
            "clockRate": 90000,
            "preferredPayloadType": 101,
            "parameters": { "x-google-start-bitrate": 1000 }
        }),
    ]
}

/// Router RTP capabilities (opaque).
pub type RtpCapabilities = Value;

/// Remote DTLS parameters supplied by the client (opaque).
pub type DtlsParameters = Value;

/// RTP send/receive parameters (opaque).
pub type RtpParameters = Value;

/// Errors returned by the media engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine refused the call, usually because of malformed
    /// negotiation parameters.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The target entity was already closed.
    #[error("{0} is closed")]
    Closed(String),

    /// The worker hosting the entity is gone.
    #[error("worker {worker_index} died: {reason}")]
    WorkerDied { worker_index: usize, reason: String },
}

/// Settings for one engine worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Position in the pool.
    pub index: usize,
    /// Ports this worker may bind.
    pub port_range: PortRange,
}

/// Options for a WebRTC transport.
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub port_range: PortRange,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
}

/// Parameters the client needs to set up its side of a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Callback invoked once when a worker dies.
pub type WorkerDeathCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Entry point of a media engine.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Start a worker bound to the given port range.
    async fn create_worker(
        &self,
        settings: WorkerSettings,
    ) -> Result<Arc<dyn EngineWorker>, EngineError>;
}

/// One execution context of the engine.
#[async_trait::async_trait]
pub trait EngineWorker: Send + Sync {
    /// Engine-assigned worker identifier.
    fn id(&self) -> String;

    /// Create a router with the engine's configured media codecs.
    async fn create_router(&self) -> Result<Arc<dyn EngineRouter>, EngineError>;

    /// Register a callback fired if the worker terminates unexpectedly.
    fn on_died(&self, callback: WorkerDeathCallback);

    /// Close the worker and everything it hosts.
    async fn close(&self);
}

/// Per-room router.
#[async_trait::async_trait]
pub trait EngineRouter: Send + Sync {
    /// Engine-assigned router identifier.
    fn id(&self) -> String;

    /// Codecs and header extensions this router supports.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    /// Create a WebRTC transport on this router.
    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;

    /// Close the router and every transport on it.
    async fn close(&self);
}

/// A negotiated network path between a peer and the router.
#[async_trait::async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// ICE and DTLS parameters for the client.
    fn parameters(&self) -> TransportParameters;

    /// Complete DTLS with the client's parameters.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    /// Create a producer on this transport.
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError>;

    /// Create a consumer of `producer_id` on this transport.
    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError>;

    /// Close the transport, its producers and its consumers.
    async fn close(&self);
}

/// An outgoing media stream of a peer.
#[async_trait::async_trait]
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    async fn pause(&self) -> Result<(), EngineError>;
    async fn resume(&self) -> Result<(), EngineError>;
    /// Close the producer and every consumer of it.
    async fn close(&self);
}

/// A peer's inbound view of a remote producer.
#[async_trait::async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    /// RTP parameters the client's receiver must use.
    fn rtp_parameters(&self) -> RtpParameters;
    /// "simple" or "simulcast".
    fn consumer_type(&self) -> String;
    fn producer_paused(&self) -> bool;
    async fn resume(&self) -> Result<(), EngineError>;
    async fn set_preferred_layers(&self, spatial: u8, temporal: u8) -> Result<(), EngineError>;
    async fn close(&self);
}
