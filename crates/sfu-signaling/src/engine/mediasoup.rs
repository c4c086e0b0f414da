//! Media engine backed by mediasoup worker processes.
//!
//! Every handle owns its mediasoup counterpart in a `Mutex<Option<_>>`.
//! mediasoup closes an entity once its last handle drops, so `close` takes
//! the entity out and drops it. Negotiation blobs cross the seam as JSON and
//! are converted with serde at each call.

use super::{
    default_codecs, DtlsParameters, EngineConsumer, EngineError, EngineProducer, EngineRouter,
    EngineTransport, EngineWorker, MediaEngine, RtpCapabilities, RtpParameters,
    TransportParameters, WebRtcTransportOptions, WorkerDeathCallback, WorkerSettings,
};

use ::mediasoup::data_structures::{ListenInfo, Protocol};
use ::mediasoup::prelude as ms;
use ::mediasoup::prelude::Transport as _;
use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rejected(e: impl std::fmt::Display) -> EngineError {
    EngineError::Rejected(e.to_string())
}

/// Parse a client-supplied blob into its mediasoup type.
fn from_json<T: DeserializeOwned>(what: &str, value: Value) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| EngineError::Rejected(format!("invalid {what}: {e}")))
}

fn to_json(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn media_kind(kind: MediaKind) -> ms::MediaKind {
    match kind {
        MediaKind::Audio => ms::MediaKind::Audio,
        MediaKind::Video => ms::MediaKind::Video,
    }
}

fn signaling_kind(kind: ms::MediaKind) -> MediaKind {
    match kind {
        ms::MediaKind::Audio => MediaKind::Audio,
        ms::MediaKind::Video => MediaKind::Video,
    }
}

/// Router codecs in mediasoup form. Feedback is left empty; the router
/// fills it in from what the worker supports.
fn router_codecs() -> Result<Vec<ms::RtpCodecCapability>, EngineError> {
    default_codecs()
        .into_iter()
        .map(|mut codec| {
            if let Some(fields) = codec.as_object_mut() {
                fields.entry("parameters").or_insert_with(|| json!({}));
                fields.entry("rtcpFeedback").or_insert_with(|| json!([]));
            }
            from_json("media codec", codec)
        })
        .collect()
}

/// Production engine. Workers are mediasoup subprocesses started through
/// one shared [`ms::WorkerManager`].
pub struct MediasoupEngine {
    manager: ms::WorkerManager,
    codecs: Vec<ms::RtpCodecCapability>,
}

impl MediasoupEngine {
    /// # Errors
    ///
    /// Returns an error if the built-in codec list is not valid for mediasoup.
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            manager: ms::WorkerManager::new(),
            codecs: router_codecs()?,
        })
    }
}

#[async_trait::async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_worker(
        &self,
        settings: WorkerSettings,
    ) -> Result<Arc<dyn EngineWorker>, EngineError> {
        let worker = self
            .manager
            .create_worker(ms::WorkerSettings::default())
            .await
            .map_err(|e| EngineError::WorkerDied {
                worker_index: settings.index,
                reason: format!("failed to start: {e}"),
            })?;

        info!(
            target: "sfu.engine",
            worker_index = settings.index,
            worker_id = %worker.id(),
            min_port = settings.port_range.min,
            max_port = settings.port_range.max,
            "mediasoup worker started"
        );

        Ok(Arc::new(MediasoupWorker {
            id: worker.id().to_string(),
            index: settings.index,
            codecs: self.codecs.clone(),
            worker: Mutex::new(Some(worker)),
        }))
    }
}

struct MediasoupWorker {
    id: String,
    index: usize,
    codecs: Vec<ms::RtpCodecCapability>,
    worker: Mutex<Option<ms::Worker>>,
}

impl MediasoupWorker {
    fn worker(&self) -> Result<ms::Worker, EngineError> {
        lock(&self.worker)
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("worker {}", self.index)))
    }
}

#[async_trait::async_trait]
impl EngineWorker for MediasoupWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn create_router(&self) -> Result<Arc<dyn EngineRouter>, EngineError> {
        let worker = self.worker()?;
        let router = worker
            .create_router(ms::RouterOptions::new(self.codecs.clone()))
            .await
            .map_err(rejected)?;

        debug!(
            target: "sfu.engine",
            worker_index = self.index,
            router_id = %router.id(),
            "Router created"
        );

        Ok(Arc::new(MediasoupRouter {
            id: router.id().to_string(),
            capabilities: to_json(router.rtp_capabilities()),
            router: Mutex::new(Some(router)),
        }))
    }

    fn on_died(&self, callback: WorkerDeathCallback) {
        match lock(&self.worker).as_ref() {
            Some(worker) => worker
                .on_dead(move |reason| callback(format!("{reason:?}")))
                .detach(),
            None => warn!(
                target: "sfu.engine",
                worker_index = self.index,
                "Death callback registered on a closed worker"
            ),
        }
    }

    async fn close(&self) {
        drop(lock(&self.worker).take());
    }
}

struct MediasoupRouter {
    id: String,
    capabilities: Value,
    router: Mutex<Option<ms::Router>>,
}

impl MediasoupRouter {
    fn router(&self) -> Result<ms::Router, EngineError> {
        lock(&self.router)
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("router {}", self.id)))
    }
}

#[async_trait::async_trait]
impl EngineRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Ok(producer_id) =
            from_json::<ms::ProducerId>("producer id", json!(producer_id.as_str()))
        else {
            return false;
        };
        let Ok(capabilities) =
            from_json::<ms::RtpCapabilities>("rtpCapabilities", rtp_capabilities.clone())
        else {
            return false;
        };
        lock(&self.router)
            .as_ref()
            .is_some_and(|router| router.can_consume(&producer_id, &capabilities))
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        let router = self.router()?;

        let listen = |protocol| ListenInfo {
            protocol,
            ip: options.listen_ip,
            announced_address: options.announced_address.clone(),
            expose_internal_ip: false,
            port: None,
            port_range: Some(options.port_range.min..=options.port_range.max),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        };
        let mut protocols = Vec::new();
        if options.enable_udp {
            protocols.push(listen(Protocol::Udp));
        }
        if options.enable_tcp {
            protocols.push(listen(Protocol::Tcp));
        }
        let mut protocols = protocols.into_iter();
        let first = protocols.next().ok_or_else(|| {
            EngineError::Rejected("transport needs UDP or TCP enabled".to_string())
        })?;
        let listen_infos = protocols.fold(
            ms::WebRtcTransportListenInfos::new(first),
            ms::WebRtcTransportListenInfos::insert,
        );

        let mut transport_options = ms::WebRtcTransportOptions::new(listen_infos);
        transport_options.prefer_udp = options.prefer_udp;
        transport_options.initial_available_outgoing_bitrate =
            options.initial_available_outgoing_bitrate;

        let transport = router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(rejected)?;
        if let Some(bitrate) = options.max_incoming_bitrate {
            transport
                .set_max_incoming_bitrate(bitrate)
                .await
                .map_err(rejected)?;
        }

        let id = TransportId::from(transport.id().to_string());
        let parameters = TransportParameters {
            id: id.clone(),
            ice_parameters: to_json(transport.ice_parameters()),
            ice_candidates: to_json(transport.ice_candidates()),
            dtls_parameters: to_json(transport.dtls_parameters()),
        };

        Ok(Arc::new(MediasoupTransport {
            id,
            parameters,
            transport: Mutex::new(Some(transport)),
        }))
    }

    async fn close(&self) {
        drop(lock(&self.router).take());
    }
}

struct MediasoupTransport {
    id: TransportId,
    parameters: TransportParameters,
    transport: Mutex<Option<ms::WebRtcTransport>>,
}

impl MediasoupTransport {
    fn transport(&self) -> Result<ms::WebRtcTransport, EngineError> {
        lock(&self.transport)
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("transport {}", self.id)))
    }
}

#[async_trait::async_trait]
impl EngineTransport for MediasoupTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        let dtls_parameters = from_json("dtlsParameters", dtls_parameters)?;
        self.transport()?
            .connect(ms::WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(rejected)
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError> {
        let rtp_parameters = from_json("rtpParameters", rtp_parameters)?;
        let producer = self
            .transport()?
            .produce(ms::ProducerOptions::new(media_kind(kind), rtp_parameters))
            .await
            .map_err(rejected)?;

        Ok(Arc::new(MediasoupProducer {
            id: ProducerId::from(producer.id().to_string()),
            kind,
            producer: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError> {
        let engine_producer_id = from_json("producer id", json!(producer_id.as_str()))?;
        let rtp_capabilities = from_json("rtpCapabilities", rtp_capabilities)?;
        let mut options = ms::ConsumerOptions::new(engine_producer_id, rtp_capabilities);
        options.paused = paused;

        let consumer = self
            .transport()?
            .consume(options)
            .await
            .map_err(rejected)?;

        Ok(Arc::new(MediasoupConsumer {
            id: ConsumerId::from(consumer.id().to_string()),
            producer_id: producer_id.clone(),
            kind: signaling_kind(consumer.kind()),
            rtp_parameters: to_json(consumer.rtp_parameters()),
            consumer_type: to_json(consumer.r#type())
                .as_str()
                .unwrap_or("simple")
                .to_string(),
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    async fn close(&self) {
        drop(lock(&self.transport).take());
    }
}

struct MediasoupProducer {
    id: ProducerId,
    kind: MediaKind,
    producer: Mutex<Option<ms::Producer>>,
}

impl MediasoupProducer {
    fn producer(&self) -> Result<ms::Producer, EngineError> {
        lock(&self.producer)
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("producer {}", self.id)))
    }
}

#[async_trait::async_trait]
impl EngineProducer for MediasoupProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> Result<(), EngineError> {
        self.producer()?.pause().await.map_err(rejected)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.producer()?.resume().await.map_err(rejected)
    }

    async fn close(&self) {
        drop(lock(&self.producer).take());
    }
}

struct MediasoupConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer_type: String,
    consumer: Mutex<Option<ms::Consumer>>,
}

impl MediasoupConsumer {
    fn consumer(&self) -> Result<ms::Consumer, EngineError> {
        lock(&self.consumer)
            .clone()
            .ok_or_else(|| EngineError::Closed(format!("consumer {}", self.id)))
    }
}

#[async_trait::async_trait]
impl EngineConsumer for MediasoupConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> String {
        self.consumer_type.clone()
    }

    fn producer_paused(&self) -> bool {
        lock(&self.consumer)
            .as_ref()
            .is_some_and(ms::Consumer::producer_paused)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.consumer()?.resume().await.map_err(rejected)
    }

    async fn set_preferred_layers(&self, spatial: u8, temporal: u8) -> Result<(), EngineError> {
        self.consumer()?
            .set_preferred_layers(ms::ConsumerLayers {
                spatial_layer: spatial,
                temporal_layer: Some(temporal),
            })
            .await
            .map_err(rejected)
    }

    async fn close(&self) {
        drop(lock(&self.consumer).take());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::config::PortRange;
    use std::net::{IpAddr, Ipv4Addr};

    fn transport_options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_address: None,
            port_range: PortRange::new(42000, 42099).unwrap(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 600_000,
            max_incoming_bitrate: None,
        }
    }

    #[test]
    fn test_router_codecs_convert() {
        let codecs = router_codecs().unwrap();
        assert_eq!(codecs.len(), 2);
    }

    #[test]
    fn test_malformed_dtls_rejected() {
        let result = from_json::<ms::DtlsParameters>("dtlsParameters", json!({ "role": 7 }));
        assert!(matches!(result, Err(EngineError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_worker_router_transport_lifecycle() {
        let engine = MediasoupEngine::new().unwrap();
        let worker = engine
            .create_worker(WorkerSettings {
                index: 0,
                port_range: PortRange::new(42000, 42099).unwrap(),
            })
            .await
            .unwrap();
        let router = worker.create_router().await.unwrap();

        let capabilities = router.rtp_capabilities();
        let codecs = capabilities["codecs"].as_array().unwrap();
        assert!(codecs
            .iter()
            .any(|c| c["mimeType"].as_str() == Some("audio/opus")));

        let transport = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();
        let parameters = transport.parameters();
        assert!(!parameters.ice_candidates.as_array().unwrap().is_empty());
        assert!(parameters.dtls_parameters["fingerprints"].is_array());

        // Unknown producers are never consumable
        assert!(!router.can_consume(&ProducerId::new(), &capabilities));

        router.close().await;
        assert!(router
            .create_webrtc_transport(&transport_options())
            .await
            .is_err());
        worker.close().await;
    }
}
