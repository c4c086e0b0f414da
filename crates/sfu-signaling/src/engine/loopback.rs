//! In-process loopback media engine.
//!
//! Implements the engine traits with pure bookkeeping: no sockets are opened
//! and no media flows. Entity lifetimes, cascade closure and the
//! `can_consume` decision follow the router contract so the signaling core
//! can be run and tested without a native engine:
//!
//! - closing a worker closes its routers
//! - closing a router closes its transports
//! - closing a transport closes its producers and consumers
//! - closing a producer closes every consumer of it
//!
//! `can_consume` succeeds when the consumer's capabilities list a codec with
//! the producer's MIME type. Tests can inject failures and kill workers.

use super::{
    default_codecs, DtlsParameters, EngineConsumer, EngineError, EngineProducer, EngineRouter, EngineTransport,
    EngineWorker, MediaEngine, RtpCapabilities, RtpParameters, TransportParameters,
    WebRtcTransportOptions, WorkerDeathCallback, WorkerSettings,
};

use common::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Find the codec entry in `capabilities` matching `mime_type`.
fn find_codec<'a>(capabilities: &'a Value, mime_type: &str) -> Option<&'a Value> {
    capabilities
        .get("codecs")?
        .as_array()?
        .iter()
        .find(|codec| {
            codec
                .get("mimeType")
                .and_then(Value::as_str)
                .is_some_and(|m| m.eq_ignore_ascii_case(mime_type))
        })
}

fn random_ssrc() -> u32 {
    let bits = Uuid::new_v4().as_u128() & 0xFFFF_FFFF;
    u32::try_from(bits).unwrap_or(1)
}

fn short_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Live-entity counters for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub workers_created: usize,
    pub routers_created: usize,
    pub live_routers: usize,
    pub live_transports: usize,
    pub live_producers: usize,
    pub live_consumers: usize,
}

struct RouterRecord {
    worker_index: usize,
}

struct TransportRecord {
    router_id: String,
    connected: bool,
}

struct ProducerRecord {
    router_id: String,
    transport_id: TransportId,
    mime_type: String,
    simulcast: bool,
    paused: bool,
}

struct ConsumerRecord {
    transport_id: TransportId,
    producer_id: ProducerId,
}

/// Everything alive in the engine. Absence from a map means closed.
#[derive(Default)]
struct EngineState {
    routers: HashMap<String, RouterRecord>,
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
}

impl EngineState {
    fn close_consumer(&mut self, id: &ConsumerId) {
        self.consumers.remove(id);
    }

    fn close_producer(&mut self, id: &ProducerId) {
        if self.producers.remove(id).is_some() {
            self.consumers.retain(|_, c| &c.producer_id != id);
        }
    }

    fn close_transport(&mut self, id: &TransportId) {
        if self.transports.remove(id).is_none() {
            return;
        }
        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == id)
            .map(|(pid, _)| pid.clone())
            .collect();
        for producer_id in &producers {
            self.close_producer(producer_id);
        }
        self.consumers.retain(|_, c| &c.transport_id != id);
    }

    fn close_router(&mut self, id: &str) {
        if self.routers.remove(id).is_none() {
            return;
        }
        let transports: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == id)
            .map(|(tid, _)| tid.clone())
            .collect();
        for transport_id in &transports {
            self.close_transport(transport_id);
        }
    }

    fn close_worker(&mut self, worker_index: usize) {
        let routers: Vec<String> = self
            .routers
            .iter()
            .filter(|(_, r)| r.worker_index == worker_index)
            .map(|(rid, _)| rid.clone())
            .collect();
        for router_id in &routers {
            self.close_router(router_id);
        }
    }
}

struct Shared {
    state: Mutex<EngineState>,
    workers: Mutex<Vec<Arc<LoopbackWorker>>>,
    codecs: Vec<Value>,
    router_delay: Duration,
    media_delay: Mutex<Duration>,
    workers_created: AtomicUsize,
    routers_created: AtomicUsize,
    next_port: AtomicU32,
    fail_next_connect: AtomicBool,
    fail_next_produce: AtomicBool,
}

/// In-process media engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LoopbackEngine {
    shared: Arc<Shared>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    /// Engine supporting Opus audio and VP8 video.
    #[must_use]
    pub fn new() -> Self {
        Self::with_router_delay(Duration::ZERO)
    }

    /// Engine whose router creation takes `delay`, widening race windows
    /// in concurrency tests.
    #[must_use]
    pub fn with_router_delay(delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::default()),
                workers: Mutex::new(Vec::new()),
                codecs: default_codecs(),
                router_delay: delay,
                media_delay: Mutex::new(Duration::ZERO),
                workers_created: AtomicUsize::new(0),
                routers_created: AtomicUsize::new(0),
                next_port: AtomicU32::new(0),
                fail_next_connect: AtomicBool::new(false),
                fail_next_produce: AtomicBool::new(false),
            }),
        }
    }

    /// Delay every later transport creation and produce by `delay`, leaving
    /// a window in which the requesting peer can go away.
    pub fn set_media_delay(&self, delay: Duration) {
        *lock(&self.shared.media_delay) = delay;
    }

    async fn media_delay(&self) {
        let delay = *lock(&self.shared.media_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Make the next transport connect fail.
    pub fn fail_next_connect(&self) {
        self.shared.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// Make the next produce fail.
    pub fn fail_next_produce(&self) {
        self.shared.fail_next_produce.store(true, Ordering::SeqCst);
    }

    /// Simulate an unexpected worker termination.
    ///
    /// Closes everything the worker hosts and fires its death callbacks.
    /// Returns false if no worker has that index.
    pub fn kill_worker(&self, worker_index: usize, reason: &str) -> bool {
        let worker = lock(&self.shared.workers)
            .iter()
            .find(|w| w.index == worker_index)
            .cloned();
        match worker {
            Some(worker) => {
                worker.die(reason);
                true
            }
            None => false,
        }
    }

    /// Snapshot of created and live entities.
    #[must_use]
    pub fn stats(&self) -> LoopbackStats {
        let state = lock(&self.shared.state);
        LoopbackStats {
            workers_created: self.shared.workers_created.load(Ordering::SeqCst),
            routers_created: self.shared.routers_created.load(Ordering::SeqCst),
            live_routers: state.routers.len(),
            live_transports: state.transports.len(),
            live_producers: state.producers.len(),
            live_consumers: state.consumers.len(),
        }
    }

    #[must_use]
    pub fn is_transport_alive(&self, id: &TransportId) -> bool {
        lock(&self.shared.state).transports.contains_key(id)
    }

    #[must_use]
    pub fn is_producer_alive(&self, id: &ProducerId) -> bool {
        lock(&self.shared.state).producers.contains_key(id)
    }

    #[must_use]
    pub fn is_consumer_alive(&self, id: &ConsumerId) -> bool {
        lock(&self.shared.state).consumers.contains_key(id)
    }

    fn capabilities(&self) -> RtpCapabilities {
        json!({ "codecs": self.shared.codecs, "headerExtensions": [] })
    }
}

#[async_trait::async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(
        &self,
        settings: WorkerSettings,
    ) -> Result<Arc<dyn EngineWorker>, EngineError> {
        let worker = Arc::new(LoopbackWorker {
            index: settings.index,
            id: format!("loopback-worker-{}", settings.index),
            engine: self.clone(),
            dead: AtomicBool::new(false),
            death_callbacks: Mutex::new(Vec::new()),
        });

        lock(&self.shared.workers).push(Arc::clone(&worker));
        self.shared.workers_created.fetch_add(1, Ordering::SeqCst);

        debug!(
            target: "sfu.engine.loopback",
            worker_index = settings.index,
            port_min = settings.port_range.min,
            port_max = settings.port_range.max,
            "Loopback worker created"
        );

        Ok(worker)
    }
}

struct LoopbackWorker {
    index: usize,
    id: String,
    engine: LoopbackEngine,
    dead: AtomicBool,
    death_callbacks: Mutex<Vec<WorkerDeathCallback>>,
}

impl LoopbackWorker {
    fn die(&self, reason: &str) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            target: "sfu.engine.loopback",
            worker_index = self.index,
            reason = %reason,
            "Loopback worker died"
        );
        lock(&self.engine.shared.state).close_worker(self.index);

        let callbacks: Vec<WorkerDeathCallback> =
            lock(&self.death_callbacks).drain(..).collect();
        for callback in callbacks {
            callback(reason.to_string());
        }
    }
}

#[async_trait::async_trait]
impl EngineWorker for LoopbackWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn create_router(&self) -> Result<Arc<dyn EngineRouter>, EngineError> {
        let shared = &self.engine.shared;
        if !shared.router_delay.is_zero() {
            tokio::time::sleep(shared.router_delay).await;
        }

        if self.dead.load(Ordering::SeqCst) {
            return Err(EngineError::WorkerDied {
                worker_index: self.index,
                reason: "worker is dead".to_string(),
            });
        }

        let id = format!("router-{}", Uuid::new_v4());
        lock(&shared.state).routers.insert(
            id.clone(),
            RouterRecord {
                worker_index: self.index,
            },
        );
        shared.routers_created.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(LoopbackRouter {
            id,
            engine: self.engine.clone(),
        }))
    }

    fn on_died(&self, callback: WorkerDeathCallback) {
        if self.dead.load(Ordering::SeqCst) {
            callback("worker already dead".to_string());
            return;
        }
        lock(&self.death_callbacks).push(callback);
    }

    async fn close(&self) {
        // A deliberate close is not a death; drop the callbacks first
        lock(&self.death_callbacks).clear();
        lock(&self.engine.shared.state).close_worker(self.index);
    }
}

struct LoopbackRouter {
    id: String,
    engine: LoopbackEngine,
}

impl LoopbackRouter {
    fn allocate_port(&self, options: &WebRtcTransportOptions) -> u16 {
        let offset = self.engine.shared.next_port.fetch_add(1, Ordering::SeqCst)
            % options.port_range.len();
        u16::try_from(u32::from(options.port_range.min) + offset).unwrap_or(options.port_range.min)
    }

    fn build_parameters(
        &self,
        id: &TransportId,
        options: &WebRtcTransportOptions,
    ) -> TransportParameters {
        let ip = options
            .announced_address
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());
        let port = self.allocate_port(options);
        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (1_076_302_079_u32, 1_076_276_479_u32)
        } else {
            (1_076_276_479_u32, 1_076_302_079_u32)
        };

        let mut candidates = Vec::new();
        if options.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate",
                "priority": udp_priority,
                "address": ip,
                "protocol": "udp",
                "port": port,
                "type": "host"
            }));
        }
        if options.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "priority": tcp_priority,
                "address": ip,
                "protocol": "tcp",
                "port": port,
                "type": "host",
                "tcpType": "passive"
            }));
        }

        TransportParameters {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": short_token(),
                "password": short_token(),
                "iceLite": true
            }),
            ice_candidates: Value::Array(candidates),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": short_token() }]
            }),
        }
    }
}

#[async_trait::async_trait]
impl EngineRouter for LoopbackRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.engine.capabilities()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let state = lock(&self.engine.shared.state);
        match state.producers.get(producer_id) {
            Some(producer) if producer.router_id == self.id => {
                find_codec(rtp_capabilities, &producer.mime_type).is_some()
            }
            _ => false,
        }
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        self.engine.media_delay().await;
        let id = TransportId::new();
        let parameters = self.build_parameters(&id, options);

        {
            let mut state = lock(&self.engine.shared.state);
            if !state.routers.contains_key(&self.id) {
                return Err(EngineError::Closed(format!("router {}", self.id)));
            }
            state.transports.insert(
                id.clone(),
                TransportRecord {
                    router_id: self.id.clone(),
                    connected: false,
                },
            );
        }

        Ok(Arc::new(LoopbackTransport {
            id,
            router_id: self.id.clone(),
            parameters,
            engine: self.engine.clone(),
        }))
    }

    async fn close(&self) {
        lock(&self.engine.shared.state).close_router(&self.id);
    }
}

struct LoopbackTransport {
    id: TransportId,
    router_id: String,
    parameters: TransportParameters,
    engine: LoopbackEngine,
}

#[async_trait::async_trait]
impl EngineTransport for LoopbackTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        if self
            .engine
            .shared
            .fail_next_connect
            .swap(false, Ordering::SeqCst)
        {
            return Err(EngineError::Rejected("injected connect failure".to_string()));
        }

        let has_fingerprint = dtls_parameters
            .get("fingerprints")
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        if !has_fingerprint {
            return Err(EngineError::Rejected(
                "dtlsParameters.fingerprints missing or empty".to_string(),
            ));
        }

        let mut state = lock(&self.engine.shared.state);
        let record = state
            .transports
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::Closed(format!("transport {}", self.id)))?;
        if record.connected {
            return Err(EngineError::Rejected("connect() already called".to_string()));
        }
        record.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError> {
        self.engine.media_delay().await;
        if self
            .engine
            .shared
            .fail_next_produce
            .swap(false, Ordering::SeqCst)
        {
            return Err(EngineError::Rejected("injected produce failure".to_string()));
        }

        let mime_type = rtp_parameters
            .get("codecs")
            .and_then(Value::as_array)
            .and_then(|codecs| codecs.first())
            .and_then(|codec| codec.get("mimeType"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::Rejected("rtpParameters.codecs[0].mimeType missing".to_string())
            })?;

        let prefix = format!("{}/", kind.as_str());
        if !mime_type.to_ascii_lowercase().starts_with(&prefix) {
            return Err(EngineError::Rejected(format!(
                "codec {mime_type} does not match kind {kind}"
            )));
        }
        if find_codec(&self.engine.capabilities(), &mime_type).is_none() {
            return Err(EngineError::Rejected(format!(
                "codec {mime_type} not supported by router"
            )));
        }

        let simulcast = rtp_parameters
            .get("encodings")
            .and_then(Value::as_array)
            .is_some_and(|e| e.len() > 1);

        let id = ProducerId::new();
        {
            let mut state = lock(&self.engine.shared.state);
            match state.transports.get(&self.id) {
                Some(t) if t.connected => {}
                Some(_) => {
                    return Err(EngineError::Rejected("transport not connected".to_string()))
                }
                None => return Err(EngineError::Closed(format!("transport {}", self.id))),
            }
            state.producers.insert(
                id.clone(),
                ProducerRecord {
                    router_id: self.router_id.clone(),
                    transport_id: self.id.clone(),
                    mime_type,
                    simulcast,
                    paused: false,
                },
            );
        }

        Ok(Arc::new(LoopbackProducer {
            id,
            kind,
            engine: self.engine.clone(),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError> {
        let id = ConsumerId::new();
        let (kind, rtp_parameters, consumer_type, producer_paused) = {
            let mut state = lock(&self.engine.shared.state);
            if !state.transports.contains_key(&self.id) {
                return Err(EngineError::Closed(format!("transport {}", self.id)));
            }
            let producer = state
                .producers
                .get(producer_id)
                .ok_or_else(|| EngineError::Rejected(format!("producer {producer_id} not found")))?;
            let codec = find_codec(&rtp_capabilities, &producer.mime_type)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Rejected("cannot consume with given capabilities".to_string())
                })?;
            let kind = if producer.mime_type.to_ascii_lowercase().starts_with("audio/") {
                MediaKind::Audio
            } else {
                MediaKind::Video
            };
            let consumer_type = if producer.simulcast { "simulcast" } else { "simple" };
            let producer_paused = producer.paused;
            let rtp_parameters = json!({
                "codecs": [codec],
                "encodings": [{ "ssrc": random_ssrc() }],
                "mid": state.consumers.len().to_string()
            });

            state.consumers.insert(
                id.clone(),
                ConsumerRecord {
                    transport_id: self.id.clone(),
                    producer_id: producer_id.clone(),
                },
            );
            (kind, rtp_parameters, consumer_type.to_string(), producer_paused)
        };

        Ok(Arc::new(LoopbackConsumer {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            consumer_type,
            producer_paused,
            paused: AtomicBool::new(paused),
            engine: self.engine.clone(),
        }))
    }

    async fn close(&self) {
        lock(&self.engine.shared.state).close_transport(&self.id);
    }
}

struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    engine: LoopbackEngine,
}

impl LoopbackProducer {
    fn set_paused(&self, paused: bool) -> Result<(), EngineError> {
        let mut state = lock(&self.engine.shared.state);
        let record = state
            .producers
            .get_mut(&self.id)
            .ok_or_else(|| EngineError::Closed(format!("producer {}", self.id)))?;
        record.paused = paused;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EngineProducer for LoopbackProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> Result<(), EngineError> {
        self.set_paused(true)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.set_paused(false)
    }

    async fn close(&self) {
        lock(&self.engine.shared.state).close_producer(&self.id);
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer_type: String,
    producer_paused: bool,
    paused: AtomicBool,
    engine: LoopbackEngine,
}

impl LoopbackConsumer {
    fn ensure_alive(&self) -> Result<(), EngineError> {
        if lock(&self.engine.shared.state).consumers.contains_key(&self.id) {
            Ok(())
        } else {
            Err(EngineError::Closed(format!("consumer {}", self.id)))
        }
    }
}

#[async_trait::async_trait]
impl EngineConsumer for LoopbackConsumer {
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
        self.producer_paused
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_preferred_layers(&self, _spatial: u8, _temporal: u8) -> Result<(), EngineError> {
        self.ensure_alive()?;
        if self.consumer_type != "simulcast" {
            return Err(EngineError::Rejected(
                "preferred layers require a simulcast consumer".to_string(),
            ));
        }
        Ok(())
    }

    async fn close(&self) {
        lock(&self.engine.shared.state).close_consumer(&self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::config::PortRange;

    fn transport_options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: "127.0.0.1".parse().unwrap(),
            announced_address: None,
            port_range: PortRange::new(40000, 40009).unwrap(),
            enable_udp: true,
            enable_tcp: false,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: None,
        }
    }

    fn dtls() -> Value {
        json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AA:BB" }] })
    }

    fn vp8_parameters() -> Value {
        json!({ "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }], "encodings": [{ "ssrc": 1111 }] })
    }

    async fn router(engine: &LoopbackEngine) -> Arc<dyn EngineRouter> {
        let worker = engine
            .create_worker(WorkerSettings {
                index: 0,
                port_range: PortRange::new(40000, 40009).unwrap(),
            })
            .await
            .unwrap();
        worker.create_router().await.unwrap()
    }

    async fn connected_transport(router: &Arc<dyn EngineRouter>) -> Arc<dyn EngineTransport> {
        let transport = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();
        transport.connect(dtls()).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_transport_parameters_use_worker_ports() {
        let engine = LoopbackEngine::new();
        let router = router(&engine).await;

        let transport = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();
        let params = transport.parameters();

        assert_eq!(params.id, transport.id());
        let port = params.ice_candidates[0]["port"].as_u64().unwrap();
        assert!((40000..=40009).contains(&port));
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let engine = LoopbackEngine::new();
        let router = router(&engine).await;
        let transport = connected_transport(&router).await;

        let result = transport.connect(dtls()).await;
        assert!(matches!(result, Err(EngineError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_connect_without_fingerprints_is_rejected() {
        let engine = LoopbackEngine::new();
        let router = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();

        let result = transport.connect(json!({ "role": "client" })).await;
        assert!(matches!(result, Err(EngineError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_can_consume_matches_mime_type() {
        let engine = LoopbackEngine::new();
        let router = router(&engine).await;
        let transport = connected_transport(&router).await;
        let producer = transport
            .produce(MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        let vp8_caps = json!({ "codecs": [{ "mimeType": "video/vp8", "kind": "video" }] });
        let h264_caps = json!({ "codecs": [{ "mimeType": "video/H264", "kind": "video" }] });

        assert!(router.can_consume(&producer.id(), &vp8_caps));
        assert!(!router.can_consume(&producer.id(), &h264_caps));
        assert!(!router.can_consume(&ProducerId::from("missing"), &vp8_caps));
    }

    #[tokio::test]
    async fn test_closing_transport_cascades() {
        let engine = LoopbackEngine::new();
        let router = router(&engine).await;
        let send = connected_transport(&router).await;
        let recv = connected_transport(&router).await;

        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();
        let consumer = recv
            .consume(&producer.id(), router.rtp_capabilities(), true)
            .await
            .unwrap();
        assert_eq!(engine.stats().live_consumers, 1);

        send.close().await;

        assert!(!engine.is_transport_alive(&send.id()));
        assert!(!engine.is_producer_alive(&producer.id()));
        assert!(!engine.is_consumer_alive(&consumer.id()));
        assert!(engine.is_transport_alive(&recv.id()));
    }

    #[tokio::test]
    async fn test_kill_worker_fires_callback_and_closes_routers() {
        let engine = LoopbackEngine::new();
        let worker = engine
            .create_worker(WorkerSettings {
                index: 3,
                port_range: PortRange::new(40000, 40009).unwrap(),
            })
            .await
            .unwrap();
        let _router = worker.create_router().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        worker.on_died(Box::new(move |reason| {
            let _ = tx.send(reason);
        }));

        assert!(engine.kill_worker(3, "segfault"));
        assert_eq!(rx.await.unwrap(), "segfault");
        assert_eq!(engine.stats().live_routers, 0);
        assert!(worker.create_router().await.is_err());
        assert!(!engine.kill_worker(9, "no such worker"));
    }

    #[tokio::test]
    async fn test_injected_failures_are_one_shot() {
        let engine = LoopbackEngine::new();
        let router = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();

        engine.fail_next_connect();
        assert!(transport.connect(dtls()).await.is_err());
        assert!(transport.connect(dtls()).await.is_ok());

        engine.fail_next_produce();
        assert!(transport.produce(MediaKind::Video, vp8_parameters()).await.is_err());
        assert!(transport.produce(MediaKind::Video, vp8_parameters()).await.is_ok());
    }

    #[tokio::test]
    async fn test_media_delay_holds_transport_and_produce() {
        let engine = LoopbackEngine::new();
        let router = router(&engine).await;
        engine.set_media_delay(Duration::from_millis(30));

        let started = std::time::Instant::now();
        let transport = connected_transport(&router).await;
        assert!(started.elapsed() >= Duration::from_millis(30));

        let started = std::time::Instant::now();
        transport
            .produce(MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_simulcast_producer_yields_simulcast_consumer() {
        let engine = LoopbackEngine::new();
        let router = router(&engine).await;
        let send = connected_transport(&router).await;
        let recv = connected_transport(&router).await;

        let params = json!({
            "codecs": [{ "mimeType": "video/VP8" }],
            "encodings": [{ "rid": "r0" }, { "rid": "r1" }, { "rid": "r2" }]
        });
        let producer = send.produce(MediaKind::Video, params).await.unwrap();
        let consumer = recv
            .consume(&producer.id(), router.rtp_capabilities(), true)
            .await
            .unwrap();

        assert_eq!(consumer.consumer_type(), "simulcast");
        assert!(consumer.set_preferred_layers(2, 2).await.is_ok());
    }
}
