//! Test server harness for end-to-end signaling tests.
//!
//! Provides `TestSfu` for spawning a real signaling stack in tests: worker
//! pool, router registry, room registry actor and the WebSocket endpoint,
//! all on top of a shared `LoopbackEngine`.

use axum::Router;
use common::types::RoomId;
use sfu_signaling::actors::{
    ActorMetrics, RegistrySettings, RegistryStatus, RoomRegistryActor, RoomRegistryHandle,
};
use sfu_signaling::config::Config;
use sfu_signaling::engine::LoopbackEngine;
use sfu_signaling::observability::{health_router, HealthState};
use sfu_signaling::routers::RouterRegistry;
use sfu_signaling::signaling::ws::{signaling_router, SignalingState};
use sfu_signaling::store::{InMemoryRoomStore, RoomStore};
use sfu_signaling::workers::WorkerPool;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long `wait_for` polls before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for [`TestSfu`].
pub struct TestSfuBuilder {
    vars: HashMap<String, String>,
    router_delay: Duration,
    store: Option<Arc<dyn RoomStore>>,
}

impl Default for TestSfuBuilder {
    fn default() -> Self {
        let vars = HashMap::from([
            ("SFU_INSTANCE_ID".to_string(), "sfu-test".to_string()),
            ("SFU_NUM_WORKERS".to_string(), "2".to_string()),
            ("SFU_RTC_MIN_PORT".to_string(), "40000".to_string()),
            ("SFU_RTC_MAX_PORT".to_string(), "40199".to_string()),
            ("SFU_LISTEN_IP".to_string(), "127.0.0.1".to_string()),
        ]);
        Self {
            vars,
            router_delay: Duration::ZERO,
            store: None,
        }
    }
}

impl TestSfuBuilder {
    #[must_use]
    pub fn workers(self, count: usize) -> Self {
        self.var("SFU_NUM_WORKERS", &count.to_string())
    }

    /// `eager` or `lazy`.
    #[must_use]
    pub fn reclaim(self, policy: &str) -> Self {
        self.var("SFU_ROOM_RECLAIM", policy)
    }

    /// `open` or `registered`.
    #[must_use]
    pub fn admission(self, admission: &str) -> Self {
        self.var("SFU_ROOM_ADMISSION", admission)
    }

    /// `least-loaded` or `round-robin`.
    #[must_use]
    pub fn worker_selection(self, selection: &str) -> Self {
        self.var("SFU_WORKER_SELECTION", selection)
    }

    /// Set any configuration variable.
    #[must_use]
    pub fn var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    /// Slow down router creation to widen race windows.
    #[must_use]
    pub fn router_delay(mut self, delay: Duration) -> Self {
        self.router_delay = delay;
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn RoomStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start the stack and bind the WebSocket endpoint to a random port.
    pub async fn spawn(self) -> Result<TestSfu, anyhow::Error> {
        let config = Config::from_vars(&self.vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let engine = LoopbackEngine::with_router_delay(self.router_delay);
        let pool = WorkerPool::start(
            &engine,
            config.num_workers,
            config.rtc_port_range,
            config.worker_selection,
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start workers: {}", e))?;

        let routers = Arc::new(RouterRegistry::new(Arc::clone(&pool)));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryRoomStore::new()));
        let metrics = ActorMetrics::new();
        let (registry, registry_task) = RoomRegistryActor::spawn(
            RegistrySettings::from_config(&config),
            Arc::clone(&routers),
            store,
            Arc::clone(&metrics),
        );

        let health = Arc::new(HealthState::new());
        health.set_ready();

        let app: Router = signaling_router(SignalingState {
            registry: registry.clone(),
            metrics: Arc::clone(&metrics),
            egress_buffer: config.peer_egress_buffer,
        })
        .merge(health_router(Arc::clone(&health)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(TestSfu {
            addr,
            config,
            engine,
            pool,
            routers,
            registry,
            metrics,
            health,
            registry_task: Some(registry_task),
            server,
        })
    }
}

/// A running signaling stack.
///
/// # Example
/// ```rust,ignore
/// let sfu = TestSfu::builder().reclaim("lazy").spawn().await?;
/// let mut client = TestClient::connect(&sfu.ws_url()).await?;
/// client.join("room-1").await?;
/// assert_eq!(sfu.status().await?.room_count, 1);
/// ```
pub struct TestSfu {
    addr: SocketAddr,
    config: Config,
    engine: LoopbackEngine,
    pool: Arc<WorkerPool>,
    routers: Arc<RouterRegistry>,
    registry: RoomRegistryHandle,
    metrics: Arc<ActorMetrics>,
    health: Arc<HealthState>,
    registry_task: Option<JoinHandle<()>>,
    server: JoinHandle<()>,
}

impl TestSfu {
    #[must_use]
    pub fn builder() -> TestSfuBuilder {
        TestSfuBuilder::default()
    }

    /// Spawn with default settings (2 workers, eager reclaim, open admission).
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::builder().spawn().await
    }

    /// WebSocket signaling URL.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Base HTTP URL (health endpoints).
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared engine; clones observe the same state.
    pub fn engine(&self) -> &LoopbackEngine {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn routers(&self) -> &Arc<RouterRegistry> {
        &self.routers
    }

    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub async fn status(&self) -> Result<RegistryStatus, anyhow::Error> {
        self.registry
            .get_status()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get registry status: {}", e))
    }

    /// True if the registry currently holds `room_id`.
    pub async fn has_room(&self, room_id: &str) -> bool {
        self.registry.get_room(RoomId::from(room_id)).await.is_ok()
    }

    /// Poll `check` until it returns true or the wait times out.
    ///
    /// Room reclaim and disconnect cleanup happen asynchronously after the
    /// socket closes; tests wait on their observable effects.
    pub async fn wait_for<F, Fut>(&self, what: &str, mut check: F) -> Result<(), anyhow::Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if check().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the engine holds no transports, producers or consumers.
    pub async fn wait_for_media_released(&self) -> Result<(), anyhow::Error> {
        let engine = self.engine.clone();
        self.wait_for("media entities to close", move || {
            let stats = engine.stats();
            async move {
                stats.live_transports == 0 && stats.live_producers == 0 && stats.live_consumers == 0
            }
        })
        .await
    }

    /// Drain the registry and wait for its task to exit.
    pub async fn shutdown(mut self, deadline: Duration) -> Result<(), anyhow::Error> {
        self.health.set_not_ready();
        self.registry
            .shutdown(deadline)
            .await
            .map_err(|e| anyhow::anyhow!("Registry shutdown failed: {}", e))?;
        if let Some(task) = self.registry_task.take() {
            tokio::time::timeout(WAIT_TIMEOUT, task)
                .await
                .map_err(|_| anyhow::anyhow!("Registry task did not exit"))?
                .map_err(|e| anyhow::anyhow!("Registry task failed: {}", e))?;
        }
        self.pool.close().await;
        Ok(())
    }
}

impl Drop for TestSfu {
    fn drop(&mut self) {
        self.server.abort();
        self.registry.cancel();
    }
}
