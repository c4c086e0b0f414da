//! SFU Signaling Service
//!
//! Signaling and session orchestration for a selective forwarding unit.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3016, path `/ws`)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Start the media worker pool (fails startup if any worker fails). The
//!    pool runs on mediasoup when built with the `mediasoup` feature and on
//!    the in-process loopback engine otherwise
//! 4. Initialize the room registry actor
//! 5. Start health and signaling servers
//! 6. Wait for a shutdown signal or a worker death
//!
//! A dead media worker takes its routers with it, so the process exits with
//! an error and leaves recovery to the supervisor.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::config::{LogFormat, ObservabilityConfig};
use metrics_exporter_prometheus::PrometheusHandle;
use sfu_signaling::actors::{ActorMetrics, RegistrySettings, RoomRegistryActor};
use sfu_signaling::config::Config;
#[cfg(not(feature = "mediasoup"))]
use sfu_signaling::engine::LoopbackEngine;
#[cfg(feature = "mediasoup")]
use sfu_signaling::engine::MediasoupEngine;
use sfu_signaling::engine::{EngineError, MediaEngine};
use sfu_signaling::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_signaling::routers::RouterRegistry;
use sfu_signaling::signaling::ws::{signaling_router, SignalingState};
use sfu_signaling::store::InMemoryRoomStore;
use sfu_signaling::workers::WorkerPool;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default log filter when `RUST_LOG` and `SFU_LOG_FILTER` are unset.
const DEFAULT_LOG_FILTER: &str = "sfu_signaling=debug,sfu=info,tower_http=info";

/// Grace period for the registry task after it acknowledged shutdown.
const REGISTRY_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();

    let default_observability = ObservabilityConfig::default();
    init_tracing(
        config
            .as_ref()
            .map_or(&default_observability, |c| &c.observability),
    );

    info!("Starting SFU signaling service");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        num_workers = config.num_workers,
        rtc_min_port = config.rtc_port_range.min,
        rtc_max_port = config.rtc_port_range.max,
        worker_selection = ?config.worker_selection,
        room_reclaim = ?config.room_reclaim,
        room_admission = ?config.room_admission,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Start media workers (MUST succeed - fail startup if any worker fails)
    info!(num_workers = config.num_workers, "Starting media workers...");
    let engine = media_engine().map_err(|e| {
        error!(error = %e, "Failed to initialize media engine");
        e
    })?;
    let pool = WorkerPool::start(
        engine.as_ref(),
        config.num_workers,
        config.rtc_port_range,
        config.worker_selection,
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start media workers");
        e
    })?;
    info!(num_workers = pool.len(), "Media workers started");

    // Initialize actor system
    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let routers = Arc::new(RouterRegistry::new(Arc::clone(&pool)));
    let store = Arc::new(InMemoryRoomStore::new());
    let (registry, registry_task) = RoomRegistryActor::spawn(
        RegistrySettings::from_config(&config),
        routers,
        store,
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    // Servers stop on a child of the registry token
    let shutdown_token = registry.child_token();

    // Health server (liveness, readiness and Prometheus /metrics)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let health_app =
        health_router(Arc::clone(&health_state)).merge(metrics_router(prometheus_handle));

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    info!(addr = %signaling_addr, "Signaling server bound successfully");

    spawn_server("Health", health_listener, health_app, shutdown_token.child_token());

    let signaling_app = signaling_router(SignalingState {
        registry: registry.clone(),
        metrics: Arc::clone(&actor_metrics),
        egress_buffer: config.peer_egress_buffer,
    })
    .layer(TraceLayer::new_for_http());
    spawn_server(
        "Signaling",
        signaling_listener,
        signaling_app,
        shutdown_token.child_token(),
    );

    health_state.set_ready();
    info!("SFU signaling service running - press Ctrl+C to shutdown");

    let worker_death = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            None
        }
        death = pool.wait_for_worker_death() => {
            error!(
                worker_index = death.worker_index,
                reason = %death.reason,
                "Media worker died, shutting down"
            );
            Some(death)
        }
    };

    // Mark as not ready immediately so the load balancer stops sending traffic
    health_state.set_not_ready();

    let deadline = Duration::from_secs(config.shutdown_deadline_seconds);
    if let Err(e) = registry.shutdown(deadline).await {
        warn!(error = %e, "Actor system shutdown error");
    }
    shutdown_token.cancel();

    match tokio::time::timeout(REGISTRY_JOIN_TIMEOUT, registry_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = ?e, "Room registry task failed"),
        Err(_) => warn!("Room registry did not stop in time"),
    }

    pool.close().await;

    if let Some(death) = worker_death {
        return Err(format!(
            "media worker {} died: {}",
            death.worker_index, death.reason
        )
        .into());
    }

    info!("SFU signaling service shutdown complete");
    Ok(())
}

#[cfg(feature = "mediasoup")]
fn media_engine() -> Result<Box<dyn MediaEngine>, EngineError> {
    info!("Using the mediasoup media engine");
    Ok(Box::new(MediasoupEngine::new()?))
}

#[cfg(not(feature = "mediasoup"))]
#[allow(clippy::unnecessary_wraps)] // matches the mediasoup variant
fn media_engine() -> Result<Box<dyn MediaEngine>, EngineError> {
    warn!("Built without the mediasoup feature, media will not be forwarded");
    Ok(Box::new(LoopbackEngine::new()))
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter.
fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        observability
            .log_filter
            .as_deref()
            .unwrap_or(DEFAULT_LOG_FILTER)
            .into()
    });

    match observability.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// `/metrics` endpoint served by the Prometheus exporter.
fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

fn spawn_server(
    name: &'static str,
    listener: tokio::net::TcpListener,
    app: Router,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        info!(server = name, "Server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            info!(server = name, "Server shutting down");
        });
        if let Err(e) = server.await {
            error!(server = name, error = %e, "Server failed");
        }
    });
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
