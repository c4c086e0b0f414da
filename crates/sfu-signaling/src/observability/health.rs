//! Health endpoints for the SFU signaling service.
//!
//! Provides Kubernetes-compatible health endpoints:
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (workers started and not draining?)
//!
//! The `/metrics` endpoint is merged onto the same listener in `main.rs`
//! and rendered by `metrics-exporter-prometheus`.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health state for the SFU signaling service.
#[derive(Debug)]
pub struct HealthState {
    /// Always true after startup.
    live: AtomicBool,
    /// True once the worker pool is up and the signaling listener is bound.
    /// Cleared when shutdown begins or a worker dies.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        app.oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
    }

    #[test]
    fn test_health_state_transitions() {
        let state = HealthState::new();

        state.set_ready();
        assert!(state.is_ready());

        state.set_not_ready();
        assert!(!state.is_ready(), "Draining clears readiness");
        assert!(state.is_live(), "Draining does not clear liveness");
    }

    #[tokio::test]
    async fn test_readiness_follows_state() {
        let state = Arc::new(HealthState::new());

        assert_eq!(
            status_of(health_router(Arc::clone(&state)), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_ready();
        assert_eq!(
            status_of(health_router(Arc::clone(&state)), "/ready").await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_liveness_endpoint_ok() {
        let state = Arc::new(HealthState::new());
        assert_eq!(status_of(health_router(state), "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let state = Arc::new(HealthState::new());
        assert_eq!(
            status_of(health_router(state), "/unknown").await,
            StatusCode::NOT_FOUND
        );
    }
}
