//! Observability module for the SFU signaling service.
//!
//! # Privacy by Default
//!
//! Instrumented functions use `#[instrument(skip_all)]` with explicit fields.
//! Negotiation payloads (DTLS fingerprints, ICE credentials, RTP parameters)
//! and chat text are never logged. Metric labels are bounded; identifiers
//! never become labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Live rooms |
//! | `sfu_peers_active` | Gauge | none | Joined peers |
//! | `sfu_worker_load` | Gauge | `worker` | Live routers per worker |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `sfu_signaling_requests_total` | Counter | `request_type`, `status` | Request outcomes |
//! | `sfu_signaling_request_duration_seconds` | Histogram | `request_type` | Request latency |
//! | `sfu_cascade_closed_total` | Counter | `entity` | Entities closed by cascades |
//! | `sfu_notifications_dropped_total` | Counter | none | Full egress queues |
//! | `sfu_worker_deaths_total` | Counter | none | Fatal worker terminations |
//! | `sfu_actor_panics_total` | Counter | `actor_type` | Actor task panics |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_cascade_closed,
    record_notification_dropped, record_signaling_request, record_worker_death,
    set_actor_mailbox_depth, set_peers_active, set_rooms_active, set_worker_load,
};
