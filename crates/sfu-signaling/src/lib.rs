//! SFU Signaling Library
//!
//! This library provides the signaling and session-orchestration core of a
//! selective forwarding unit:
//!
//! - A fixed pool of media workers with per-worker RTC port slices
//! - One router per active room, placed on a worker by load
//! - Room membership and per-peer transports, producers and consumers
//! - Cascading cleanup with exactly-once removal notifications
//! - A JSON request/response protocol over WebSocket
//!
//! Media forwarding itself lives behind the [`engine`] traits; this crate
//! never touches RTP.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool (N media workers, started at boot)
//! └── RouterRegistry (room -> router, lazily created)
//!
//! RoomRegistryActor (singleton per SFU instance)
//! ├── supervises N RoomActors
//! │   └── RoomActor (one per active room)
//! │       └── PeerSession per joined peer
//! └── parents N ConnectionActors
//!     └── ConnectionActor (one per signaling WebSocket)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine seam and the in-process loopback engine
//! - [`errors`] - Error types with client-facing codes
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`routers`] - Room to router mapping
//! - [`signaling`] - Wire protocol and WebSocket adapter
//! - [`store`] - Room records for registered admission
//! - [`workers`] - Media worker pool

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod routers;
pub mod signaling;
pub mod store;
pub mod workers;
