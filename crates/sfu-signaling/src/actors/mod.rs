//! Actor hierarchy of the signaling core.
//!
//! ```text
//! RoomRegistryActor (singleton per SFU instance)
//! ├── supervises N RoomActors
//! │   └── RoomActor (one per active room)
//! │       ├── owns membership and per-peer media state
//! │       └── holds the room's router
//! └── parents N ConnectionActors (cancellation only)
//!     └── ConnectionActor (one per signaling connection)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One room per connection**: a peer is in at most one room at a time
//! - **Serialized room state**: a room's actor is the only writer of its state
//! - **CancellationToken propagation**: parents pass child tokens for graceful shutdown
//! - **Mailbox monitoring**: depth thresholds with metrics (Room: 100/500, Connection: 50/200)
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` that creates, looks up and reclaims rooms
//! - [`room`] - `RoomActor` per active room
//! - [`connection`] - `ConnectionActor` per signaling connection
//! - [`peer`] - a peer's transports, producers and consumers
//! - [`cascade`] - dependent closure and removal notifications
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod cascade;
pub mod connection;
pub mod messages;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod room;

// Re-export primary types
pub use cascade::{CascadeCleanup, CascadeReport};
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorMetricsSnapshot, ActorType, MailboxMonitor};
pub use registry::{RegistrySettings, RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle, RoomContext};
