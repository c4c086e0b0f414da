//! Actor metrics and mailbox monitoring.
//!
//! Mailbox depth thresholds:
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Registry   | < 100  | 100-500 | > 500    |
//! | Room       | < 100  | 100-500 | > 500    |
//! | Connection | < 50   | 50-200  | > 200    |
//!
//! Counts kept here are mirrored to the `sfu_` Prometheus gauges.

use crate::observability::metrics as prom;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for registry and room actors.
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for connection actors.
pub const CONNECTION_MAILBOX_NORMAL: usize = 50;
pub const CONNECTION_MAILBOX_WARNING: usize = 200;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// RoomRegistryActor (singleton).
    Registry,
    /// RoomActor (one per room).
    Room,
    /// ConnectionActor (one per signaling connection).
    Connection,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth for one actor and emits the depth gauge.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room id, peer id or instance id.
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message taken from the mailbox. `queued` is the number of
    /// messages still waiting behind it.
    pub fn record_receive(&self, queued: usize) {
        let depth = queued + 1;
        let previous = self.depth.swap(depth, Ordering::Relaxed);
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);

        let level = self.level_for_depth(depth);
        if level == self.level_for_depth(previous) {
            return;
        }
        match level {
            MailboxLevel::Critical => {
                warn!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning => {
                warn!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    threshold = self.actor_type.normal_threshold(),
                    "Mailbox depth elevated"
                );
            }
            MailboxLevel::Normal => {
                debug!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth,
                    "Mailbox depth back to normal"
                );
            }
        }
    }

    /// Record a message finished processing. `queued` is the backlog left.
    pub fn record_processed(&self, queued: usize) {
        self.depth.store(queued, Ordering::Relaxed);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), queued);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated counts for the actor system, shared by every actor.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    /// Rooms currently registered.
    pub active_rooms: AtomicUsize,
    /// Peers currently joined to a room.
    pub active_peers: AtomicUsize,
    /// Signaling connections currently open.
    pub active_connections: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    /// Total messages processed across all actors.
    pub total_messages_processed: AtomicU64,
}

/// Point-in-time copy of [`ActorMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorMetricsSnapshot {
    pub rooms: usize,
    pub peers: usize,
    pub connections: usize,
    pub panics: u64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let count = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_rooms_active(count as u64);
    }

    pub fn room_removed(&self) {
        let count = decrement(&self.active_rooms);
        prom::set_rooms_active(count as u64);
    }

    pub fn peer_joined(&self) {
        let count = self.active_peers.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_peers_active(count as u64);
    }

    pub fn peer_left(&self) {
        let count = decrement(&self.active_peers);
        prom::set_peers_active(count as u64);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        decrement(&self.active_connections);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        self.actor_panics.fetch_add(1, Ordering::Relaxed);
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "sfu.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = self.actor_panics.load(Ordering::Relaxed),
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.active_peers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> ActorMetricsSnapshot {
        ActorMetricsSnapshot {
            rooms: self.room_count(),
            peers: self.peer_count(),
            connections: self.connection_count(),
            panics: self.actor_panics.load(Ordering::Relaxed),
        }
    }
}

/// Saturating atomic decrement, returning the new value.
fn decrement(counter: &AtomicUsize) -> usize {
    let previous = counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        })
        .unwrap_or(0);
    previous.saturating_sub(1)
}
