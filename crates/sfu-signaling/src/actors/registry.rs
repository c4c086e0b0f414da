//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! The `RoomRegistryActor` is the top-level actor of the signaling core:
//!
//! - Singleton per SFU instance
//! - Maps room ids to `RoomActor`s, creating them on first join
//! - Applies room admission (open, or registered in the room store)
//! - Reclaims empty rooms
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! Room lookups never wait on a room; only reclaim does, and a room that
//! was re-populated before the reclaim arrived stays registered.

use crate::config::{Config, ReclaimPolicy, RoomAdmission, RoomSettings};
use crate::errors::SfuError;
use crate::routers::RouterRegistry;
use crate::store::RoomStore;

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomContext};

use common::types::RoomId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Drain budget when the channel closes without an explicit shutdown.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Registry behavior taken from configuration.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub instance_id: String,
    pub reclaim: ReclaimPolicy,
    pub admission: RoomAdmission,
    pub room: Arc<RoomSettings>,
}

impl RegistrySettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            reclaim: config.room_reclaim,
            admission: config.room_admission,
            room: Arc::new(config.room.clone()),
        }
    }
}

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface for interacting with the registry.
/// All methods are async and return results via oneshot channels.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Get the room's actor, creating the room on first use.
    pub async fn get_or_create_room(&self, room_id: RoomId) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get an existing room's actor.
    pub async fn get_room(&self, room_id: RoomId) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove an empty room, releasing its router.
    pub async fn remove_room(&self, room_id: RoomId) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::RemoveRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get the current registry status.
    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for spawning connection actors.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    settings: RegistrySettings,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    rooms: HashMap<RoomId, ManagedRoom>,
    /// Whether new rooms may be created.
    accepting_new: bool,
    /// Budget for draining all rooms once shutdown begins.
    shutdown_deadline: Duration,
    routers: Arc<RouterRegistry>,
    store: Arc<dyn RoomStore>,
    /// Context handed to each new room.
    room_ctx: RoomContext,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    /// Spawn the registry actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        settings: RegistrySettings,
        routers: Arc<RouterRegistry>,
        store: Arc<dyn RoomStore>,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomRegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let room_ctx = RoomContext {
            routers: Arc::clone(&routers),
            settings: Arc::clone(&settings.room),
            reclaim: settings.reclaim,
            metrics: Arc::clone(&metrics),
            registry: sender.downgrade(),
        };

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Registry, settings.instance_id.as_str()),
            settings,
            receiver,
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            accepting_new: true,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            routers,
            store,
            room_ctx,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomRegistryHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "sfu.actor.registry",
        fields(instance_id = %self.settings.instance_id)
    )]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            reclaim = ?self.settings.reclaim,
            admission = ?self.settings.admission,
            "RoomRegistryActor started"
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        instance_id = %self.settings.instance_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_receive(self.receiver.len());
                            self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                instance_id = %self.settings.instance_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to,
            } => {
                let result = self.get_or_create_room(room_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let result = self
                    .rooms
                    .get(&room_id)
                    .map(|managed| managed.handle.clone())
                    .ok_or(SfuError::RoomNotFound(room_id));
                let _ = respond_to.send(result);
            }

            RegistryMessage::RemoveRoom {
                room_id,
                respond_to,
            } => {
                let result = self.remove_room(&room_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::RoomEmptied { room_id } => {
                self.reclaim_room(&room_id).await;
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                let result = self.initiate_shutdown(deadline);
                let _ = respond_to.send(result);
            }
        }
    }

    async fn get_or_create_room(&mut self, room_id: RoomId) -> Result<RoomActorHandle, SfuError> {
        if let Some(managed) = self.rooms.get(&room_id) {
            return Ok(managed.handle.clone());
        }

        if !self.accepting_new {
            return Err(SfuError::Draining);
        }

        if self.settings.admission == RoomAdmission::Registered {
            let record = self.store.get_room_record(&room_id).await?;
            if !record.is_some_and(|r| !r.deleted) {
                debug!(
                    target: "sfu.actor.registry",
                    room_id = %room_id,
                    "Join refused, room is not registered"
                );
                return Err(SfuError::RoomNotFound(room_id));
            }
        }

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            self.cancel_token.child_token(),
            self.room_ctx.clone(),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.metrics.room_created();

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    async fn remove_room(&mut self, room_id: &RoomId) -> Result<(), SfuError> {
        let Some(managed) = self.rooms.get(room_id) else {
            return Err(SfuError::RoomNotFound(room_id.clone()));
        };

        // A room whose actor already exited counts as closed
        let closed = managed.handle.try_close().await.unwrap_or(true);
        if !closed {
            return Err(SfuError::ProtocolViolation("room is not empty".to_string()));
        }

        self.unregister(room_id).await;
        Ok(())
    }

    /// Close a room that reported itself empty, unless it filled up again.
    async fn reclaim_room(&mut self, room_id: &RoomId) {
        let Some(managed) = self.rooms.get(room_id) else {
            return;
        };

        match managed.handle.try_close().await {
            Ok(true) | Err(_) => {
                self.unregister(room_id).await;
            }
            Ok(false) => {
                debug!(
                    target: "sfu.actor.registry",
                    room_id = %room_id,
                    "Reclaim skipped, room was re-populated"
                );
            }
        }
    }

    /// Drop a closed room and reap its task in the background.
    ///
    /// The router is released here as well: a room whose actor died never
    /// released it, and a later room with the same id must not inherit it.
    async fn unregister(&mut self, room_id: &RoomId) {
        let Some(managed) = self.rooms.remove(room_id) else {
            return;
        };
        self.metrics.room_removed();
        self.routers.release(room_id).await;

        let room_id_owned = room_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                    managed.handle.cancel();
                }
            }
        });

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room removed"
        );
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            peer_count: self.metrics.peer_count(),
            connection_count: self.metrics.connection_count(),
            router_count: self.routers.router_count(),
            worker_loads: self.routers.pool().loads(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    fn initiate_shutdown(&mut self, deadline: Duration) -> Result<(), SfuError> {
        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            room_count = self.rooms.len(),
            deadline_secs = deadline.as_secs(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.shutdown_deadline = deadline;
        self.cancel_token.cancel();
        Ok(())
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;
        let deadline = tokio::time::Instant::now() + self.shutdown_deadline;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout_at(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            "Graceful shutdown complete"
        );
    }

    /// Check health of managed room actors.
    async fn check_room_health(&mut self) {
        let finished: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        error = ?join_error,
                        "Room actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Room);
                }
                Err(_) => {}
            }

            // No-op if the room released its router before exiting
            self.routers.release(&room_id).await;
            self.metrics.room_removed();
        }
    }
}
