//! SFU signaling error types.
//!
//! Every peer-facing failure travels back on the request's reply channel as a
//! structured error. Internal details are logged server-side but not exposed
//! to clients. Worker death is the only fatal variant; it never reaches a
//! peer and terminates the process instead.

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::store::StoreError;

use common::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy exposed to clients and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Frame could not be parsed into a known request.
    InvalidMessage,
    /// Request issued in a state that does not permit it.
    ProtocolViolation,
    /// Referenced room, peer, transport, producer or consumer does not exist.
    NotFound,
    /// Router rejected the consume request's capabilities.
    IncompatibleCapabilities,
    /// Media engine rejected the call; the client may retry.
    TransientFailure,
    /// A media worker died. Never sent to a peer.
    WorkerFatal,
    /// Server is draining or has no capacity.
    Unavailable,
    /// Anything else.
    Internal,
}

impl ErrorCategory {
    /// Returns the category as a string for labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidMessage => "invalid_message",
            ErrorCategory::ProtocolViolation => "protocol_violation",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::IncompatibleCapabilities => "incompatible_capabilities",
            ErrorCategory::TransientFailure => "transient_failure",
            ErrorCategory::WorkerFatal => "worker_fatal",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Internal => "internal",
        }
    }
}

/// SFU signaling error type.
///
/// Maps to signaling error codes:
/// - `InvalidMessage`: `INVALID_MESSAGE` (1)
/// - `*NotFound`, `NoReceiverTransport`: `NOT_FOUND` (4)
/// - `ProtocolViolation`: `PROTOCOL_VIOLATION` (5)
/// - Internal, Store, Config, `WorkerDied`: `INTERNAL_ERROR` (6)
/// - `Draining`, `NoWorkers`: `UNAVAILABLE` (7)
/// - `IncompatibleCapabilities`: `INCOMPATIBLE_CAPABILITIES` (8)
/// - `Engine`: `MEDIA_ENGINE_FAILURE` (9)
#[derive(Debug, Error)]
pub enum SfuError {
    /// Malformed or unknown signaling message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Request is not allowed in the current session or entity state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Peer not found in the room.
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Transport not found for this peer.
    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    /// Consume requested before the peer created its receiver transport.
    #[error("Receiver transport not found")]
    NoReceiverTransport,

    /// Producer not found in the room.
    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    /// Consumer not found for this peer.
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// Router reports the peer cannot consume the producer.
    #[error("Incompatible RTP capabilities for producer {0}")]
    IncompatibleCapabilities(ProducerId),

    /// Media engine call failed (malformed negotiation parameters, closed entity).
    #[error("Media engine error: {0}")]
    Engine(String),

    /// A media worker terminated unexpectedly.
    #[error("Media worker {worker_index} died: {reason}")]
    WorkerDied { worker_index: usize, reason: String },

    /// The worker pool has no workers to assign.
    #[error("No media workers available")]
    NoWorkers,

    /// Server is draining (graceful shutdown).
    #[error("Server is draining")]
    Draining,

    /// Room-record store failure.
    #[error("Room store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            SfuError::InvalidMessage(_) => 1, // INVALID_MESSAGE
            SfuError::RoomNotFound(_)
            | SfuError::PeerNotFound(_)
            | SfuError::TransportNotFound(_)
            | SfuError::NoReceiverTransport
            | SfuError::ProducerNotFound(_)
            | SfuError::ConsumerNotFound(_) => 4, // NOT_FOUND
            SfuError::ProtocolViolation(_) => 5, // PROTOCOL_VIOLATION
            SfuError::WorkerDied { .. }
            | SfuError::Store(_)
            | SfuError::Config(_)
            | SfuError::Internal(_) => 6, // INTERNAL_ERROR
            SfuError::NoWorkers | SfuError::Draining => 7, // UNAVAILABLE
            SfuError::IncompatibleCapabilities(_) => 8, // INCOMPATIBLE_CAPABILITIES
            SfuError::Engine(_) => 9,                   // MEDIA_ENGINE_FAILURE
        }
    }

    /// Returns the taxonomy category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SfuError::InvalidMessage(_) => ErrorCategory::InvalidMessage,
            SfuError::ProtocolViolation(_) => ErrorCategory::ProtocolViolation,
            SfuError::RoomNotFound(_)
            | SfuError::PeerNotFound(_)
            | SfuError::TransportNotFound(_)
            | SfuError::NoReceiverTransport
            | SfuError::ProducerNotFound(_)
            | SfuError::ConsumerNotFound(_) => ErrorCategory::NotFound,
            SfuError::IncompatibleCapabilities(_) => ErrorCategory::IncompatibleCapabilities,
            SfuError::Engine(_) => ErrorCategory::TransientFailure,
            SfuError::WorkerDied { .. } => ErrorCategory::WorkerFatal,
            SfuError::NoWorkers | SfuError::Draining => ErrorCategory::Unavailable,
            SfuError::Store(_) | SfuError::Config(_) | SfuError::Internal(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Returns true if the client can retry the same request unchanged
    /// (or with corrected negotiation parameters).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::TransientFailure | ErrorCategory::Unavailable
        )
    }

    /// Returns true if the error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::WorkerFatal
    }

    /// Returns a bounded label string for the error variant (for metrics).
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SfuError::InvalidMessage(_) => "invalid_message",
            SfuError::ProtocolViolation(_) => "protocol_violation",
            SfuError::RoomNotFound(_) => "room_not_found",
            SfuError::PeerNotFound(_) => "peer_not_found",
            SfuError::TransportNotFound(_) => "transport_not_found",
            SfuError::NoReceiverTransport => "no_receiver_transport",
            SfuError::ProducerNotFound(_) => "producer_not_found",
            SfuError::ConsumerNotFound(_) => "consumer_not_found",
            SfuError::IncompatibleCapabilities(_) => "incompatible_capabilities",
            SfuError::Engine(_) => "engine",
            SfuError::WorkerDied { .. } => "worker_died",
            SfuError::NoWorkers => "no_workers",
            SfuError::Draining => "draining",
            SfuError::Store(_) => "store",
            SfuError::Config(_) => "config",
            SfuError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SfuError::InvalidMessage(detail) => format!("Malformed signaling message: {detail}"),
            SfuError::ProtocolViolation(msg) => msg.clone(),
            SfuError::RoomNotFound(_) => "Room not found".to_string(),
            SfuError::PeerNotFound(_) => "Peer not found".to_string(),
            SfuError::TransportNotFound(_) => "Transport not found".to_string(),
            SfuError::NoReceiverTransport => {
                "Create and connect a receiver transport before consuming".to_string()
            }
            SfuError::ProducerNotFound(_) => "Producer not found".to_string(),
            SfuError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            SfuError::IncompatibleCapabilities(_) => {
                "RTP capabilities are incompatible with the producer".to_string()
            }
            SfuError::Engine(detail) => format!("Media engine rejected the request: {detail}"),
            SfuError::NoWorkers => "No media capacity available, please try again".to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::WorkerDied { .. }
            | SfuError::Store(_)
            | SfuError::Config(_)
            | SfuError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::WorkerDied {
                worker_index,
                reason,
            } => SfuError::WorkerDied {
                worker_index,
                reason,
            },
            other => SfuError::Engine(other.to_string()),
        }
    }
}

impl From<StoreError> for SfuError {
    fn from(err: StoreError) -> Self {
        SfuError::Store(err.to_string())
    }
}

impl From<ConfigError> for SfuError {
    fn from(err: ConfigError) -> Self {
        SfuError::Config(err.to_string())
    }
}
