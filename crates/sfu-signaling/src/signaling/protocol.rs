//! Signaling wire format.
//!
//! Client frames are JSON objects carrying a request id and a `type` tag:
//!
//! ```json
//! {"id": 7, "type": "connectTransport", "transportId": "...", "dtlsParameters": {...}}
//! ```
//!
//! Server frames are tagged `response`, `error` or `notification`. Every
//! request gets exactly one `response` or `error` with the same id.
//! Negotiation blobs are opaque; only their presence and JSON object shape
//! are checked here.

use crate::engine::TransportParameters;
use crate::errors::{ErrorCategory, SfuError};

use common::types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest accepted client frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Longest accepted room identifier, in characters.
pub const MAX_ROOM_ID_CHARS: usize = 128;

/// Longest accepted chat message, in characters.
pub const MAX_CHAT_CHARS: usize = 4096;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// One signaling request from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    Join {
        room_id: RoomId,
    },
    GetRouterCapabilities,
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: Value,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: Value,
    },
    Resume {
        consumer_id: ConsumerId,
    },
    PauseProducer {
        producer_id: ProducerId,
    },
    ResumeProducer {
        producer_id: ProducerId,
    },
    CloseTransport {
        transport_id: TransportId,
    },
    CloseProducer {
        producer_id: ProducerId,
    },
    CloseConsumer {
        consumer_id: ConsumerId,
    },
    Chat {
        text: String,
    },
    Leave,
}

impl ClientRequest {
    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn request_type(&self) -> &'static str {
        match self {
            ClientRequest::Join { .. } => "join",
            ClientRequest::GetRouterCapabilities => "get_router_capabilities",
            ClientRequest::CreateTransport { .. } => "create_transport",
            ClientRequest::ConnectTransport { .. } => "connect_transport",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::Resume { .. } => "resume",
            ClientRequest::PauseProducer { .. } => "pause_producer",
            ClientRequest::ResumeProducer { .. } => "resume_producer",
            ClientRequest::CloseTransport { .. } => "close_transport",
            ClientRequest::CloseProducer { .. } => "close_producer",
            ClientRequest::CloseConsumer { .. } => "close_consumer",
            ClientRequest::Chat { .. } => "chat",
            ClientRequest::Leave => "leave",
        }
    }

    /// Check field shapes that serde alone does not enforce.
    pub fn validate(&self) -> Result<(), SfuError> {
        match self {
            ClientRequest::Join { room_id } => {
                non_empty("roomId", room_id.as_str())?;
                if room_id.as_str().chars().count() > MAX_ROOM_ID_CHARS {
                    return Err(SfuError::InvalidMessage(format!(
                        "roomId exceeds {MAX_ROOM_ID_CHARS} characters"
                    )));
                }
                Ok(())
            }
            ClientRequest::GetRouterCapabilities
            | ClientRequest::CreateTransport { .. }
            | ClientRequest::Leave => Ok(()),
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                non_empty("transportId", transport_id.as_str())?;
                object("dtlsParameters", dtls_parameters)
            }
            ClientRequest::Produce {
                transport_id,
                rtp_parameters,
                ..
            } => {
                non_empty("transportId", transport_id.as_str())?;
                object("rtpParameters", rtp_parameters)
            }
            ClientRequest::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                non_empty("producerId", producer_id.as_str())?;
                object("rtpCapabilities", rtp_capabilities)
            }
            ClientRequest::Resume { consumer_id }
            | ClientRequest::CloseConsumer { consumer_id } => {
                non_empty("consumerId", consumer_id.as_str())
            }
            ClientRequest::PauseProducer { producer_id }
            | ClientRequest::ResumeProducer { producer_id }
            | ClientRequest::CloseProducer { producer_id } => {
                non_empty("producerId", producer_id.as_str())
            }
            ClientRequest::CloseTransport { transport_id } => {
                non_empty("transportId", transport_id.as_str())
            }
            ClientRequest::Chat { text } => {
                let chars = text.chars().count();
                if chars == 0 || chars > MAX_CHAT_CHARS {
                    return Err(SfuError::InvalidMessage(format!(
                        "text must be 1 to {MAX_CHAT_CHARS} characters"
                    )));
                }
                Ok(())
            }
        }
    }
}

fn non_empty(field: &str, value: &str) -> Result<(), SfuError> {
    if value.is_empty() {
        return Err(SfuError::InvalidMessage(format!("{field} must not be empty")));
    }
    Ok(())
}

fn object(field: &str, value: &Value) -> Result<(), SfuError> {
    if !value.is_object() {
        return Err(SfuError::InvalidMessage(format!(
            "{field} must be a JSON object"
        )));
    }
    Ok(())
}

/// A request with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEnvelope {
    pub id: u64,
    pub request: ClientRequest,
}

/// A frame that could not be turned into a request.
///
/// Carries the request id when the frame was readable far enough to have one.
#[derive(Debug)]
pub struct InvalidFrame {
    pub id: Option<u64>,
    pub error: SfuError,
}

impl InvalidFrame {
    fn new(id: Option<u64>, reason: impl Into<String>) -> Self {
        Self {
            id,
            error: SfuError::InvalidMessage(reason.into()),
        }
    }
}

impl ClientEnvelope {
    /// Parse and validate one text frame.
    pub fn parse(text: &str) -> Result<Self, InvalidFrame> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(InvalidFrame::new(
                None,
                format!("frame exceeds {MAX_FRAME_BYTES} bytes"),
            ));
        }

        let value: Value = serde_json::from_str(text)
            .map_err(|e| InvalidFrame::new(None, format!("not valid JSON: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(InvalidFrame::new(None, "frame must be a JSON object"));
        };

        let id = fields
            .remove("id")
            .and_then(|id| id.as_u64())
            .ok_or_else(|| InvalidFrame::new(None, "id must be a non-negative integer"))?;

        let request: ClientRequest = serde_json::from_value(Value::Object(fields))
            .map_err(|e| InvalidFrame::new(Some(id), e.to_string()))?;
        request.validate().map_err(|error| InvalidFrame {
            id: Some(id),
            error,
        })?;

        Ok(Self { id, request })
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SignalingResponse {
    /// Existing producers follow as `producerAvailable` notifications.
    Joined {
        room_id: RoomId,
        peer_id: PeerId,
        /// Other members at the time of joining.
        peers: Vec<PeerId>,
    },
    RouterCapabilities {
        rtp_capabilities: Value,
    },
    TransportCreated {
        direction: TransportDirection,
        transport: TransportParameters,
    },
    TransportConnected {
        transport_id: TransportId,
    },
    Produced {
        producer_id: ProducerId,
    },
    Consumed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        /// Sent as `mediaKind`; `kind` is the response tag.
        #[serde(rename = "mediaKind")]
        kind: MediaKind,
        rtp_parameters: Value,
        consumer_type: String,
        producer_paused: bool,
    },
    ConsumerResumed {
        consumer_id: ConsumerId,
    },
    ProducerPaused {
        producer_id: ProducerId,
    },
    ProducerResumed {
        producer_id: ProducerId,
    },
    TransportClosed {
        transport_id: TransportId,
    },
    ProducerClosed {
        producer_id: ProducerId,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
    },
    ChatSent,
    Left {
        room_id: RoomId,
    },
}

/// Server-initiated event, delivered without a request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Notification {
    PeerJoined {
        room_id: RoomId,
        peer_id: PeerId,
    },
    PeerLeft {
        room_id: RoomId,
        peer_id: PeerId,
    },
    ProducerAvailable {
        room_id: RoomId,
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    ProducerRemoved {
        room_id: RoomId,
        producer_id: ProducerId,
    },
    ProducerPaused {
        room_id: RoomId,
        producer_id: ProducerId,
    },
    ProducerResumed {
        room_id: RoomId,
        producer_id: ProducerId,
    },
    ChatMessage {
        room_id: RoomId,
        peer_id: PeerId,
        text: String,
    },
}

/// Structured error sent to the requesting peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
}

impl From<&SfuError> for ErrorBody {
    fn from(err: &SfuError) -> Self {
        Self {
            code: err.error_code(),
            category: err.category(),
            message: err.client_message(),
            retryable: err.is_retryable(),
        }
    }
}

/// Any frame sent from the server to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Response {
        id: u64,
        data: SignalingResponse,
    },
    Error {
        id: Option<u64>,
        error: ErrorBody,
    },
    Notification {
        notification: Notification,
    },
}

impl ServerMessage {
    /// Build the reply frame for a request outcome.
    #[must_use]
    pub fn reply(id: u64, result: &Result<SignalingResponse, SfuError>) -> Self {
        match result {
            Ok(data) => ServerMessage::Response {
                id,
                data: data.clone(),
            },
            Err(err) => ServerMessage::error(Some(id), err),
        }
    }

    #[must_use]
    pub fn error(id: Option<u64>, err: &SfuError) -> Self {
        ServerMessage::Error {
            id,
            error: ErrorBody::from(err),
        }
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String, SfuError> {
        serde_json::to_string(self)
            .map_err(|e| SfuError::Internal(format!("failed to encode server message: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join() {
        let envelope = ClientEnvelope::parse(r#"{"id":1,"type":"join","roomId":"R1"}"#).unwrap();
        assert_eq!(envelope.id, 1);
        assert_eq!(
            envelope.request,
            ClientRequest::Join {
                room_id: RoomId::from("R1")
            }
        );
    }

    #[test]
    fn test_parse_unit_variants() {
        let envelope = ClientEnvelope::parse(r#"{"id":2,"type":"getRouterCapabilities"}"#).unwrap();
        assert_eq!(envelope.request, ClientRequest::GetRouterCapabilities);

        let envelope = ClientEnvelope::parse(r#"{"id":3,"type":"leave"}"#).unwrap();
        assert_eq!(envelope.request, ClientRequest::Leave);
    }

    #[test]
    fn test_parse_produce_fields() {
        let frame = json!({
            "id": 9,
            "type": "produce",
            "transportId": "t-1",
            "kind": "video",
            "rtpParameters": { "codecs": [] }
        })
        .to_string();

        let envelope = ClientEnvelope::parse(&frame).unwrap();
        match envelope.request {
            ClientRequest::Produce {
                transport_id, kind, ..
            } => {
                assert_eq!(transport_id.as_str(), "t-1");
                assert_eq!(kind, MediaKind::Video);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_keeps_id() {
        let err = ClientEnvelope::parse(r#"{"id":4,"type":"teleport"}"#).unwrap_err();
        assert_eq!(err.id, Some(4));
        assert!(matches!(err.error, SfuError::InvalidMessage(_)));
    }

    #[test]
    fn test_missing_id_rejected() {
        let err = ClientEnvelope::parse(r#"{"type":"leave"}"#).unwrap_err();
        assert_eq!(err.id, None);

        let err = ClientEnvelope::parse(r#"{"id":-1,"type":"leave"}"#).unwrap_err();
        assert_eq!(err.id, None);
    }

    #[test]
    fn test_non_object_frames_rejected() {
        assert!(ClientEnvelope::parse("not json").is_err());
        assert!(ClientEnvelope::parse("[1,2,3]").is_err());
        assert!(ClientEnvelope::parse("42").is_err());
    }

    #[test]
    fn test_blobs_must_be_objects() {
        let frame = json!({
            "id": 5,
            "type": "connectTransport",
            "transportId": "t-1",
            "dtlsParameters": "fingerprint"
        })
        .to_string();

        let err = ClientEnvelope::parse(&frame).unwrap_err();
        assert_eq!(err.id, Some(5));
    }

    #[test]
    fn test_missing_blob_rejected() {
        let err = ClientEnvelope::parse(r#"{"id":6,"type":"consume","producerId":"p"}"#)
            .unwrap_err();
        assert_eq!(err.id, Some(6));
    }

    #[test]
    fn test_chat_length_bounds() {
        let empty = json!({ "id": 7, "type": "chat", "text": "" }).to_string();
        assert!(ClientEnvelope::parse(&empty).is_err());

        let max = json!({ "id": 7, "type": "chat", "text": "é".repeat(MAX_CHAT_CHARS) }).to_string();
        assert!(ClientEnvelope::parse(&max).is_ok());

        let long = json!({ "id": 7, "type": "chat", "text": "x".repeat(MAX_CHAT_CHARS + 1) })
            .to_string();
        assert!(ClientEnvelope::parse(&long).is_err());
    }

    #[test]
    fn test_room_id_bounds() {
        let empty = json!({ "id": 8, "type": "join", "roomId": "" }).to_string();
        assert!(ClientEnvelope::parse(&empty).is_err());

        let long = json!({ "id": 8, "type": "join", "roomId": "r".repeat(MAX_ROOM_ID_CHARS + 1) })
            .to_string();
        assert!(ClientEnvelope::parse(&long).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = " ".repeat(MAX_FRAME_BYTES + 1);
        let err = ClientEnvelope::parse(&frame).unwrap_err();
        assert!(err.error.client_message().contains("exceeds"));
    }

    #[test]
    fn test_response_wire_shape() {
        let message = ServerMessage::Response {
            id: 3,
            data: SignalingResponse::Produced {
                producer_id: ProducerId::from("p-1"),
            },
        };

        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "response", "id": 3, "data": { "kind": "produced", "producerId": "p-1" } })
        );
    }

    #[test]
    fn test_consumed_wire_shape() {
        let consumed = SignalingResponse::Consumed {
            consumer_id: ConsumerId::from("c-1"),
            producer_id: ProducerId::from("p-1"),
            kind: MediaKind::Video,
            rtp_parameters: json!({ "codecs": [] }),
            consumer_type: "simulcast".to_string(),
            producer_paused: false,
        };
        let message = ServerMessage::Response {
            id: 12,
            data: consumed.clone(),
        };

        let text = message.to_json().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["data"]["kind"], "consumed");
        assert_eq!(value["data"]["mediaKind"], "video");
        assert_eq!(value["data"]["consumerType"], "simulcast");

        let decoded: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, ServerMessage::Response { id: 12, data: consumed });
    }

    #[test]
    fn test_error_wire_shape() {
        let message = ServerMessage::error(
            Some(11),
            &SfuError::ProtocolViolation("transport is not connected".to_string()),
        );

        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["id"], 11);
        assert_eq!(value["error"]["code"], 5);
        assert_eq!(value["error"]["category"], "protocol_violation");
        assert_eq!(value["error"]["retryable"], false);
    }

    #[test]
    fn test_notification_wire_shape() {
        let message = ServerMessage::Notification {
            notification: Notification::ProducerAvailable {
                room_id: RoomId::from("R1"),
                producer_id: ProducerId::from("p-1"),
                peer_id: PeerId::from("a"),
                kind: MediaKind::Audio,
            },
        };

        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "notification",
                "notification": {
                    "event": "producerAvailable",
                    "roomId": "R1",
                    "producerId": "p-1",
                    "peerId": "a",
                    "kind": "audio"
                }
            })
        );
    }
}
