//! WebSocket signaling client for end-to-end tests.
//!
//! `TestClient` speaks the JSON protocol: it numbers requests, waits for the
//! matching `response` or `error` frame and buffers any notifications that
//! arrive in between so tests can assert on them afterwards.

use crate::fixtures::{client_rtp_capabilities, dtls_parameters, rtp_parameters};

use common::types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use sfu_signaling::signaling::protocol::{Notification, ServerMessage};
use sfu_signaling::signaling::{ClientRequest, ErrorBody, SignalingResponse};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long a client waits for any single frame.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outcome of one request as seen on the wire.
pub type RequestOutcome = Result<SignalingResponse, ErrorBody>;

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinedRoom {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    pub peers: Vec<PeerId>,
}

pub struct TestClient {
    ws: WsStream,
    next_id: u64,
    notifications: VecDeque<Notification>,
    peer_id: Option<PeerId>,
}

impl TestClient {
    /// Open a signaling connection.
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (ws, _) = tokio::time::timeout(FRAME_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| anyhow::anyhow!("Timed out connecting to {}", url))?
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", url, e))?;
        Ok(Self {
            ws,
            next_id: 1,
            notifications: VecDeque::new(),
            peer_id: None,
        })
    }

    /// Peer id assigned by the server, known after a successful join.
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send frame: {}", e))
    }

    /// Send a binary frame.
    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), anyhow::Error> {
        self.ws
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send frame: {}", e))
    }

    /// Read the next server frame, whatever it is.
    pub async fn next_frame(&mut self) -> Result<ServerMessage, anyhow::Error> {
        loop {
            let frame = tokio::time::timeout(FRAME_TIMEOUT, self.ws.next())
                .await
                .map_err(|_| anyhow::anyhow!("Timed out waiting for a frame"))?
                .ok_or_else(|| anyhow::anyhow!("Connection closed"))?
                .map_err(|e| anyhow::anyhow!("Failed to read frame: {}", e))?;
            match frame {
                Message::Text(text) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| anyhow::anyhow!("Unparsable server frame {}: {}", text, e));
                }
                Message::Close(_) => anyhow::bail!("Connection closed"),
                _ => continue,
            }
        }
    }

    /// Send a request and wait for its response or error.
    pub async fn request(
        &mut self,
        request: ClientRequest,
    ) -> Result<RequestOutcome, anyhow::Error> {
        let id = self.next_id;
        self.next_id += 1;

        let mut frame = serde_json::to_value(&request)?;
        if let Value::Object(fields) = &mut frame {
            fields.insert("id".to_string(), Value::from(id));
        }
        self.send_raw(&frame.to_string()).await?;
        self.await_reply(id).await
    }

    /// Wait for the reply to request `id`, buffering notifications.
    pub async fn await_reply(&mut self, id: u64) -> Result<RequestOutcome, anyhow::Error> {
        loop {
            match self.next_frame().await? {
                ServerMessage::Response { id: got, data } if got == id => return Ok(Ok(data)),
                ServerMessage::Error { id: Some(got), error } if got == id => {
                    return Ok(Err(error))
                }
                ServerMessage::Notification { notification } => {
                    self.notifications.push_back(notification);
                }
                other => anyhow::bail!("Unexpected frame while waiting for {}: {:?}", id, other),
            }
        }
    }

    /// Send a request that must succeed.
    pub async fn expect_ok(
        &mut self,
        request: ClientRequest,
    ) -> Result<SignalingResponse, anyhow::Error> {
        let kind = request.request_type();
        self.request(request)
            .await?
            .map_err(|e| anyhow::anyhow!("{} failed: {:?}", kind, e))
    }

    /// Send a request that must fail.
    pub async fn expect_err(&mut self, request: ClientRequest) -> Result<ErrorBody, anyhow::Error> {
        match self.request(request).await? {
            Ok(data) => anyhow::bail!("Expected an error, got {:?}", data),
            Err(error) => Ok(error),
        }
    }

    pub async fn join(&mut self, room_id: &str) -> Result<JoinedRoom, anyhow::Error> {
        let response = self
            .expect_ok(ClientRequest::Join {
                room_id: RoomId::from(room_id),
            })
            .await?;
        let SignalingResponse::Joined {
            room_id,
            peer_id,
            peers,
        } = response
        else {
            anyhow::bail!("Unexpected join response: {:?}", response);
        };
        self.peer_id = Some(peer_id.clone());
        Ok(JoinedRoom {
            room_id,
            peer_id,
            peers,
        })
    }

    pub async fn leave(&mut self) -> Result<(), anyhow::Error> {
        self.expect_ok(ClientRequest::Leave).await?;
        self.peer_id = None;
        Ok(())
    }

    /// Create a transport without connecting it.
    pub async fn create_transport(
        &mut self,
        direction: TransportDirection,
    ) -> Result<TransportId, anyhow::Error> {
        match self
            .expect_ok(ClientRequest::CreateTransport { direction })
            .await?
        {
            SignalingResponse::TransportCreated { transport, .. } => Ok(transport.id),
            other => anyhow::bail!("Unexpected createTransport response: {:?}", other),
        }
    }

    /// Create and connect a transport.
    pub async fn connected_transport(
        &mut self,
        direction: TransportDirection,
    ) -> Result<TransportId, anyhow::Error> {
        let transport_id = self.create_transport(direction).await?;
        self.expect_ok(ClientRequest::ConnectTransport {
            transport_id: transport_id.clone(),
            dtls_parameters: dtls_parameters(),
        })
        .await?;
        Ok(transport_id)
    }

    pub async fn produce(
        &mut self,
        transport_id: &TransportId,
        kind: MediaKind,
    ) -> Result<ProducerId, anyhow::Error> {
        match self
            .expect_ok(ClientRequest::Produce {
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters: rtp_parameters(kind),
            })
            .await?
        {
            SignalingResponse::Produced { producer_id } => Ok(producer_id),
            other => anyhow::bail!("Unexpected produce response: {:?}", other),
        }
    }

    /// Consume with capabilities covering every loopback codec.
    pub async fn consume(&mut self, producer_id: &ProducerId) -> Result<ConsumerId, anyhow::Error> {
        match self
            .expect_ok(ClientRequest::Consume {
                producer_id: producer_id.clone(),
                rtp_capabilities: client_rtp_capabilities(),
            })
            .await?
        {
            SignalingResponse::Consumed { consumer_id, .. } => Ok(consumer_id),
            other => anyhow::bail!("Unexpected consume response: {:?}", other),
        }
    }

    /// Next notification, buffered or read from the socket.
    pub async fn next_notification(&mut self) -> Result<Notification, anyhow::Error> {
        if let Some(notification) = self.notifications.pop_front() {
            return Ok(notification);
        }
        match self.next_frame().await? {
            ServerMessage::Notification { notification } => Ok(notification),
            other => anyhow::bail!("Expected a notification, got {:?}", other),
        }
    }

    /// Take every notification buffered so far without touching the socket.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    /// Collect notifications until the socket stays quiet for `quiet`.
    pub async fn drain_notifications(
        &mut self,
        quiet: Duration,
    ) -> Result<Vec<Notification>, anyhow::Error> {
        let mut out = self.take_notifications();
        loop {
            match tokio::time::timeout(quiet, self.ws.next()).await {
                Err(_) | Ok(None) => return Ok(out),
                Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text)? {
                    ServerMessage::Notification { notification } => out.push(notification),
                    other => anyhow::bail!("Expected a notification, got {:?}", other),
                },
                Ok(Some(Ok(Message::Close(_)))) => return Ok(out),
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => anyhow::bail!("Failed to read frame: {}", e),
            }
        }
    }

    /// Assert nothing arrives within `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) -> Result<(), anyhow::Error> {
        let pending = self.drain_notifications(quiet).await?;
        if !pending.is_empty() {
            anyhow::bail!("Expected no notifications, got {:?}", pending);
        }
        Ok(())
    }

    /// True once the server has closed the connection.
    pub async fn is_closed_by_server(&mut self, within: Duration) -> bool {
        loop {
            match tokio::time::timeout(within, self.ws.next()).await {
                Err(_) => return false,
                Ok(None | Some(Err(_)) | Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Close the socket from the client side.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.ws
            .close(None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to close: {}", e))
    }
}
