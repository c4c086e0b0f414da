//! End-to-end signaling tests over a real WebSocket.
//!
//! Each test spawns the full stack on a loopback engine and drives it with
//! `TestClient`s, asserting on the frames peers actually receive.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use common::types::{MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId};
use serde_json::json;
use sfu_signaling::errors::ErrorCategory;
use sfu_signaling::signaling::protocol::{Notification, ServerMessage};
use sfu_signaling::signaling::{ClientRequest, SignalingResponse};
use sfu_test_utils::{
    client_rtp_capabilities, dtls_parameters, h264_only_rtp_capabilities, invalid_dtls_parameters,
    vp8_simulcast_rtp_parameters, TestClient, TestSfu,
};

const QUIET: Duration = Duration::from_millis(200);

/// A joined client with both transports connected.
struct ReadyClient {
    client: TestClient,
    peer_id: PeerId,
    send: TransportId,
}

async fn ready_client(sfu: &TestSfu, room: &str) -> ReadyClient {
    let mut client = TestClient::connect(&sfu.ws_url()).await.unwrap();
    let joined = client.join(room).await.unwrap();
    let send = client
        .connected_transport(TransportDirection::Sender)
        .await
        .unwrap();
    client
        .connected_transport(TransportDirection::Receiver)
        .await
        .unwrap();
    ReadyClient {
        client,
        peer_id: joined.peer_id,
        send,
    }
}

// ============================================================================
// Join and membership
// ============================================================================

#[tokio::test]
async fn test_join_reports_existing_members() {
    let sfu = TestSfu::spawn().await.unwrap();

    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    let first = alice.join("R1").await.unwrap();
    assert_eq!(first.room_id, RoomId::from("R1"));
    assert!(first.peers.is_empty());

    let mut bob = TestClient::connect(&sfu.ws_url()).await.unwrap();
    let second = bob.join("R1").await.unwrap();
    assert_eq!(second.peers, vec![first.peer_id.clone()]);
    assert_ne!(first.peer_id, second.peer_id);

    assert_eq!(
        alice.next_notification().await.unwrap(),
        Notification::PeerJoined {
            room_id: RoomId::from("R1"),
            peer_id: second.peer_id.clone(),
        }
    );
    bob.expect_silence(QUIET).await.unwrap();
}

#[tokio::test]
async fn test_requests_before_join_rejected() {
    let sfu = TestSfu::spawn().await.unwrap();
    let mut client = TestClient::connect(&sfu.ws_url()).await.unwrap();

    let error = client
        .expect_err(ClientRequest::CreateTransport {
            direction: TransportDirection::Sender,
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::ProtocolViolation);
    assert_eq!(error.code, 5);

    let error = client.expect_err(ClientRequest::Leave).await.unwrap();
    assert_eq!(error.category, ErrorCategory::ProtocolViolation);
}

#[tokio::test]
async fn test_second_join_on_same_connection_rejected() {
    let sfu = TestSfu::spawn().await.unwrap();
    let mut client = TestClient::connect(&sfu.ws_url()).await.unwrap();
    client.join("R1").await.unwrap();

    let error = client
        .expect_err(ClientRequest::Join {
            room_id: RoomId::from("R2"),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::ProtocolViolation);
    assert!(!sfu.has_room("R2").await);
}

#[tokio::test]
async fn test_leave_then_join_another_room() {
    let sfu = TestSfu::builder().reclaim("lazy").spawn().await.unwrap();
    let mut client = TestClient::connect(&sfu.ws_url()).await.unwrap();

    client.join("R1").await.unwrap();
    client.leave().await.unwrap();
    let joined = client.join("R2").await.unwrap();

    assert_eq!(joined.room_id, RoomId::from("R2"));
    let status = sfu.status().await.unwrap();
    assert_eq!(status.room_count, 2);
    assert_eq!(status.peer_count, 1);
}

// ============================================================================
// Media negotiation
// ============================================================================

#[tokio::test]
async fn test_full_produce_consume_flow() {
    let sfu = TestSfu::spawn().await.unwrap();
    let ReadyClient {
        client: mut alice,
        peer_id: alice_id,
        send: alice_send,
    } = ready_client(&sfu, "R1").await;
    let mut bob = ready_client(&sfu, "R1").await.client;
    alice.drain_notifications(QUIET).await.unwrap();

    let caps = alice
        .expect_ok(ClientRequest::GetRouterCapabilities)
        .await
        .unwrap();
    assert!(matches!(caps, SignalingResponse::RouterCapabilities { .. }));

    let error = alice
        .expect_err(ClientRequest::CreateTransport {
            direction: TransportDirection::Sender,
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::ProtocolViolation);

    let producer_id = alice.produce(&alice_send, MediaKind::Audio).await.unwrap();
    assert_eq!(
        bob.next_notification().await.unwrap(),
        Notification::ProducerAvailable {
            room_id: RoomId::from("R1"),
            producer_id: producer_id.clone(),
            peer_id: alice_id.clone(),
            kind: MediaKind::Audio,
        }
    );

    let consumed = bob
        .expect_ok(ClientRequest::Consume {
            producer_id: producer_id.clone(),
            rtp_capabilities: client_rtp_capabilities(),
        })
        .await
        .unwrap();
    let SignalingResponse::Consumed {
        consumer_id,
        kind,
        consumer_type,
        producer_paused,
        ..
    } = consumed
    else {
        panic!("unexpected response {consumed:?}");
    };
    assert_eq!(kind, MediaKind::Audio);
    assert_eq!(consumer_type, "simple");
    assert!(!producer_paused);

    bob.expect_ok(ClientRequest::Resume {
        consumer_id: consumer_id.clone(),
    })
    .await
    .unwrap();
    let again = bob
        .expect_err(ClientRequest::Resume { consumer_id })
        .await
        .unwrap();
    assert_eq!(again.category, ErrorCategory::ProtocolViolation);

    let stats = sfu.engine().stats();
    assert_eq!(stats.live_transports, 4);
    assert_eq!(stats.live_producers, 1);
    assert_eq!(stats.live_consumers, 1);
}

#[tokio::test]
async fn test_late_joiner_learns_existing_producers() {
    let sfu = TestSfu::spawn().await.unwrap();
    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    let alice_id = alice.join("R1").await.unwrap().peer_id;
    let send = alice
        .connected_transport(TransportDirection::Sender)
        .await
        .unwrap();
    let audio = alice.produce(&send, MediaKind::Audio).await.unwrap();
    let video = alice.produce(&send, MediaKind::Video).await.unwrap();

    let mut carol = TestClient::connect(&sfu.ws_url()).await.unwrap();
    carol.join("R1").await.unwrap();

    let mut announced: Vec<_> = carol
        .drain_notifications(QUIET)
        .await
        .unwrap()
        .into_iter()
        .map(|n| match n {
            Notification::ProducerAvailable {
                producer_id,
                peer_id,
                ..
            } => {
                assert_eq!(peer_id, alice_id);
                producer_id
            }
            other => panic!("unexpected notification {other:?}"),
        })
        .collect();
    announced.sort();
    let mut expected = vec![audio, video];
    expected.sort();
    assert_eq!(announced, expected);
}

#[tokio::test]
async fn test_produce_requires_connected_sender() {
    let sfu = TestSfu::spawn().await.unwrap();
    let mut client = TestClient::connect(&sfu.ws_url()).await.unwrap();
    client.join("R1").await.unwrap();

    let send = client
        .create_transport(TransportDirection::Sender)
        .await
        .unwrap();
    let error = client
        .expect_err(ClientRequest::Produce {
            transport_id: send.clone(),
            kind: MediaKind::Audio,
            rtp_parameters: sfu_test_utils::opus_rtp_parameters(),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::ProtocolViolation);

    let receiver = client
        .connected_transport(TransportDirection::Receiver)
        .await
        .unwrap();
    let error = client
        .expect_err(ClientRequest::Produce {
            transport_id: receiver,
            kind: MediaKind::Audio,
            rtp_parameters: sfu_test_utils::opus_rtp_parameters(),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::ProtocolViolation);
}

#[tokio::test]
async fn test_failed_connect_can_be_retried() {
    let sfu = TestSfu::spawn().await.unwrap();
    let mut client = TestClient::connect(&sfu.ws_url()).await.unwrap();
    client.join("R1").await.unwrap();
    let send = client
        .create_transport(TransportDirection::Sender)
        .await
        .unwrap();

    let error = client
        .expect_err(ClientRequest::ConnectTransport {
            transport_id: send.clone(),
            dtls_parameters: invalid_dtls_parameters(),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::TransientFailure);
    assert!(error.retryable);

    client
        .expect_ok(ClientRequest::ConnectTransport {
            transport_id: send.clone(),
            dtls_parameters: dtls_parameters(),
        })
        .await
        .unwrap();

    let error = client
        .expect_err(ClientRequest::ConnectTransport {
            transport_id: send,
            dtls_parameters: dtls_parameters(),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::ProtocolViolation);
}

#[tokio::test]
async fn test_consume_error_taxonomy() {
    let sfu = TestSfu::spawn().await.unwrap();
    let ReadyClient {
        client: mut alice,
        send,
        ..
    } = ready_client(&sfu, "R1").await;
    let mut bob = TestClient::connect(&sfu.ws_url()).await.unwrap();
    bob.join("R1").await.unwrap();
    alice.drain_notifications(QUIET).await.unwrap();

    let producer_id = alice.produce(&send, MediaKind::Video).await.unwrap();

    // No receiver transport yet
    let error = bob
        .expect_err(ClientRequest::Consume {
            producer_id: producer_id.clone(),
            rtp_capabilities: client_rtp_capabilities(),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::NotFound);
    assert_eq!(error.code, 4);

    bob.connected_transport(TransportDirection::Receiver)
        .await
        .unwrap();

    let error = bob
        .expect_err(ClientRequest::Consume {
            producer_id: ProducerId::from("missing"),
            rtp_capabilities: client_rtp_capabilities(),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::NotFound);

    let error = bob
        .expect_err(ClientRequest::Consume {
            producer_id: producer_id.clone(),
            rtp_capabilities: h264_only_rtp_capabilities(),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::IncompatibleCapabilities);
    assert_eq!(error.code, 8);

    bob.consume(&producer_id).await.unwrap();
    let error = bob
        .expect_err(ClientRequest::Consume {
            producer_id,
            rtp_capabilities: client_rtp_capabilities(),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::ProtocolViolation);
}

#[tokio::test]
async fn test_simulcast_consumer_type() {
    let sfu = TestSfu::spawn().await.unwrap();
    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    alice.join("R1").await.unwrap();
    let send = alice
        .connected_transport(TransportDirection::Sender)
        .await
        .unwrap();
    let produced = alice
        .expect_ok(ClientRequest::Produce {
            transport_id: send,
            kind: MediaKind::Video,
            rtp_parameters: vp8_simulcast_rtp_parameters(),
        })
        .await
        .unwrap();
    let SignalingResponse::Produced { producer_id } = produced else {
        panic!("unexpected response {produced:?}");
    };

    let mut bob = ready_client(&sfu, "R1").await.client;
    let consumed = bob
        .expect_ok(ClientRequest::Consume {
            producer_id,
            rtp_capabilities: client_rtp_capabilities(),
        })
        .await
        .unwrap();
    let SignalingResponse::Consumed { consumer_type, .. } = consumed else {
        panic!("unexpected response {consumed:?}");
    };
    assert_eq!(consumer_type, "simulcast");
}

#[tokio::test]
async fn test_pause_and_resume_producer_notify_others() {
    let sfu = TestSfu::spawn().await.unwrap();
    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    alice.join("R1").await.unwrap();
    let send = alice
        .connected_transport(TransportDirection::Sender)
        .await
        .unwrap();
    let producer_id = alice.produce(&send, MediaKind::Audio).await.unwrap();

    let mut bob = TestClient::connect(&sfu.ws_url()).await.unwrap();
    bob.join("R1").await.unwrap();
    bob.drain_notifications(QUIET).await.unwrap();
    alice.drain_notifications(QUIET).await.unwrap();

    alice
        .expect_ok(ClientRequest::PauseProducer {
            producer_id: producer_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(
        bob.next_notification().await.unwrap(),
        Notification::ProducerPaused {
            room_id: RoomId::from("R1"),
            producer_id: producer_id.clone(),
        }
    );

    let error = alice
        .expect_err(ClientRequest::PauseProducer {
            producer_id: producer_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::ProtocolViolation);

    alice
        .expect_ok(ClientRequest::ResumeProducer {
            producer_id: producer_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(
        bob.next_notification().await.unwrap(),
        Notification::ProducerResumed {
            room_id: RoomId::from("R1"),
            producer_id,
        }
    );
    alice.expect_silence(QUIET).await.unwrap();
}

#[tokio::test]
async fn test_chat_reaches_other_members_only() {
    let sfu = TestSfu::spawn().await.unwrap();
    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    let alice_id = alice.join("R1").await.unwrap().peer_id;
    let mut bob = TestClient::connect(&sfu.ws_url()).await.unwrap();
    bob.join("R1").await.unwrap();
    let mut outsider = TestClient::connect(&sfu.ws_url()).await.unwrap();
    outsider.join("R2").await.unwrap();
    alice.drain_notifications(QUIET).await.unwrap();

    alice
        .expect_ok(ClientRequest::Chat {
            text: "hello".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        bob.next_notification().await.unwrap(),
        Notification::ChatMessage {
            room_id: RoomId::from("R1"),
            peer_id: alice_id,
            text: "hello".to_string(),
        }
    );
    alice.expect_silence(QUIET).await.unwrap();
    outsider.expect_silence(QUIET).await.unwrap();
}

// ============================================================================
// Malformed frames
// ============================================================================

#[tokio::test]
async fn test_malformed_frames_get_errors_and_keep_connection() {
    let sfu = TestSfu::spawn().await.unwrap();
    let mut client = TestClient::connect(&sfu.ws_url()).await.unwrap();

    client.send_raw("not json").await.unwrap();
    let ServerMessage::Error { id, error } = client.next_frame().await.unwrap() else {
        panic!("expected an error frame");
    };
    assert_eq!(id, None);
    assert_eq!(error.category, ErrorCategory::InvalidMessage);
    assert_eq!(error.code, 1);

    client
        .send_raw(&json!({ "id": 9, "type": "teleport" }).to_string())
        .await
        .unwrap();
    let ServerMessage::Error { id, error } = client.next_frame().await.unwrap() else {
        panic!("expected an error frame");
    };
    assert_eq!(id, Some(9));
    assert_eq!(error.category, ErrorCategory::InvalidMessage);

    client
        .send_raw(&json!({ "id": 10, "type": "join", "roomId": "" }).to_string())
        .await
        .unwrap();
    let ServerMessage::Error { id, .. } = client.next_frame().await.unwrap() else {
        panic!("expected an error frame");
    };
    assert_eq!(id, Some(10));

    client.send_binary(vec![1, 2, 3]).await.unwrap();
    let ServerMessage::Error { error, .. } = client.next_frame().await.unwrap() else {
        panic!("expected an error frame");
    };
    assert_eq!(error.category, ErrorCategory::InvalidMessage);

    // Still usable
    client.join("R1").await.unwrap();
}
