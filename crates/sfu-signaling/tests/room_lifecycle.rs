//! Room lifecycle tests: creation races, cascading cleanup, reclaim and
//! admission.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use common::types::{MediaKind, ProducerId, RoomId, TransportDirection};
use sfu_signaling::errors::ErrorCategory;
use sfu_signaling::signaling::protocol::Notification;
use sfu_signaling::signaling::{ClientRequest, SignalingResponse};
use sfu_test_utils::{MockRoomStore, TestClient, TestSfu};

const QUIET: Duration = Duration::from_millis(200);

fn count_removed(notifications: &[Notification], producer: &ProducerId) -> usize {
    notifications
        .iter()
        .filter(|n| {
            matches!(n, Notification::ProducerRemoved { producer_id, .. } if producer_id == producer)
        })
        .count()
}

// ============================================================================
// Concurrent creation
// ============================================================================

#[tokio::test]
async fn test_concurrent_joins_share_one_room_and_router() {
    let sfu = TestSfu::builder()
        .router_delay(Duration::from_millis(50))
        .spawn()
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let url = sfu.ws_url();
        tasks.push(tokio::spawn(async move {
            let mut client = TestClient::connect(&url).await.unwrap();
            client.join("busy-room").await.unwrap();
            client
        }));
    }
    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }

    let status = sfu.status().await.unwrap();
    assert_eq!(status.room_count, 1);
    assert_eq!(status.peer_count, 8);
    assert_eq!(status.router_count, 1);
    assert_eq!(sfu.engine().stats().routers_created, 1);

    let state = sfu
        .registry()
        .get_room(RoomId::from("busy-room"))
        .await
        .unwrap()
        .get_state()
        .await
        .unwrap();
    assert_eq!(state.peers.len(), 8);
    assert!(state.router_id.is_some());
}

#[tokio::test]
async fn test_rooms_spread_across_workers() {
    let sfu = TestSfu::builder().workers(2).spawn().await.unwrap();

    let mut a = TestClient::connect(&sfu.ws_url()).await.unwrap();
    a.join("room-a").await.unwrap();
    let mut b = TestClient::connect(&sfu.ws_url()).await.unwrap();
    b.join("room-b").await.unwrap();

    assert_eq!(sfu.pool().loads(), vec![1, 1]);
}

// ============================================================================
// Cascading cleanup
// ============================================================================

#[tokio::test]
async fn test_producer_removed_delivered_exactly_once_on_disconnect() {
    let sfu = TestSfu::spawn().await.unwrap();

    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    let alice_id = alice.join("R1").await.unwrap().peer_id;
    let send = alice
        .connected_transport(TransportDirection::Sender)
        .await
        .unwrap();
    let audio = alice.produce(&send, MediaKind::Audio).await.unwrap();
    let video = alice.produce(&send, MediaKind::Video).await.unwrap();

    // Bob consumes both, Carol consumes nothing
    let mut bob = TestClient::connect(&sfu.ws_url()).await.unwrap();
    bob.join("R1").await.unwrap();
    bob.connected_transport(TransportDirection::Receiver)
        .await
        .unwrap();
    bob.consume(&audio).await.unwrap();
    bob.consume(&video).await.unwrap();
    let mut carol = TestClient::connect(&sfu.ws_url()).await.unwrap();
    carol.join("R1").await.unwrap();

    bob.drain_notifications(QUIET).await.unwrap();
    carol.drain_notifications(QUIET).await.unwrap();
    assert_eq!(sfu.engine().stats().live_consumers, 2);

    alice.close().await.unwrap();
    sfu.wait_for("alice's media to close", || {
        let stats = sfu.engine().stats();
        async move { stats.live_producers == 0 && stats.live_consumers == 0 }
    })
    .await
    .unwrap();

    for client in [&mut bob, &mut carol] {
        let seen = client.drain_notifications(QUIET).await.unwrap();
        assert_eq!(count_removed(&seen, &audio), 1, "{seen:?}");
        assert_eq!(count_removed(&seen, &video), 1, "{seen:?}");
        let left = seen
            .iter()
            .filter(|n| {
                matches!(n, Notification::PeerLeft { peer_id, .. } if *peer_id == alice_id)
            })
            .count();
        assert_eq!(left, 1);
    }

    // Bob's receiver transport survives; only his consumers went away
    let stats = sfu.engine().stats();
    assert_eq!(stats.live_transports, 1);
}

#[tokio::test]
async fn test_close_producer_removes_consumers_and_notifies_once() {
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
    bob.connected_transport(TransportDirection::Receiver)
        .await
        .unwrap();
    let consumer_id = bob.consume(&producer_id).await.unwrap();
    bob.drain_notifications(QUIET).await.unwrap();
    alice.drain_notifications(QUIET).await.unwrap();

    let closed = alice
        .expect_ok(ClientRequest::CloseProducer {
            producer_id: producer_id.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(closed, SignalingResponse::ProducerClosed { .. }));

    let seen = bob.drain_notifications(QUIET).await.unwrap();
    assert_eq!(
        seen,
        vec![Notification::ProducerRemoved {
            room_id: RoomId::from("R1"),
            producer_id: producer_id.clone(),
        }]
    );
    assert!(!sfu.engine().is_consumer_alive(&consumer_id));
    alice.expect_silence(QUIET).await.unwrap();

    let error = bob
        .expect_err(ClientRequest::Resume { consumer_id })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::NotFound);
}

#[tokio::test]
async fn test_close_sender_transport_cascades_to_producers() {
    let sfu = TestSfu::spawn().await.unwrap();

    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    alice.join("R1").await.unwrap();
    let send = alice
        .connected_transport(TransportDirection::Sender)
        .await
        .unwrap();
    let producer_id = alice.produce(&send, MediaKind::Video).await.unwrap();

    let mut bob = TestClient::connect(&sfu.ws_url()).await.unwrap();
    bob.join("R1").await.unwrap();
    bob.drain_notifications(QUIET).await.unwrap();

    alice
        .expect_ok(ClientRequest::CloseTransport {
            transport_id: send.clone(),
        })
        .await
        .unwrap();

    assert!(!sfu.engine().is_transport_alive(&send));
    assert!(!sfu.engine().is_producer_alive(&producer_id));
    let seen = bob.drain_notifications(QUIET).await.unwrap();
    assert_eq!(count_removed(&seen, &producer_id), 1);

    // A fresh sender transport may be created afterwards
    alice
        .connected_transport(TransportDirection::Sender)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_disconnect_releases_all_media() {
    let sfu = TestSfu::builder().reclaim("lazy").spawn().await.unwrap();

    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    alice.join("R1").await.unwrap();
    let send = alice
        .connected_transport(TransportDirection::Sender)
        .await
        .unwrap();
    alice
        .connected_transport(TransportDirection::Receiver)
        .await
        .unwrap();
    let producer_id = alice.produce(&send, MediaKind::Audio).await.unwrap();
    alice.consume(&producer_id).await.unwrap();

    let stats = sfu.engine().stats();
    assert_eq!(stats.live_transports, 2);
    assert_eq!(stats.live_producers, 1);
    assert_eq!(stats.live_consumers, 1);

    drop(alice);
    sfu.wait_for_media_released().await.unwrap();
    let metrics = Arc::clone(sfu.metrics());
    sfu.wait_for("connection to close", move || {
        let open = metrics.connection_count();
        async move { open == 0 }
    })
    .await
    .unwrap();

    let status = sfu.status().await.unwrap();
    assert_eq!(status.peer_count, 0);
    // Lazy reclaim keeps the empty room and its router
    assert_eq!(status.room_count, 1);
    assert_eq!(sfu.engine().stats().live_routers, 1);
}

#[tokio::test]
async fn test_disconnect_during_produce_releases_new_producer() {
    let sfu = TestSfu::builder().reclaim("lazy").spawn().await.unwrap();

    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    alice.join("R1").await.unwrap();
    let send = alice
        .connected_transport(TransportDirection::Sender)
        .await
        .unwrap();

    sfu.engine().set_media_delay(Duration::from_millis(100));
    let produce = serde_json::json!({
        "id": 99,
        "type": "produce",
        "transportId": send,
        "kind": "audio",
        "rtpParameters": {
            "codecs": [{ "mimeType": "audio/opus", "payloadType": 100, "clockRate": 48000 }],
            "encodings": [{ "ssrc": 1111 }]
        }
    });
    alice.send_raw(&produce.to_string()).await.unwrap();
    alice.close().await.unwrap();

    sfu.wait_for_media_released().await.unwrap();
    let stats = sfu.engine().stats();
    assert_eq!(stats.live_transports, 0);
    assert_eq!(stats.live_producers, 0);
    assert_eq!(sfu.status().await.unwrap().peer_count, 0);
}

#[tokio::test]
async fn test_disconnect_during_create_transport_releases_transport() {
    let sfu = TestSfu::builder().reclaim("lazy").spawn().await.unwrap();

    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    alice.join("R1").await.unwrap();

    sfu.engine().set_media_delay(Duration::from_millis(100));
    alice
        .send_raw(r#"{"id":7,"type":"createTransport","direction":"receiver"}"#)
        .await
        .unwrap();
    alice.close().await.unwrap();

    // The transport only exists once the delayed request completes, so wait
    // for the connection to finish tearing down before counting
    let metrics = Arc::clone(sfu.metrics());
    sfu.wait_for("connection to close", move || {
        let open = metrics.connection_count();
        async move { open == 0 }
    })
    .await
    .unwrap();
    assert_eq!(sfu.engine().stats().live_transports, 0);
    assert_eq!(sfu.status().await.unwrap().peer_count, 0);
}

// ============================================================================
// Reclaim
// ============================================================================

#[tokio::test]
async fn test_eager_reclaim_closes_router_after_last_leave() {
    let sfu = TestSfu::builder().reclaim("eager").spawn().await.unwrap();

    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    alice.join("R1").await.unwrap();
    let mut bob = TestClient::connect(&sfu.ws_url()).await.unwrap();
    bob.join("R1").await.unwrap();

    alice.leave().await.unwrap();
    assert!(sfu.has_room("R1").await);

    bob.leave().await.unwrap();
    let registry = sfu.registry().clone();
    sfu.wait_for("room to be reclaimed", move || {
        let registry = registry.clone();
        async move { registry.get_room(RoomId::from("R1")).await.is_err() }
    })
    .await
    .unwrap();

    assert_eq!(sfu.engine().stats().live_routers, 0);
    assert_eq!(sfu.pool().loads().iter().sum::<usize>(), 0);

    // The identifier is reusable
    let rejoined = alice.join("R1").await.unwrap();
    assert!(rejoined.peers.is_empty());
    assert_eq!(sfu.engine().stats().routers_created, 2);
}

#[tokio::test]
async fn test_lazy_reclaim_keeps_room_until_removed() {
    let sfu = TestSfu::builder().reclaim("lazy").spawn().await.unwrap();

    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    alice.join("R1").await.unwrap();
    alice.leave().await.unwrap();

    tokio::time::sleep(QUIET).await;
    assert!(sfu.has_room("R1").await);
    assert_eq!(sfu.engine().stats().live_routers, 1);

    sfu.registry()
        .remove_room(RoomId::from("R1"))
        .await
        .unwrap();
    assert!(!sfu.has_room("R1").await);
    assert_eq!(sfu.engine().stats().live_routers, 0);
}

#[tokio::test]
async fn test_remove_occupied_room_refused() {
    let sfu = TestSfu::builder().reclaim("lazy").spawn().await.unwrap();

    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    alice.join("R1").await.unwrap();

    let result = sfu.registry().remove_room(RoomId::from("R1")).await;
    assert!(result.is_err());
    assert!(sfu.has_room("R1").await);
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_registered_admission_uses_room_store() {
    let store = MockRoomStore::new()
        .with_room("standup")
        .with_deleted_room("retro");
    let sfu = TestSfu::builder()
        .admission("registered")
        .store(store.shared())
        .spawn()
        .await
        .unwrap();

    let mut client = TestClient::connect(&sfu.ws_url()).await.unwrap();
    for unknown in ["retro", "nowhere"] {
        let error = client
            .expect_err(ClientRequest::Join {
                room_id: RoomId::from(unknown),
            })
            .await
            .unwrap();
        assert_eq!(error.category, ErrorCategory::NotFound);
    }

    client.join("standup").await.unwrap();
    assert!(store.lookups() >= 3);
}

#[tokio::test]
async fn test_store_outage_reported_as_internal_error() {
    let store = MockRoomStore::new().with_room("standup").unavailable();
    let sfu = TestSfu::builder()
        .admission("registered")
        .store(store.shared())
        .spawn()
        .await
        .unwrap();

    let mut client = TestClient::connect(&sfu.ws_url()).await.unwrap();
    let error = client
        .expect_err(ClientRequest::Join {
            room_id: RoomId::from("standup"),
        })
        .await
        .unwrap();
    assert_eq!(error.category, ErrorCategory::Internal);
    assert_eq!(error.message, "An internal error occurred");

    store.set_unavailable(false);
    client.join("standup").await.unwrap();
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_tears_down_rooms() {
    let sfu = TestSfu::spawn().await.unwrap();
    let engine = sfu.engine().clone();

    let mut alice = TestClient::connect(&sfu.ws_url()).await.unwrap();
    alice.join("R1").await.unwrap();
    let send = alice
        .connected_transport(TransportDirection::Sender)
        .await
        .unwrap();
    alice.produce(&send, MediaKind::Audio).await.unwrap();

    sfu.shutdown(Duration::from_secs(5)).await.unwrap();

    let stats = engine.stats();
    assert_eq!(stats.live_producers, 0);
    assert_eq!(stats.live_transports, 0);
    assert_eq!(stats.live_routers, 0);
}
