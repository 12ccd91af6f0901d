//! End-to-end tests for the WebSocket gateway.
//!
//! Connects real WebSocket clients to a node's `/ws` listener: wire
//! envelopes, upgrade-time admission, and cleanup when a socket drops.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sfu_test_utils::{TestCluster, TEST_ORG};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn send(socket: &mut Socket, id: u64, event: &str, data: Value) {
    let frame = json!({"id": id, "event": event, "data": data}).to_string();
    socket.send(Message::Text(frame)).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame within timeout")
            .expect("socket open")
            .expect("frame reads");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(frame) => panic!("socket closed: {frame:?}"),
            _ => {}
        }
    }
}

/// Wait for the frame answering `id`.
async fn response(socket: &mut Socket, id: u64) -> Value {
    loop {
        let frame = next_json(socket).await;
        if frame["id"] == json!(id) {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_heartbeat_round_trip_over_websocket() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("node-a").await;

    let (mut socket, _) = connect_async(node.ws_url()).await.unwrap();
    send(&mut socket, 1, "heartbeat", json!({})).await;

    let frame = response(&mut socket, 1).await;
    assert_eq!(frame["event"], "heartbeat-ack");
    assert!(frame["data"]["serverTime"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_join_over_websocket_and_disconnect_leaves_room() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("node-a").await;

    let mut host = node.connect();
    host.authenticate(&cluster.token("alice", "rooms:host")).await;
    host.join("r1", "host").await;

    let (mut socket, _) = connect_async(node.ws_url()).await.unwrap();
    send(
        &mut socket,
        1,
        "authenticate",
        json!({"token": cluster.token("bob", "rooms:join"), "organizationId": TEST_ORG}),
    )
    .await;
    assert_eq!(response(&mut socket, 1).await["event"], "authenticated");

    send(
        &mut socket,
        2,
        "join-room",
        json!({"roomId": "r1", "role": "viewer", "displayName": "Bob"}),
    )
    .await;
    let joined = response(&mut socket, 2).await;
    assert_eq!(joined["event"], "room-joined");
    assert_eq!(joined["data"]["nodeRef"]["nodeId"], "node-a");
    let participant_id = joined["data"]["participantId"].as_str().unwrap().to_string();

    host.expect_push("participant-joined").await;

    socket.close(None).await.unwrap();
    drop(socket);

    let left = host.expect_push("participant-left").await;
    assert_eq!(
        left,
        signaling_protocol::ServerEvent::ParticipantLeft { participant_id }
    );
}

#[tokio::test]
async fn test_binary_frame_is_answered_as_malformed() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("node-a").await;

    let (mut socket, _) = connect_async(node.ws_url()).await.unwrap();
    socket.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

    let frame = next_json(&mut socket).await;
    assert_eq!(frame["event"], "error");
    assert_eq!(frame["data"]["code"], "BAD_REQUEST");

    // The socket stays usable.
    send(&mut socket, 9, "heartbeat", json!({})).await;
    assert_eq!(response(&mut socket, 9).await["event"], "heartbeat-ack");
}

#[tokio::test]
async fn test_connection_rate_limit_rejects_upgrade() {
    let cluster = TestCluster::new();
    let node = cluster
        .spawn_node_with(
            "node-a",
            &[("CONNECTION_RATE_LIMIT", "2"), ("CONNECTION_BLOCK_SECONDS", "120")],
        )
        .await;

    let (_first, _) = connect_async(node.ws_url()).await.unwrap();
    let (_second, _) = connect_async(node.ws_url()).await.unwrap();

    match connect_async(node.ws_url()).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 429);
            let retry_after: u64 = response
                .headers()
                .get("retry-after")
                .expect("Retry-After header")
                .to_str()
                .unwrap()
                .parse()
                .unwrap();
            assert!((1..=120).contains(&retry_after));
        }
        Err(e) => panic!("expected HTTP 429, got {e}"),
        Ok(_) => panic!("third connection should be rejected"),
    }
}

#[tokio::test]
async fn test_draining_node_refuses_new_connections() {
    let cluster = TestCluster::new();
    let node = cluster.spawn_node("node-a").await;
    node.health().set_draining();

    match connect_async(node.ws_url()).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
        Err(e) => panic!("expected HTTP 503, got {e}"),
        Ok(_) => panic!("draining node accepted a connection"),
    }
}

#[tokio::test]
async fn test_node_shutdown_deregisters_and_releases_rooms() {
    let cluster = TestCluster::new();
    let mut node = cluster.spawn_node("node-a").await;

    let mut host = node.connect();
    host.authenticate(&cluster.token("alice", "rooms:host")).await;
    host.join("r1", "host").await;

    node.shutdown().await;

    let reason = host.expect_closed().await;
    assert!(!reason.is_empty());
    let coordinator = cluster.coordinator();
    assert!(coordinator.node("node-a").await.unwrap().is_none());
    assert!(coordinator.placement("r1").await.unwrap().is_none());
}
