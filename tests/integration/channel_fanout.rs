// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Integration tests for channel fan-out over real WebSocket connections.
//!
//! These tests validate:
//! - `extension_request` reaches every other member of the channel verbatim
//!   and is never echoed to the sender
//! - A disconnected member stops receiving and leaves the channel
//! - A channel disappears once its last member leaves, and messages
//!   addressed to it afterwards are harmless no-ops
//! - Channels are isolated from each other
//!
//! Joins are not acknowledged, so tests poll the server's registry until the
//! expected membership is visible before sending.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use phonly_relay::registry::ChannelRegistry;
use phonly_relay::relay::{self, RelayState};
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const EXTENSION_REQUEST: &str = r#"{"type":"extension_request","channel":"room1","foo":1}"#;

async fn start_relay() -> (std::net::SocketAddr, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay");
    (addr, state)
}

async fn connect(addr: std::net::SocketAddr) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws
}

async fn send_text(ws: &mut WsStream, text: &str) {
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn join(ws: &mut WsStream, channel: &str, user_id: &str) {
    let frame = serde_json::json!({
        "type": "join_channel",
        "channel": channel,
        "userId": user_id,
    });
    send_text(ws, &frame.to_string()).await;
}

async fn wait_until(state: &RelayState, check: impl Fn(&ChannelRegistry) -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check(&state.registry) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry never reached expected state");
}

async fn wait_for_members(state: &RelayState, channel: &str, count: usize) {
    wait_until(state, |r| r.members(channel).map_or(0, |m| m.len()) == count).await;
}

async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for forwarded message")
        .unwrap()
        .unwrap();
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

async fn assert_silent(ws: &mut WsStream) {
    let next = tokio::time::timeout(Duration::from_millis(150), ws.next()).await;
    assert!(next.is_err(), "expected no frame, got {next:?}");
}

async fn room_of_three(state: &RelayState, addr: std::net::SocketAddr) -> [WsStream; 3] {
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut c = connect(addr).await;
    join(&mut a, "room1", "u1").await;
    join(&mut b, "room1", "u2").await;
    join(&mut c, "room1", "u3").await;
    wait_for_members(state, "room1", 3).await;
    [a, b, c]
}

#[tokio::test]
async fn request_reaches_others_but_not_sender() {
    let (addr, state) = start_relay().await;
    let [mut a, mut b, mut c] = room_of_three(&state, addr).await;

    send_text(&mut a, EXTENSION_REQUEST).await;

    let expected: serde_json::Value = serde_json::from_str(EXTENSION_REQUEST).unwrap();
    assert_eq!(recv_json(&mut b).await, expected);
    assert_eq!(recv_json(&mut c).await, expected);
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn disconnected_member_no_longer_receives() {
    let (addr, state) = start_relay().await;
    let [mut a, mut b, mut c] = room_of_three(&state, addr).await;

    send_text(&mut a, EXTENSION_REQUEST).await;
    let _ = recv_json(&mut b).await;
    let _ = recv_json(&mut c).await;

    b.close(None).await.unwrap();
    drop(b);
    wait_for_members(&state, "room1", 2).await;

    send_text(&mut c, EXTENSION_REQUEST).await;

    let expected: serde_json::Value = serde_json::from_str(EXTENSION_REQUEST).unwrap();
    assert_eq!(recv_json(&mut a).await, expected);
    assert_silent(&mut c).await;
    assert_eq!(state.registry.members("room1").unwrap().len(), 2);
}

#[tokio::test]
async fn channel_vanishes_after_last_member_leaves() {
    let (addr, state) = start_relay().await;
    let mut a = connect(addr).await;
    let mut outsider = connect(addr).await;
    join(&mut a, "room1", "u1").await;
    wait_for_members(&state, "room1", 1).await;

    a.close(None).await.unwrap();
    drop(a);
    wait_until(&state, |r| r.members("room1").is_none()).await;
    assert!(!state.registry.channel_names().contains(&"room1".to_string()));

    // Addressing the vanished channel is a no-op, and the relay keeps serving.
    send_text(&mut outsider, EXTENSION_REQUEST).await;
    assert_silent(&mut outsider).await;

    join(&mut outsider, "room1", "u9").await;
    wait_for_members(&state, "room1", 1).await;
}

#[tokio::test]
async fn channels_are_isolated() {
    let (addr, state) = start_relay().await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut other = connect(addr).await;
    join(&mut a, "room1", "u1").await;
    join(&mut b, "room1", "u2").await;
    join(&mut other, "room2", "u3").await;
    wait_for_members(&state, "room1", 2).await;
    wait_for_members(&state, "room2", 1).await;

    send_text(&mut a, r#"{"type":"extension_response","channel":"room1","ok":true}"#).await;

    assert_eq!(recv_json(&mut b).await["ok"], serde_json::Value::Bool(true));
    assert_silent(&mut other).await;
}

#[tokio::test]
async fn rejoining_elsewhere_moves_the_peer() {
    let (addr, state) = start_relay().await;
    let [mut a, mut b, _c] = room_of_three(&state, addr).await;

    join(&mut a, "room2", "u1").await;
    wait_for_members(&state, "room1", 2).await;
    wait_for_members(&state, "room2", 1).await;

    send_text(&mut b, EXTENSION_REQUEST).await;
    assert_silent(&mut a).await;
}
