use super::*;
use crate::hub::bridge::{Backbone, MemoryBackbone};
use crate::routes;
use crate::state::test_helpers::{test_app_state, test_app_state_with_backbone};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, routes::app(state)).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket handshake");
    stream
}

async fn send_json(client: &mut Client, value: &Value) {
    client.send(WsMessage::Text(value.to_string().into())).await.expect("send");
}

async fn recv_json(client: &mut Client) -> Value {
    let fut = async {
        loop {
            match client.next().await.expect("stream ended").expect("read error") {
                WsMessage::Text(text) => return serde_json::from_str::<Value>(text.as_str()).expect("json frame"),
                WsMessage::Close(_) => panic!("connection closed"),
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("websocket receive timed out")
}

/// Next frame of `kind`, skipping anything else.
async fn recv_kind(client: &mut Client, kind: &str) -> Value {
    loop {
        let value = recv_json(client).await;
        if value["type"] == kind {
            return value;
        }
    }
}

fn usernames(update: &Value) -> Vec<String> {
    update["data"]["participants"]
        .as_array()
        .expect("participants array")
        .iter()
        .map(|p| p["username"].as_str().unwrap_or_default().to_owned())
        .collect()
}

fn join(board_id: &str, username: &str) -> Value {
    json!({"type": "join_board", "board_id": board_id, "username": username, "avatar": "", "is_admin": false})
}

#[tokio::test]
async fn join_board_broadcasts_participants() {
    let (state, _) = test_app_state().await;
    let addr = spawn_server(state).await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    send_json(&mut alice, &join("B1", "alice")).await;
    let update = recv_kind(&mut bob, "participants_update").await;
    assert_eq!(update["data"]["board_id"], "B1");
    assert_eq!(usernames(&update), vec!["alice"]);

    // The control frame itself is relayed too.
    let relayed = recv_kind(&mut bob, "join_board").await;
    assert_eq!(relayed["username"], "alice");
}

#[tokio::test]
async fn nested_data_join_is_understood() {
    let (state, _) = test_app_state().await;
    let addr = spawn_server(state).await;
    let mut client = connect(addr).await;

    let frame = json!({"type": "join_board", "data": {"board_id": "B2", "username": "carol", "is_admin": true}});
    send_json(&mut client, &frame).await;

    let update = recv_kind(&mut client, "participants_update").await;
    assert_eq!(update["data"]["participants"][0]["username"], "carol");
    assert_eq!(update["data"]["participants"][0]["is_admin"], true);
}

#[tokio::test]
async fn disconnect_removes_participant() {
    let (state, _) = test_app_state().await;
    let addr = spawn_server(state.clone()).await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    send_json(&mut alice, &join("B1", "alice")).await;
    send_json(&mut bob, &join("B1", "bob")).await;
    loop {
        let update = recv_kind(&mut bob, "participants_update").await;
        if usernames(&update) == vec!["alice", "bob"] {
            break;
        }
    }

    alice.close(None).await.expect("close");

    let update = recv_kind(&mut bob, "participants_update").await;
    assert_eq!(usernames(&update), vec!["bob"]);
    assert_eq!(state.hub.participants("B1").len(), 1);
}

#[tokio::test]
async fn unknown_types_are_relayed_verbatim() {
    let (state, _) = test_app_state().await;
    let addr = spawn_server(state).await;
    let mut sender = connect(addr).await;
    let mut receiver = connect(addr).await;

    let frame = json!({"type": "timer_start", "data": {"seconds": 300, "started_by": "alice"}});
    send_json(&mut sender, &frame).await;

    assert_eq!(recv_kind(&mut receiver, "timer_start").await, frame);
    assert_eq!(recv_kind(&mut sender, "timer_start").await, frame);
}

#[tokio::test]
async fn malformed_frames_do_not_close_the_connection() {
    let (state, _) = test_app_state().await;
    let addr = spawn_server(state).await;
    let mut client = connect(addr).await;

    client.send(WsMessage::Text("not json".into())).await.unwrap();
    send_json(&mut client, &json!({"type": "join_board", "board_id": "B1"})).await;
    send_json(&mut client, &json!({"type": "card_moved"})).await;

    // The incomplete join is relayed but joins nobody.
    let relayed = recv_json(&mut client).await;
    assert_eq!(relayed["type"], "join_board");
    assert_eq!(recv_json(&mut client).await["type"], "card_moved");
}

#[tokio::test]
async fn phase_change_persists_and_refreshes() {
    let (state, store) = test_app_state().await;
    let board_id = store.seed_board(true, "voting");
    let addr = spawn_server(state).await;
    let mut client = connect(addr).await;

    let frame = json!({"type": "phase_change", "board_id": board_id.to_string(), "phase": "discussion"});
    send_json(&mut client, &frame).await;

    let refresh = recv_kind(&mut client, "board_update").await;
    assert_eq!(refresh["data"]["action"], "refresh_board");
    assert_eq!(store.phase_of(board_id).as_deref(), Some("discussion"));
}

#[tokio::test]
async fn phase_change_failure_still_relays() {
    let (state, store) = test_app_state().await;
    let addr = spawn_server(state).await;
    let mut client = connect(addr).await;
    store.fail_writes();

    let frame = json!({"type": "phase_change", "board_id": Uuid::new_v4().to_string(), "phase": "voting"});
    send_json(&mut client, &frame).await;

    assert_eq!(recv_json(&mut client).await, frame);
}

#[tokio::test]
async fn relay_crosses_instances_through_backbone() {
    let backbone: Arc<dyn Backbone> = Arc::new(MemoryBackbone::new(64));
    let (state_a, _) = test_app_state_with_backbone(Some(backbone.clone())).await;
    let (state_b, _) = test_app_state_with_backbone(Some(backbone)).await;
    let addr_a = spawn_server(state_a).await;
    let addr_b = spawn_server(state_b).await;

    let mut alice = connect(addr_a).await;
    let mut bob = connect(addr_b).await;
    send_json(&mut alice, &join("B1", "alice")).await;
    send_json(&mut bob, &join("B1", "bob")).await;
    recv_kind(&mut alice, "participants_update").await;
    recv_kind(&mut bob, "participants_update").await;

    let mut carol = connect(addr_b).await;
    let frame = json!({"type": "board_update", "data": {"board_id": "B1", "action": "refresh_board"}});
    send_json(&mut carol, &frame).await;

    assert_eq!(recv_kind(&mut alice, "board_update").await, frame);
    assert_eq!(recv_kind(&mut bob, "board_update").await, frame);
}

#[tokio::test]
async fn idle_peer_is_dropped_after_read_deadline() {
    let (mut state, _) = test_app_state().await;
    state.connection = ConnectionConfig {
        ping_interval: Duration::from_secs(60),
        pong_wait: Duration::from_millis(150),
        ..ConnectionConfig::default()
    };
    let addr = spawn_server(state.clone()).await;
    let mut idle = connect(addr).await;
    send_json(&mut idle, &join("B1", "idle")).await;
    recv_kind(&mut idle, "participants_update").await;

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match idle.next().await {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "idle connection was not closed");
    assert!(state.hub.participants("B1").is_empty());
}

#[tokio::test]
async fn responsive_peer_outlives_read_deadline() {
    let (mut state, _) = test_app_state().await;
    state.connection = ConnectionConfig {
        ping_interval: Duration::from_millis(100),
        pong_wait: Duration::from_millis(300),
        ..ConnectionConfig::default()
    };
    let addr = spawn_server(state.clone()).await;
    let mut client = connect(addr).await;
    send_json(&mut client, &join("B1", "alice")).await;
    recv_kind(&mut client, "participants_update").await;

    // Polling the stream answers each ping with a pong.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1200);
    let mut pings = 0;
    while let Ok(next) = tokio::time::timeout_at(deadline, client.next()).await {
        match next {
            Some(Ok(WsMessage::Ping(_))) => pings += 1,
            Some(Ok(WsMessage::Close(_)) | Err(_)) | None => panic!("responsive connection was closed"),
            Some(Ok(_)) => {}
        }
    }
    assert!(pings >= 3, "expected keepalive pings, saw {pings}");

    let frame = json!({"type": "card_moved", "data": {"card_id": "c1"}});
    send_json(&mut client, &frame).await;
    assert_eq!(recv_kind(&mut client, "card_moved").await, frame);
    assert_eq!(state.hub.participants("B1").len(), 1);
}

#[tokio::test]
async fn unregistered_connection_receives_close_frame() {
    let (mut state, _) = test_app_state().await;
    state.connection = ConnectionConfig {
        ping_interval: Duration::from_secs(60),
        pong_wait: Duration::from_millis(150),
        ..ConnectionConfig::default()
    };
    let addr = spawn_server(state).await;
    let mut idle = connect(addr).await;
    send_json(&mut idle, &join("B1", "idle")).await;
    recv_kind(&mut idle, "participants_update").await;

    let frame = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match idle.next().await {
                Some(Ok(WsMessage::Text(_) | WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                other => return other,
            }
        }
    })
    .await
    .expect("no close frame before timeout");
    assert!(matches!(frame, Some(Ok(WsMessage::Close(_)))), "expected close frame, got {frame:?}");
}

#[tokio::test]
async fn evicted_slow_consumer_receives_close_frame() {
    let (mut state, _) = test_app_state().await;
    state.connection = ConnectionConfig { outbound_capacity: 1, ..ConnectionConfig::default() };
    let hub = state.hub.clone();
    let addr = spawn_server(state).await;
    let mut slow = connect(addr).await;
    // One round trip proves the connection is registered.
    let ready = json!({"type": "card_moved"});
    send_json(&mut slow, &ready).await;
    assert_eq!(recv_json(&mut slow).await, ready);

    // Queued faster than the writer can drain a one-slot queue.
    for n in 0..64 {
        let event = crate::event::Event::board_refresh(&format!("B{n}"));
        hub.broadcast(&event).await.unwrap();
    }

    let mut texts = 0;
    let frame = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match slow.next().await {
                Some(Ok(WsMessage::Text(_))) => texts += 1,
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                other => return other,
            }
        }
    })
    .await
    .expect("no close frame before timeout");
    assert!(matches!(frame, Some(Ok(WsMessage::Close(_)))), "expected close frame, got {frame:?}");
    assert!(texts < 64, "slow consumer received all {texts} frames");
}

#[tokio::test]
async fn queued_frames_arrive_in_order_as_separate_messages() {
    let (state, _) = test_app_state().await;
    let addr = spawn_server(state.clone()).await;
    let mut client = connect(addr).await;
    send_json(&mut client, &join("B1", "alice")).await;
    recv_kind(&mut client, "participants_update").await;
    recv_kind(&mut client, "join_board").await;

    // All ten land in the outbound queue before the writer runs.
    for n in 0..10 {
        let event = crate::event::Event::board_refresh(&format!("B{n}"));
        state.hub.broadcast(&event).await.unwrap();
    }

    for n in 0..10 {
        let frame = recv_json(&mut client).await;
        assert_eq!(frame["type"], "board_update");
        assert_eq!(frame["data"]["board_id"], format!("B{n}"));
    }
}
