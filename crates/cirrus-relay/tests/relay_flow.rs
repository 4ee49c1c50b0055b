//! End-to-end signaling over real websocket connections.

use std::net::SocketAddr;
use std::time::Duration;

use cirrus_relay::{RelayConfig, RelayServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct Relay {
    streamer: SocketAddr,
    player: SocketAddr,
    task: JoinHandle<cirrus_common::Result<()>>,
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn start_relay_with(config: RelayConfig) -> Relay {
    let server = RelayServer::bind(RelayConfig {
        streamer_listen: "127.0.0.1:0".parse().unwrap(),
        player_listen: "127.0.0.1:0".parse().unwrap(),
        ..config
    })
    .await
    .unwrap();
    let streamer = server.streamer_addr().unwrap();
    let player = server.player_addr().unwrap();
    let task = tokio::spawn(server.run());
    Relay {
        streamer,
        player,
        task,
    }
}

async fn start_relay() -> Relay {
    start_relay_with(RelayConfig {
        peer_connection_options: Some(json!({"iceServers": [{"urls": "stun:stun.example.org"}]})),
        ..RelayConfig::default()
    })
    .await
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = timeout(WAIT, connect_async(format!("ws://{}/", addr)))
        .await
        .expect("connect timed out")
        .expect("websocket handshake failed");
    ws
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next envelope, skipping websocket control frames.
async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                return serde_json::from_str(msg.to_text().unwrap()).unwrap();
            }
            Message::Close(frame) => panic!("connection closed: {:?}", frame),
            _ => continue,
        }
    }
}

/// Skip envelopes until one of type `kind` shows up.
async fn recv_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let value = recv_json(ws).await;
        if value["type"] == kind {
            return value;
        }
    }
}

/// Skip envelopes until the relay closes the connection.
async fn recv_close(ws: &mut Ws) -> Option<CloseFrame> {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Connect a player and consume its `config` message.
async fn connect_player(relay: &Relay) -> (Ws, String) {
    let mut ws = connect(relay.player).await;
    let config = recv_json(&mut ws).await;
    assert_eq!(config["type"], "config", "first message must be config");
    let id = config["playerId"].as_str().unwrap().to_string();
    (ws, id)
}

async fn http_get(addr: SocketAddr, path: &str) -> (String, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8(raw).unwrap();
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    let status = head.lines().next().unwrap().to_string();
    (status, body.to_string())
}

#[tokio::test]
async fn test_player_receives_config_first() {
    let relay = start_relay().await;
    let mut player = connect(relay.player).await;

    let config = recv_json(&mut player).await;
    assert_eq!(
        config,
        json!({
            "type": "config",
            "playerId": "1",
            "peerConnectionOptions": {"iceServers": [{"urls": "stun:stun.example.org"}]}
        })
    );
    assert_eq!(
        recv_json(&mut player).await,
        json!({"type": "playerCount", "count": 1})
    );
}

#[tokio::test]
async fn test_offer_answer_exchange() {
    let relay = start_relay().await;
    let mut streamer = connect(relay.streamer).await;
    let (mut player, id) = connect_player(&relay).await;
    assert_eq!(id, "1");

    assert_eq!(
        recv_json(&mut streamer).await,
        json!({"type": "playerConnected", "playerId": "1"})
    );

    send_json(&mut player, json!({"type": "offer", "sdp": "X"})).await;
    assert_eq!(
        recv_json(&mut streamer).await,
        json!({"type": "offer", "sdp": "X", "playerId": "1"})
    );

    send_json(
        &mut streamer,
        json!({"type": "answer", "sdp": "Y", "playerId": "1"}),
    )
    .await;
    let answer = recv_type(&mut player, "answer").await;
    assert_eq!(answer["sdp"], "Y");

    let candidate = json!({"candidate": "candidate:1 1 UDP 2122 192.0.2.1 5000 typ host", "sdpMid": "0"});
    send_json(
        &mut player,
        json!({"type": "iceCandidate", "candidate": candidate}),
    )
    .await;
    assert_eq!(
        recv_json(&mut streamer).await,
        json!({"type": "iceCandidate", "candidate": candidate, "playerId": "1"})
    );
}

#[tokio::test]
async fn test_streamer_replacement() {
    let relay = start_relay().await;
    let mut s1 = connect(relay.streamer).await;
    let (mut player, id) = connect_player(&relay).await;
    recv_type(&mut s1, "playerConnected").await;

    let mut s2 = connect(relay.streamer).await;
    let frame = recv_close(&mut s1).await.expect("close frame");
    assert_eq!(u16::from(frame.code), 4000);

    recv_type(&mut player, "streamerConnected").await;
    assert_eq!(
        recv_json(&mut s2).await,
        json!({"type": "playerConnected", "playerId": id})
    );

    send_json(&mut player, json!({"type": "offer", "sdp": "renegotiate"})).await;
    assert_eq!(
        recv_json(&mut s2).await,
        json!({"type": "offer", "sdp": "renegotiate", "playerId": id})
    );
}

#[tokio::test]
async fn test_player_disconnect_notifies_streamer() {
    let relay = start_relay().await;
    let mut streamer = connect(relay.streamer).await;
    let (mut player, _id) = connect_player(&relay).await;
    recv_type(&mut streamer, "playerConnected").await;

    player.close(None).await.unwrap();
    assert_eq!(
        recv_json(&mut streamer).await,
        json!({"type": "playerDisconnected", "playerId": "1"})
    );
}

#[tokio::test]
async fn test_streamer_disconnect_notifies_players() {
    let relay = start_relay().await;
    let mut streamer = connect(relay.streamer).await;
    let (mut player, _id) = connect_player(&relay).await;
    recv_type(&mut streamer, "playerConnected").await;

    streamer.close(None).await.unwrap();
    recv_type(&mut player, "streamerDisconnected").await;
}

#[tokio::test]
async fn test_offer_without_streamer_is_dropped() {
    let relay = start_relay().await;
    let (mut player, _id) = connect_player(&relay).await;

    send_json(&mut player, json!({"type": "offer", "sdp": "X"})).await;
    let error = recv_type(&mut player, "error").await;
    assert_eq!(error["message"], "no streamer connected");

    let (status, body) = http_get(relay.player, "/health").await;
    assert!(status.contains("200"), "unexpected status {}", status);
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["routes_unavailable"], 1);
    assert_eq!(health["streamer_connected"], false);
    assert_eq!(health["players"], 1);

    // The relay keeps accepting both kinds of peer.
    let (_second, second_id) = connect_player(&relay).await;
    assert_eq!(second_id, "2");
    let mut streamer = connect(relay.streamer).await;
    recv_type(&mut streamer, "playerConnected").await;
}

#[tokio::test]
async fn test_invalid_message_keeps_connection_open() {
    let relay = start_relay().await;
    let (mut player, _id) = connect_player(&relay).await;

    player
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();
    let error = recv_type(&mut player, "error").await;
    assert!(error["message"].as_str().unwrap().starts_with("invalid message"));

    send_json(&mut player, json!({"type": "bogus"})).await;
    recv_type(&mut player, "error").await;

    send_json(&mut player, json!({"type": "ping", "time": 7})).await;
    assert_eq!(
        recv_type(&mut player, "pong").await,
        json!({"type": "pong", "time": 7})
    );
}

#[tokio::test]
async fn test_binary_frames_are_accepted() {
    let relay = start_relay().await;
    let mut streamer = connect(relay.streamer).await;
    let (mut player, _id) = connect_player(&relay).await;
    recv_type(&mut streamer, "playerConnected").await;

    let raw = json!({"type": "offer", "sdp": "binary"}).to_string().into_bytes();
    player.send(Message::Binary(raw.into())).await.unwrap();
    let offer = recv_json(&mut streamer).await;
    assert_eq!(offer["sdp"], "binary");
    assert_eq!(offer["playerId"], "1");
}

#[tokio::test]
async fn test_streamer_broadcast_and_targeting() {
    let relay = start_relay().await;
    let mut streamer = connect(relay.streamer).await;
    let (mut p1, id1) = connect_player(&relay).await;
    let (mut p2, id2) = connect_player(&relay).await;
    recv_type(&mut streamer, "playerConnected").await;
    recv_type(&mut streamer, "playerConnected").await;

    let candidate = json!({"candidate": "candidate:0 1 UDP 1 198.51.100.7 3478 typ relay"});
    send_json(
        &mut streamer,
        json!({"type": "iceCandidate", "candidate": candidate, "broadcast": true}),
    )
    .await;
    assert_eq!(recv_type(&mut p1, "iceCandidate").await["candidate"], candidate);
    assert_eq!(recv_type(&mut p2, "iceCandidate").await["candidate"], candidate);

    send_json(
        &mut streamer,
        json!({"type": "answer", "sdp": "for-two", "playerId": id2}),
    )
    .await;
    assert_eq!(recv_type(&mut p2, "answer").await["sdp"], "for-two");

    // Untargeted signals from the streamer are rejected back to it.
    send_json(&mut streamer, json!({"type": "answer", "sdp": "nobody"})).await;
    let error = recv_type(&mut streamer, "error").await;
    assert!(error["message"].as_str().unwrap().contains("playerId"));

    // p1 saw only the broadcast, never p2's answer.
    send_json(&mut p1, json!({"type": "ping"})).await;
    let mut seen = Vec::new();
    loop {
        let value = recv_json(&mut p1).await;
        if value["type"] == "pong" {
            break;
        }
        seen.push(value["type"].as_str().unwrap().to_string());
    }
    assert!(!seen.contains(&"answer".to_string()), "p1 saw {:?}", seen);
    assert_ne!(id1, id2);
}

#[tokio::test]
async fn test_streamer_can_disconnect_player() {
    let relay = start_relay().await;
    let mut streamer = connect(relay.streamer).await;
    let (mut player, id) = connect_player(&relay).await;
    recv_type(&mut streamer, "playerConnected").await;

    send_json(
        &mut streamer,
        json!({"type": "disconnectPlayer", "playerId": id, "reason": "kicked"}),
    )
    .await;
    let frame = recv_close(&mut player).await.expect("close frame");
    assert_eq!(frame.reason.as_str(), "kicked");

    assert_eq!(
        recv_json(&mut streamer).await,
        json!({"type": "playerDisconnected", "playerId": id})
    );
}

#[tokio::test]
async fn test_rate_limit_closes_connection() {
    let relay = start_relay_with(RelayConfig {
        max_messages_per_minute: 3,
        ..RelayConfig::default()
    })
    .await;
    let (mut player, _id) = connect_player(&relay).await;

    for _ in 0..4 {
        send_json(&mut player, json!({"type": "ping"})).await;
    }
    let error = recv_type(&mut player, "error").await;
    assert_eq!(error["message"], "rate limit exceeded");
    let frame = recv_close(&mut player).await.expect("close frame");
    assert_eq!(u16::from(frame.code), 1008);
}

#[tokio::test]
async fn test_oversize_message_closes_with_1009() {
    let relay = start_relay_with(RelayConfig {
        max_message_bytes: 1024,
        ..RelayConfig::default()
    })
    .await;
    let (mut player, _id) = connect_player(&relay).await;

    let padding = "x".repeat(1500);
    send_json(&mut player, json!({"type": "ping", "padding": padding})).await;
    let error = recv_type(&mut player, "error").await;
    assert_eq!(error["message"], "message too large");
    let frame = recv_close(&mut player).await.expect("close frame");
    assert_eq!(u16::from(frame.code), 1009);
}

#[tokio::test]
async fn test_far_oversize_message_is_cut_by_transport() {
    let relay = start_relay_with(RelayConfig {
        max_message_bytes: 1024,
        ..RelayConfig::default()
    })
    .await;
    let (mut player, _id) = connect_player(&relay).await;

    let padding = "x".repeat(8 * 1024);
    send_json(&mut player, json!({"type": "ping", "padding": padding})).await;
    // Whatever the ending looks like, the connection must not stay open.
    let _ = recv_close(&mut player).await;

    let (_next, id) = connect_player(&relay).await;
    assert!(!id.is_empty());
}

#[tokio::test]
async fn test_prometheus_endpoint() {
    let relay = start_relay().await;
    let (_player, _id) = connect_player(&relay).await;

    let (status, body) = http_get(relay.player, "/metrics/prometheus").await;
    assert!(status.contains("200"));
    assert!(body.contains("cirrus_players 1\n"));
    assert!(body.contains("cirrus_streamer_connected 0\n"));
}
