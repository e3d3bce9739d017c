//! End-to-end scenarios driven over real TCP sockets and WebSocket clients
//! against a live `HubServer`, rather than calling Router methods directly.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pigeon_hub::config::HubConfig;
use pigeon_hub::protocol::{decode_frame, encode_frame, Frame, FramePayload};
use pigeon_hub::server::HubServer;
use pigeon_hub::state::HubState;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn peer(byte: u8) -> String {
    format!("{byte:02x}").repeat(20)
}

async fn spawn_hub(mut config: HubConfig) -> (std::sync::Arc<HubServer>, std::net::SocketAddr) {
    config.port = 0;
    config.host = "127.0.0.1".to_string();
    let state = HubState::new(config);
    let server = HubServer::new(state);
    let addr = server.start().await.expect("hub should start");
    (server, addr)
}

async fn connect(addr: std::net::SocketAddr, peer_id: &str) -> Client {
    let url = format!("ws://{addr}/ws?peerId={peer_id}");
    let (stream, _response) = tokio_tungstenite::connect_async(&url).await.expect("client should connect");
    stream
}

async fn send(client: &mut Client, frame: Frame) {
    client.send(WsMessage::Text(encode_frame(&frame).into())).await.expect("send should succeed");
}

async fn recv(client: &mut Client) -> Frame {
    let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("should receive a frame before timeout")
        .expect("stream should not end")
        .expect("should be a valid websocket message");
    match msg {
        WsMessage::Text(text) => decode_frame(&text, 1_048_576).expect("frame should decode"),
        other => panic!("unexpected message: {other:?}"),
    }
}

async fn recv_kind(client: &mut Client, kind: &str) -> Frame {
    loop {
        let frame = recv(client).await;
        if frame.kind() == kind {
            return frame;
        }
    }
}

fn announce(network: &str) -> Frame {
    Frame::Announce(FramePayload::new().with_network(network).with_data(serde_json::json!({})))
}

#[tokio::test]
async fn same_network_pair_exchanges_offer_and_answer() {
    let (server, addr) = spawn_hub(HubConfig::for_test()).await;
    let a = peer(0xa1);
    let b = peer(0xb2);
    let mut client_a = connect(addr, &a).await;
    let mut client_b = connect(addr, &b).await;

    send(&mut client_a, announce("room1")).await;
    send(&mut client_b, announce("room1")).await;

    // a learns about b joining.
    let discovered = recv_kind(&mut client_a, "peer-discovered").await;
    assert_eq!(discovered.payload().unwrap().from_peer_id.as_deref(), Some(b.as_str()));

    send(
        &mut client_a,
        Frame::Offer(
            FramePayload::new()
                .with_network("room1")
                .with_target(b.clone())
                .with_data(serde_json::json!({"sdp": "offer-sdp"})),
        ),
    )
    .await;
    let offer = recv_kind(&mut client_b, "offer").await;
    assert_eq!(offer.payload().unwrap().from_peer_id.as_deref(), Some(a.as_str()));

    send(
        &mut client_b,
        Frame::Answer(
            FramePayload::new()
                .with_network("room1")
                .with_target(a.clone())
                .with_data(serde_json::json!({"sdp": "answer-sdp"})),
        ),
    )
    .await;
    let answer = recv_kind(&mut client_a, "answer").await;
    assert_eq!(answer.payload().unwrap().from_peer_id.as_deref(), Some(b.as_str()));

    server.stop().await;
}

#[tokio::test]
async fn clients_on_different_networks_do_not_see_each_other() {
    let (server, addr) = spawn_hub(HubConfig::for_test()).await;
    let a = peer(0xc1);
    let b = peer(0xc2);
    let mut client_a = connect(addr, &a).await;
    let mut client_b = connect(addr, &b).await;

    send(&mut client_a, announce("net-a")).await;
    send(&mut client_b, announce("net-b")).await;

    send(
        &mut client_a,
        Frame::Offer(FramePayload::new().with_network("net-a").with_target(b.clone())),
    )
    .await;

    // b should never receive the cross-network offer; a ping/pong on a's
    // socket proves the hub is still alive and simply dropped the offer.
    send(&mut client_a, Frame::Ping(FramePayload::new())).await;
    let pong = recv_kind(&mut client_a, "pong").await;
    assert_eq!(pong.kind(), "pong");

    let result = tokio::time::timeout(Duration::from_millis(300), client_b.next()).await;
    assert!(result.is_err(), "client_b should not have received anything");

    server.stop().await;
}

#[tokio::test]
async fn duplicate_peer_id_is_rejected_with_policy_close() {
    let (server, addr) = spawn_hub(HubConfig::for_test()).await;
    let a = peer(0xd1);
    let mut first = connect(addr, &a).await;
    send(&mut first, announce("room1")).await;

    let mut second = connect(addr, &a).await;
    let msg = tokio::time::timeout(Duration::from_secs(2), second.next())
        .await
        .expect("should receive a close frame")
        .expect("stream should not end")
        .expect("should be a valid websocket message");
    match msg {
        WsMessage::Close(Some(frame)) => assert_eq!(frame.code, 1008u16.into()),
        other => panic!("expected a policy-violation close, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn capacity_limit_rejects_connections_beyond_max() {
    let mut config = HubConfig::for_test();
    config.max_connections = 1;
    let (server, addr) = spawn_hub(config).await;

    let a = peer(0xe1);
    let _client_a = connect(addr, &a).await;

    let b = peer(0xe2);
    let mut client_b = connect(addr, &b).await;
    let msg = tokio::time::timeout(Duration::from_secs(2), client_b.next())
        .await
        .expect("should receive a close frame")
        .expect("stream should not end")
        .expect("should be a valid websocket message");
    match msg {
        WsMessage::Close(Some(frame)) => assert_eq!(frame.code, 1008u16.into()),
        other => panic!("expected a capacity close, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn goodbye_notifies_peers_in_the_same_network() {
    let (server, addr) = spawn_hub(HubConfig::for_test()).await;
    let a = peer(0xf1);
    let b = peer(0xf2);
    let mut client_a = connect(addr, &a).await;
    let mut client_b = connect(addr, &b).await;

    send(&mut client_a, announce("room1")).await;
    send(&mut client_b, announce("room1")).await;
    let _ = recv_kind(&mut client_a, "peer-discovered").await;

    send(&mut client_b, Frame::Goodbye(FramePayload::new().with_network("room1"))).await;
    let disconnected = recv_kind(&mut client_a, "peer-disconnected").await;
    assert_eq!(disconnected.payload().unwrap().from_peer_id.as_deref(), Some(b.as_str()));

    server.stop().await;
}

#[tokio::test]
async fn health_and_hubs_endpoints_report_server_state() {
    let (server, addr) = spawn_hub(HubConfig::for_test()).await;
    let a = peer(0x11);
    let _client = connect(addr, &a).await;

    let body = reqwest_health(addr).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connections"], 1);

    server.stop().await;
}

async fn reqwest_health(addr: std::net::SocketAddr) -> serde_json::Value {
    let stream = TcpStream::connect(addr).await.expect("tcp connect should succeed");
    let (mut reader, mut writer) = stream.into_split();
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    writer
        .write_all(format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), reader.read_to_end(&mut buf))
        .await
        .expect("http response should arrive before timeout")
        .unwrap();
    let text = String::from_utf8_lossy(&buf);
    let body = text.split("\r\n\r\n").nth(1).expect("response should have a body");
    serde_json::from_str(body).expect("body should be JSON")
}
