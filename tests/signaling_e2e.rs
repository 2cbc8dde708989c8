//! End-to-end signaling tests
//!
//! Drives the real WebSocket endpoint with tokio-tungstenite clients:
//! admission at the peer cap, welcome/offer ordering, ping/pong, bitrate
//! hints, and peer cleanup on disconnect. The answering side of the
//! offer/answer test is a genuine webrtc-rs peer, so the SDP exchanged is
//! real.
//!
//! Run: `cargo test --test signaling_e2e`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use streamgate::config::AppConfig;
use streamgate::registry::PeerRegistry;
use streamgate::signaling::SignalingEndpoint;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a gateway on an ephemeral port, return its parts.
async fn start_gateway(max_peers: usize) -> (Arc<SignalingEndpoint>, Arc<PeerRegistry>, String) {
    let mut config = AppConfig::default();
    config.server.signaling_port = 0;
    config.webrtc.max_peers = max_peers;

    let registry = Arc::new(PeerRegistry::new(config.webrtc.clone()));
    registry.start();

    let signaling = Arc::new(SignalingEndpoint::new(&config, Arc::clone(&registry)));
    signaling.start().await.expect("signaling start failed");

    let addr = signaling.local_addr().expect("no bound address");
    (signaling, registry, format!("ws://{}", addr))
}

async fn connect(url: &str) -> WsClient {
    let (ws, _) = connect_async(url).await.expect("WebSocket connect failed");
    ws
}

/// Receive the next text frame as JSON, with a timeout.
async fn recv_json(ws: &mut WsClient, timeout: Duration) -> Option<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str(&text).ok();
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return None,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => return None,
            Err(_) => return None,
        }
    }
}

async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn welcome_then_offer_in_order() {
    let (signaling, registry, url) = start_gateway(4).await;
    let mut ws = connect(&url).await;

    let welcome = recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();
    assert_eq!(welcome["type"], "welcome");
    let peer_id = welcome["peerId"].as_str().unwrap();
    assert_eq!(peer_id.len(), 8);
    assert!(peer_id.chars().all(|c| c.is_ascii_hexdigit()));
    let ice = welcome["iceServers"].as_array().unwrap();
    assert!(!ice.is_empty());
    assert!(ice[0]["urls"].as_str().unwrap().starts_with("stun:"));

    let offer = recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();
    assert_eq!(offer["type"], "offer");
    let sdp = offer["sdp"].as_str().unwrap();
    assert!(sdp.contains("m=video"));
    assert!(sdp.contains("sendonly"));

    ws.close(None).await.ok();
    signaling.stop().await;
    registry.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn third_client_is_refused_at_cap_of_two() {
    let (signaling, registry, url) = start_gateway(2).await;

    let mut a = connect(&url).await;
    let wa = recv_json(&mut a, Duration::from_secs(5)).await.unwrap();
    assert_eq!(wa["type"], "welcome");

    let mut b = connect(&url).await;
    let wb = recv_json(&mut b, Duration::from_secs(5)).await.unwrap();
    assert_eq!(wb["type"], "welcome");

    let mut c = connect(&url).await;
    let wc = recv_json(&mut c, Duration::from_secs(5)).await.unwrap();
    assert_eq!(wc["type"], "error");
    assert_eq!(wc["message"], "Server full, max peers reached");

    // the refused socket is closed by the server
    assert!(recv_json(&mut c, Duration::from_secs(2)).await.is_none());
    assert_eq!(registry.peer_count(), 2);

    a.close(None).await.ok();
    b.close(None).await.ok();
    signaling.stop().await;
    registry.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_gets_a_single_pong() {
    let (signaling, registry, url) = start_gateway(4).await;
    let mut ws = connect(&url).await;

    // drain welcome + offer
    recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();
    recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();

    send_json(&mut ws, serde_json::json!({"type": "ping"})).await;

    // skip trickled candidates until the pong arrives
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut got_pong = false;
    while tokio::time::Instant::now() < deadline {
        match recv_json(&mut ws, Duration::from_secs(1)).await {
            Some(msg) if msg["type"] == "pong" => {
                got_pong = true;
                break;
            }
            Some(msg) => assert_eq!(msg["type"], "candidate"),
            None => break,
        }
    }
    assert!(got_pong, "no pong received");

    ws.close(None).await.ok();
    signaling.stop().await;
    registry.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bitrate_hints_reach_the_callback() {
    let (signaling, registry, url) = start_gateway(4).await;

    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        signaling.set_bitrate_callback(Arc::new(move |kbps| {
            seen.lock().unwrap().push(kbps);
        }));
    }

    let mut ws = connect(&url).await;
    recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();
    recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();

    for kbps in [12_000, 100, 2_000] {
        send_json(&mut ws, serde_json::json!({"type": "bitrate", "kbps": kbps})).await;
    }

    // hints are applied asynchronously; poll until all three arrived
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while seen.lock().unwrap().len() < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(*seen.lock().unwrap(), vec![12_000, 100, 2_000]);

    // the pipeline clamps these into the configured range
    use streamgate::pipeline::clamp_bitrate;
    let clamped: Vec<i32> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|&k| clamp_bitrate(k, 500, 8000))
        .collect();
    assert_eq!(clamped, vec![8000, 500, 2000]);

    ws.close(None).await.ok();
    signaling.stop().await;
    registry.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_and_unknown_messages_leave_the_socket_open() {
    let (signaling, registry, url) = start_gateway(4).await;
    let mut ws = connect(&url).await;

    recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();
    recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();

    ws.send(Message::Text("{not json at all".to_string().into()))
        .await
        .unwrap();
    send_json(&mut ws, serde_json::json!({"type": "telemetry", "x": 1})).await;

    // still alive: ping is answered
    send_json(&mut ws, serde_json::json!({"type": "ping"})).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut got_pong = false;
    while tokio::time::Instant::now() < deadline {
        match recv_json(&mut ws, Duration::from_secs(1)).await {
            Some(msg) if msg["type"] == "pong" => {
                got_pong = true;
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    assert!(got_pong, "socket should survive malformed input");

    ws.close(None).await.ok();
    signaling.stop().await;
    registry.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_removes_the_peer() {
    let (signaling, registry, url) = start_gateway(4).await;

    let mut ws = connect(&url).await;
    recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();
    assert_eq!(registry.peer_count(), 1);

    ws.close(None).await.ok();
    drop(ws);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.peer_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(registry.peer_count(), 0);

    signaling.stop().await;
    registry.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn freed_slot_admits_a_new_client() {
    let (signaling, registry, url) = start_gateway(1).await;

    let mut a = connect(&url).await;
    assert_eq!(
        recv_json(&mut a, Duration::from_secs(5)).await.unwrap()["type"],
        "welcome"
    );

    let mut refused = connect(&url).await;
    assert_eq!(
        recv_json(&mut refused, Duration::from_secs(5)).await.unwrap()["type"],
        "error"
    );

    a.close(None).await.ok();
    drop(a);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.peer_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut b = connect(&url).await;
    assert_eq!(
        recv_json(&mut b, Duration::from_secs(5)).await.unwrap()["type"],
        "welcome"
    );

    b.close(None).await.ok();
    signaling.stop().await;
    registry.stop().await;
}

/// Answer the server's offer with a real webrtc-rs peer. The exchange must
/// be accepted without the server sending an error or dropping the socket.
#[tokio::test(flavor = "multi_thread")]
async fn real_answer_is_accepted() {
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    let (signaling, registry, url) = start_gateway(4).await;
    let mut ws = connect(&url).await;

    let welcome = recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();
    assert_eq!(welcome["type"], "welcome");
    let offer = recv_json(&mut ws, Duration::from_secs(5)).await.unwrap();
    assert_eq!(offer["type"], "offer");
    let offer_sdp = offer["sdp"].as_str().unwrap().to_string();
    assert!(offer_sdp.contains("b=AS:4000"), "offer carries the bitrate hint");

    // Build a browser-equivalent answering peer
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let interceptors = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(interceptors)
        .build();
    let pc = api.new_peer_connection(Default::default()).await.unwrap();

    pc.set_remote_description(RTCSessionDescription::offer(offer_sdp).unwrap())
        .await
        .unwrap();
    let answer = pc.create_answer(None).await.unwrap();
    pc.set_local_description(answer.clone()).await.unwrap();

    send_json(&mut ws, serde_json::json!({"type": "answer", "sdp": answer.sdp})).await;

    // A bogus empty candidate must be ignored without killing the session
    send_json(
        &mut ws,
        serde_json::json!({"type": "candidate", "data": {"candidate": "", "sdpMid": "0"}}),
    )
    .await;
    // A well-formed host candidate is accepted
    send_json(
        &mut ws,
        serde_json::json!({"type": "candidate", "data": {
            "candidate": "candidate:1 1 UDP 2122260223 192.0.2.1 60000 typ host",
            "sdpMid": "0"
        }}),
    )
    .await;

    // The session is still alive and the peer still registered
    send_json(&mut ws, serde_json::json!({"type": "ping"})).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut got_pong = false;
    while tokio::time::Instant::now() < deadline {
        match recv_json(&mut ws, Duration::from_secs(1)).await {
            Some(msg) if msg["type"] == "pong" => {
                got_pong = true;
                break;
            }
            Some(msg) => {
                let t = msg["type"].as_str().unwrap();
                assert!(t == "candidate" || t == "offer", "unexpected message: {}", t);
            }
            None => break,
        }
    }
    assert!(got_pong);
    assert_eq!(registry.peer_count(), 1);

    pc.close().await.ok();
    ws.close(None).await.ok();
    signaling.stop().await;
    registry.stop().await;
}
