//! WebSocket signaling endpoint
//!
//! Bridges each browser viewer to its peer session: admission, welcome,
//! server-initiated offer, then answer/candidate exchange until the socket
//! closes. The same channel carries keepalive pings and the viewer's
//! bitrate hints. One task per connection; everything winds down through a
//! cancellation token so `stop` can close live sockets promptly.

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::protocol::{ice_servers, IceServerEntry, InboundMessage, OutboundMessage};
use crate::registry::PeerRegistry;

/// Sink for viewer bitrate hints, wired to the media pipeline.
pub type BitrateCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// Outbound queue depth per socket. Writes are enqueues; the socket task
/// drains them in order.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// WebSocket signaling server.
pub struct SignalingEndpoint {
    signaling_port: u16,
    registry: Arc<PeerRegistry>,
    ice_servers: Vec<IceServerEntry>,
    bitrate_cb: Arc<Mutex<Option<BitrateCallback>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: Mutex<Option<SocketAddr>>,
}

#[derive(Clone)]
struct ConnContext {
    registry: Arc<PeerRegistry>,
    ice_servers: Vec<IceServerEntry>,
    bitrate_cb: Arc<Mutex<Option<BitrateCallback>>>,
    shutdown: CancellationToken,
}

impl SignalingEndpoint {
    pub fn new(config: &AppConfig, registry: Arc<PeerRegistry>) -> Self {
        Self {
            signaling_port: config.server.signaling_port,
            registry,
            ice_servers: ice_servers(&config.webrtc),
            bitrate_cb: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: Mutex::new(None),
        }
    }

    /// Register the sink for viewer bitrate hints.
    pub fn set_bitrate_callback(&self, cb: BitrateCallback) {
        *self.bitrate_cb.lock().unwrap() = Some(cb);
    }

    /// Bind the listener and spawn the acceptor. A bind failure is fatal
    /// for the endpoint and is returned to the caller.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.signaling_port))
            .await
            .with_context(|| {
                format!("failed to bind signaling port {}", self.signaling_port)
            })?;
        let addr = listener.local_addr().context("listener has no local addr")?;
        *self.local_addr.lock().unwrap() = Some(addr);
        info!("signaling server listening on ws://{}", addr);

        let ctx = ConnContext {
            registry: Arc::clone(&self.registry),
            ice_servers: self.ice_servers.clone(),
            bitrate_cb: Arc::clone(&self.bitrate_cb),
            shutdown: self.shutdown.clone(),
        };
        let tracker = self.tracker.clone();
        let shutdown = self.shutdown.clone();

        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let ctx = ctx.clone();
                            tracker.spawn(async move {
                                handle_connection(stream, addr, ctx).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
            debug!("signaling acceptor stopped");
        });
        Ok(())
    }

    /// Close the listener and every live socket, then wait for the tasks.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("signaling server stopped");
    }

    /// Bound address, available after a successful `start`. Useful when
    /// the configured port is 0 (ephemeral).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: ConnContext) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut tx, mut rx) = ws.split();

    let (out_tx, mut out_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_QUEUE_DEPTH);
    let Some(peer_id) = ctx.registry.create_peer(out_tx).await else {
        warn!(%addr, "rejected client: max peers reached");
        let _ = send_json(
            &mut tx,
            &OutboundMessage::Error {
                message: "Server full, max peers reached".to_string(),
            },
        )
        .await;
        let _ = tx.close().await;
        return;
    };
    info!(%addr, peer = %peer_id, "client connected");

    let welcome = OutboundMessage::Welcome {
        peer_id: peer_id.clone(),
        ice_servers: ctx.ice_servers.clone(),
    };
    if send_json(&mut tx, &welcome).await.is_err() {
        ctx.registry.remove_peer(&peer_id).await;
        return;
    }

    // The offer travels through the outbound queue, so it always follows
    // the welcome already written above.
    ctx.registry.start_offer(&peer_id).await;

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            outbound = out_rx.recv() => match outbound {
                Some(msg) => {
                    if send_json(&mut tx, &msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&peer_id, &text, &mut tx, &ctx).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = tx.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary frames are not part of the protocol
                Some(Err(e)) => {
                    warn!(peer = %peer_id, error = %e, "WebSocket error");
                    break;
                }
            }
        }
    }

    ctx.registry.remove_peer(&peer_id).await;
    info!(peer = %peer_id, "client disconnected");
}

/// Dispatch one inbound text frame. A malformed or unknown message never
/// tears the socket down.
async fn handle_text(peer_id: &str, text: &str, tx: &mut WsSink, ctx: &ConnContext) {
    match serde_json::from_str::<InboundMessage>(text) {
        Ok(InboundMessage::Answer { sdp }) => {
            if sdp.is_empty() {
                debug!(peer = %peer_id, "answer without SDP ignored");
                return;
            }
            ctx.registry.handle_answer(peer_id, sdp).await;
        }
        Ok(InboundMessage::Candidate { data }) => {
            ctx.registry
                .handle_candidate(peer_id, &data.candidate, &data.sdp_mid)
                .await;
        }
        Ok(InboundMessage::Ping) => {
            let _ = send_json(tx, &OutboundMessage::Pong).await;
        }
        Ok(InboundMessage::Bitrate { kbps }) => {
            debug!(peer = %peer_id, kbps, "bitrate hint from viewer");
            let cb = ctx.bitrate_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(kbps);
            }
        }
        Ok(InboundMessage::Unknown) => {
            debug!(peer = %peer_id, "unknown message type ignored");
        }
        Err(e) => {
            warn!(peer = %peer_id, error = %e, "invalid JSON signaling message dropped");
        }
    }
}

async fn send_json(tx: &mut WsSink, msg: &OutboundMessage) -> Result<()> {
    let json = serde_json::to_string(msg).context("failed to serialize signaling message")?;
    tx.send(Message::Text(json.into()))
        .await
        .context("failed to send signaling message")?;
    Ok(())
}
