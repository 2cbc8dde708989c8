//! WebRTC peer session
//!
//! One session per browser viewer: a webrtc-rs peer connection carrying a
//! single sendonly H.264 track. The server side creates the offer; the
//! browser answers and trickles candidates back through the signaling
//! bridge. Annex-B access units are enqueued non-blocking into a small
//! per-session transport queue; a writer task packetizes them into RTP and
//! writes through the track. RTCP sender reports and NACK handling come
//! from the default interceptor chain.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::packetizer::Payloader;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::config::WebRtcConfig;
use crate::h264;
use crate::protocol::{CandidatePayload, OutboundMessage};

/// RTCP CNAME shared by every session's track.
const TRACK_CNAME: &str = "video-stream";
/// MSID (media stream id) shared by every session's track.
const TRACK_MSID: &str = "stream-server";
/// RTP clock rate for H.264 (RFC 6184).
const VIDEO_CLOCK_RATE: u32 = 90_000;
/// Target RTP packet size; payloads above this fragment into FU-A.
const RTP_MTU: usize = 1200;
/// Transport queue depth per session. The queue is the only buffering
/// between the media graph and the network; when it fills, frames drop.
const NAL_QUEUE_DEPTH: usize = 32;
/// H.264 fmtp advertised in the offer (baseline, packetization-mode 1).
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Process-wide SSRC counter. Strictly increasing, never reused.
static NEXT_SSRC: AtomicU32 = AtomicU32::new(42);

fn next_ssrc() -> u32 {
    NEXT_SSRC.fetch_add(1, Ordering::SeqCst)
}

/// Convert a presentation timestamp in microseconds to a 90 kHz RTP
/// timestamp, rounding to the nearest tick and wrapping modulo 2^32.
pub fn rtp_timestamp(pts_us: u64) -> u32 {
    ((pts_us as u128 * VIDEO_CLOCK_RATE as u128 + 500_000) / 1_000_000) as u32
}

/// Connection state as observed by the rest of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of per-session counters.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub rtp_packets_sent: u64,
    pub bytes_sent: u64,
    pub state: String,
}

struct SessionShared {
    peer_id: String,
    ssrc: u32,
    payload_type: u8,
    connected: AtomicBool,
    closed: AtomicBool,
    needs_keyframe: AtomicBool,
    keyframe_sent: AtomicBool,
    state: Mutex<PeerState>,
    rtp_packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
    nals_dropped: AtomicU64,
}

/// One viewer's WebRTC session.
pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    signaling_out: mpsc::Sender<OutboundMessage>,
    bitrate_kbps: i32,
    shared: Arc<SessionShared>,
    nal_tx: mpsc::Sender<(Bytes, u64)>,
    writer: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl PeerSession {
    /// Build the peer: media engine with H.264 at the configured payload
    /// type, default interceptors (RTCP reports + NACK responder), ICE
    /// servers from config, and a single sendonly track with a fresh SSRC.
    pub async fn new(
        peer_id: String,
        config: &WebRtcConfig,
        signaling_out: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<Self>> {
        let ssrc = next_ssrc();
        let payload_type = config.video.payload_type;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_owned(),
                        clock_rate: VIDEO_CLOCK_RATE,
                        channels: 0,
                        sdp_fmtp_line: H264_FMTP.to_owned(),
                        rtcp_feedback: vec![
                            RTCPFeedback {
                                typ: "nack".to_owned(),
                                parameter: String::new(),
                            },
                            RTCPFeedback {
                                typ: "nack".to_owned(),
                                parameter: "pli".to_owned(),
                            },
                            RTCPFeedback {
                                typ: "goog-remb".to_owned(),
                                parameter: String::new(),
                            },
                        ],
                    },
                    payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .context("failed to register H.264 codec")?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: build_ice_servers(config),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .context("failed to create peer connection")?,
        );

        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                sdp_fmtp_line: H264_FMTP.to_owned(),
                ..Default::default()
            },
            TRACK_CNAME.to_owned(),
            TRACK_MSID.to_owned(),
        ));

        let transceiver = pc
            .add_transceiver_from_track(
                Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .context("failed to add video track")?;

        // The sender must be drained for the interceptor chain to process
        // incoming RTCP (NACK, receiver reports).
        let rtp_sender = transceiver.sender().await;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        let shared = Arc::new(SessionShared {
            peer_id: peer_id.clone(),
            ssrc,
            payload_type,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            needs_keyframe: AtomicBool::new(true),
            keyframe_sent: AtomicBool::new(false),
            state: Mutex::new(PeerState::New),
            rtp_packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            nals_dropped: AtomicU64::new(0),
        });

        install_handlers(&pc, Arc::clone(&shared), signaling_out.clone());

        let (nal_tx, nal_rx) = mpsc::channel(NAL_QUEUE_DEPTH);
        let writer = tokio::spawn(run_writer(nal_rx, track, Arc::clone(&shared)));

        info!(peer = %peer_id, ssrc, "peer session created");

        Ok(Arc::new(Self {
            pc,
            signaling_out,
            bitrate_kbps: config.video.bitrate_kbps,
            shared,
            nal_tx,
            writer: Mutex::new(Some(writer)),
            torn_down: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.shared.peer_id
    }

    pub fn ssrc(&self) -> u32 {
        self.shared.ssrc
    }

    /// Generate the local offer, announce it through signaling.
    pub async fn start_offer(&self) -> Result<()> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .context("failed to create offer")?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .context("failed to set local description")?;

        // The bandwidth line is an encoder hint for the viewer; it only
        // needs to be present in the SDP the browser sees.
        let sdp = insert_bandwidth_line(&offer.sdp, self.bitrate_kbps);
        self.signaling_out
            .send(OutboundMessage::Offer { sdp })
            .await
            .ok();
        info!(peer = %self.shared.peer_id, "created and sent SDP offer");
        Ok(())
    }

    /// Install the browser's answer. Re-arms the keyframe gate so the
    /// viewer starts from a decodable point.
    pub async fn handle_answer(&self, sdp: String) -> Result<()> {
        debug!(peer = %self.shared.peer_id, "received SDP answer");
        let answer = RTCSessionDescription::answer(sdp).context("invalid SDP answer")?;
        self.pc
            .set_remote_description(answer)
            .await
            .context("failed to set remote description")?;
        self.shared.needs_keyframe.store(true, Ordering::SeqCst);
        self.shared.keyframe_sent.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Add a remote ICE candidate. Failures are logged, never fatal.
    pub async fn handle_candidate(&self, candidate: &str, mid: &str) {
        if candidate.is_empty() {
            warn!(peer = %self.shared.peer_id, "ignoring empty ICE candidate");
            return;
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: Some(mid.to_string()),
            ..Default::default()
        };
        match self.pc.add_ice_candidate(init).await {
            Ok(()) => debug!(peer = %self.shared.peer_id, "added remote ICE candidate"),
            Err(e) => warn!(peer = %self.shared.peer_id, error = %e, "failed to add ICE candidate"),
        }
    }

    /// Non-blocking hand-off of one access unit into the transport queue.
    /// A no-op unless the session is connected; a full queue drops the
    /// frame (latency beats completeness here).
    pub fn send_nal(&self, data: Bytes, pts_us: u64) {
        if !self.is_connected() {
            return;
        }
        if self.nal_tx.try_send((data, pts_us)).is_err() {
            self.shared.nals_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// True once the session reached `closed` or `failed`; the registry
    /// reaps such sessions.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn needs_keyframe(&self) -> bool {
        self.shared.needs_keyframe.load(Ordering::SeqCst)
    }

    pub fn keyframe_sent(&self) -> bool {
        self.shared.keyframe_sent.load(Ordering::SeqCst)
    }

    pub fn get_stats(&self) -> PeerStats {
        PeerStats {
            rtp_packets_sent: self.shared.rtp_packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            state: self.shared.state.lock().unwrap().to_string(),
        }
    }

    /// Tear the session down. Idempotent.
    pub async fn close(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.writer.lock().unwrap().take() {
            handle.abort();
        }
        if let Err(e) = self.pc.close().await {
            warn!(peer = %self.shared.peer_id, error = %e, "error closing peer connection");
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.closed.store(true, Ordering::SeqCst);
        *self.shared.state.lock().unwrap() = PeerState::Closed;
        info!(peer = %self.shared.peer_id, "peer session closed");
    }
}

fn build_ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_server.is_empty() {
        servers.push(RTCIceServer {
            urls: vec![config.stun_server.clone()],
            ..Default::default()
        });
    }
    if !config.turn_server.is_empty() {
        if config.turn_username.is_empty() || config.turn_credential.is_empty() {
            warn!(
                "skipping TURN server {}: credentials required but missing",
                config.turn_server
            );
        } else {
            servers.push(RTCIceServer {
                urls: vec![config.turn_server.clone()],
                username: config.turn_username.clone(),
                credential: config.turn_credential.clone(),
            });
        }
    }
    servers
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    shared: Arc<SessionShared>,
    signaling_out: mpsc::Sender<OutboundMessage>,
) {
    let state_shared = Arc::clone(&shared);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let shared = Arc::clone(&state_shared);
        Box::pin(async move {
            let state = match s {
                RTCPeerConnectionState::New => PeerState::New,
                RTCPeerConnectionState::Connecting => PeerState::Connecting,
                RTCPeerConnectionState::Connected => PeerState::Connected,
                RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                RTCPeerConnectionState::Failed => PeerState::Failed,
                RTCPeerConnectionState::Closed => PeerState::Closed,
                _ => return,
            };
            info!(peer = %shared.peer_id, %state, "connection state changed");

            shared
                .connected
                .store(state == PeerState::Connected, Ordering::SeqCst);
            if matches!(state, PeerState::Closed | PeerState::Failed) {
                shared.closed.store(true, Ordering::SeqCst);
            }
            *shared.state.lock().unwrap() = state;
        })
    }));

    let cand_shared = Arc::clone(&shared);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let shared = Arc::clone(&cand_shared);
        let out = signaling_out.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    warn!(peer = %shared.peer_id, error = %e, "failed to serialize ICE candidate");
                    return;
                }
            };
            debug!(peer = %shared.peer_id, candidate = %init.candidate, "local ICE candidate");
            let msg = OutboundMessage::Candidate {
                data: CandidatePayload {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid.unwrap_or_else(|| "0".to_string()),
                },
            };
            out.send(msg).await.ok();
        })
    }));
}

/// Consume queued access units, gate on a fresh keyframe, packetize and
/// write RTP through the track.
async fn run_writer(
    mut nal_rx: mpsc::Receiver<(Bytes, u64)>,
    track: Arc<TrackLocalStaticRTP>,
    shared: Arc<SessionShared>,
) {
    let mut payloader = H264Payloader::default();
    let mut sequence: u16 = 0;

    while let Some((data, pts_us)) = nal_rx.recv().await {
        if !shared.connected.load(Ordering::SeqCst) {
            continue;
        }

        if shared.needs_keyframe.load(Ordering::SeqCst) {
            if h264::contains_keyframe(&data) {
                shared.needs_keyframe.store(false, Ordering::SeqCst);
                shared.keyframe_sent.store(true, Ordering::SeqCst);
                debug!(peer = %shared.peer_id, "keyframe accepted, stream resumed");
            } else if !h264::contains_parameter_sets(&data) {
                // waiting for an IDR; parameter-set units still go through
                // so the decoder can start the moment the IDR arrives
                shared.nals_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        let timestamp = rtp_timestamp(pts_us);
        let payloads = match payloader.payload(RTP_MTU - 12, &data) {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %shared.peer_id, error = %e, "H.264 packetization failed");
                continue;
            }
        };

        let count = payloads.len();
        let mut write_failed = false;
        for (i, payload) in payloads.into_iter().enumerate() {
            let packet = webrtc::rtp::packet::Packet {
                header: webrtc::rtp::header::Header {
                    version: 2,
                    payload_type: shared.payload_type,
                    sequence_number: sequence,
                    timestamp,
                    ssrc: shared.ssrc,
                    marker: i + 1 == count,
                    ..Default::default()
                },
                payload,
            };
            sequence = sequence.wrapping_add(1);

            if let Err(e) = track.write_rtp(&packet).await {
                let errors = shared.send_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if errors <= 5 || errors % 100 == 0 {
                    warn!(peer = %shared.peer_id, error = %e, errors, "RTP write failed");
                }
                write_failed = true;
                break;
            }
            shared.rtp_packets_sent.fetch_add(1, Ordering::Relaxed);
        }

        if !write_failed {
            shared.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
    }
    debug!(peer = %shared.peer_id, "writer task ended");
}

/// Insert a `b=AS:<kbps>` bandwidth hint into the video section of an SDP,
/// after the media-level i=/c= lines per RFC 4566 ordering. An SDP without
/// a video section is returned unchanged.
pub fn insert_bandwidth_line(sdp: &str, bitrate_kbps: i32) -> String {
    let lines: Vec<&str> = sdp.lines().collect();
    let mut insert_at = None;
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("m=video") {
            let mut pos = i + 1;
            while pos < lines.len()
                && (lines[pos].starts_with("i=") || lines[pos].starts_with("c="))
            {
                pos += 1;
            }
            insert_at = Some(pos);
            break;
        }
    }

    let mut out: Vec<String> = lines.into_iter().map(str::to_string).collect();
    if let Some(pos) = insert_at {
        out.insert(pos, format!("b=AS:{}", bitrate_kbps));
    }
    let mut joined = out.join("\r\n");
    joined.push_str("\r\n");
    joined
}
