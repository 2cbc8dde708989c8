//! Signaling wire protocol
//!
//! Text JSON messages exchanged with the browser viewer over the signaling
//! WebSocket, one message per frame. The server always initiates the offer;
//! the browser answers and trickles ICE candidates back.

use serde::{Deserialize, Serialize};

use crate::config::WebRtcConfig;

/// One entry of the `iceServers` list in the welcome message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerEntry {
    pub urls: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Build the ICE server list advertised to a viewer. The TURN entry is
/// present only when configured with credentials.
pub fn ice_servers(cfg: &WebRtcConfig) -> Vec<IceServerEntry> {
    let mut servers = Vec::new();
    if !cfg.stun_server.is_empty() {
        servers.push(IceServerEntry {
            urls: cfg.stun_server.clone(),
            username: None,
            credential: None,
        });
    }
    if !cfg.turn_server.is_empty() {
        servers.push(IceServerEntry {
            urls: cfg.turn_server.clone(),
            username: Some(cfg.turn_username.clone()),
            credential: Some(cfg.turn_credential.clone()),
        });
    }
    servers
}

/// ICE candidate payload, shared by both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default = "default_mid")]
    pub sdp_mid: String,
}

fn default_mid() -> String {
    "0".to_string()
}

/// Server → browser messages.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServerEntry>,
    },
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        data: CandidatePayload,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Browser → server messages. Anything unrecognized parses to `Unknown`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Answer {
        #[serde(default)]
        sdp: String,
    },
    Candidate {
        data: CandidatePayload,
    },
    Ping,
    Bitrate {
        kbps: i32,
    },
    #[serde(other)]
    Unknown,
}
