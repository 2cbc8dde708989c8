//! Gateway configuration
//!
//! Loaded from a YAML file, with environment variable overrides applied on
//! top (the same set the Docker/systemd units export). Every field has a
//! default so a partial file is fine; a missing or malformed file is a
//! fatal startup error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Listener settings for the signaling and viewer endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket signaling port
    pub signaling_port: u16,
    /// Static HTTP viewer port
    pub http_port: u16,
    /// Directory served by the HTTP viewer
    pub web_root: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            signaling_port: 8080,
            http_port: 8081,
            web_root: "./web".to_string(),
        }
    }
}

/// RTSP source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    /// Camera URL; empty selects the test pattern when built with `test-source`
    pub url: String,
    /// RTP transport, `tcp` or `udp`
    pub transport: String,
    /// Jitter buffer latency in milliseconds
    pub latency_ms: u32,
    /// Delay between reconnect attempts
    pub reconnect_interval_ms: u32,
    /// Give up after this many faults (0 = retry forever)
    pub reconnect_max_attempts: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            transport: "tcp".to_string(),
            latency_ms: 0,
            reconnect_interval_ms: 3000,
            reconnect_max_attempts: 0,
        }
    }
}

/// Video track parameters advertised to viewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub codec: String,
    pub clock_rate: u32,
    pub payload_type: u8,
    pub bitrate_kbps: i32,
    pub max_bitrate_kbps: i32,
    pub min_bitrate_kbps: i32,
    pub fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: "H264".to_string(),
            clock_rate: 90_000,
            payload_type: 96,
            bitrate_kbps: 4000,
            max_bitrate_kbps: 8000,
            min_bitrate_kbps: 500,
            fps: 30,
        }
    }
}

/// WebRTC peer settings: ICE servers and admission cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub stun_server: String,
    pub turn_server: String,
    pub turn_username: String,
    pub turn_credential: String,
    /// Admission cap; connections beyond this are refused
    pub max_peers: usize,
    pub video: VideoConfig,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_server: "stun:stun.cloudflare.com:3478".to_string(),
            turn_server: String::new(),
            turn_username: String::new(),
            turn_credential: String::new(),
            max_peers: 4,
            video: VideoConfig::default(),
        }
    }
}

/// Encoder selection and keyframe cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Use the hardware encoder (only meaningful with the `jetson` feature)
    pub hw_encode: bool,
    /// Relay the source H.264 without re-encoding
    pub passthrough: bool,
    /// IDR interval in frames
    pub idr_interval: u32,
    /// Repeat SPS/PPS with each IDR
    pub insert_sps_pps: bool,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            hw_encode: false,
            passthrough: true,
            idr_interval: 30,
            insert_sps_pps: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// Optional log file path (empty = stderr only)
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub rtsp: RtspConfig,
    pub webrtc: WebRtcConfig,
    pub encoding: EncodingConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut cfg: AppConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Apply the documented environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        env_string("RTSP_URL", &mut self.rtsp.url);
        env_parse("SIGNALING_PORT", &mut self.server.signaling_port);
        env_string("STUN_SERVER", &mut self.webrtc.stun_server);
        env_string("TURN_SERVER", &mut self.webrtc.turn_server);
        env_string("TURN_USERNAME", &mut self.webrtc.turn_username);
        env_string("TURN_CREDENTIAL", &mut self.webrtc.turn_credential);
        env_parse("VIDEO_BITRATE_KBPS", &mut self.webrtc.video.bitrate_kbps);
        env_parse("VIDEO_MAX_BITRATE_KBPS", &mut self.webrtc.video.max_bitrate_kbps);
        env_string("LOG_LEVEL", &mut self.logging.level);
    }
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        *target = value;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = std::env::var(name) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("ignoring unparseable {}={:?}", name, value),
        }
    }
}
