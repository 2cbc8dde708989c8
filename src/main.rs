//! streamgate binary
//!
//! Wires the media pipeline, peer registry, and signaling endpoint
//! together, hosts the static viewer page, logs a health line every ten
//! seconds, and shuts everything down in order on SIGINT/SIGTERM.
//!
//! ## Usage
//!
//! ```bash
//! streamgate --config config.yaml
//!
//! # Docker / systemd style
//! RTSP_URL=rtsp://camera.local/stream SIGNALING_PORT=8080 streamgate
//! ```

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use streamgate::config::AppConfig;
use streamgate::pipeline::MediaPipeline;
use streamgate::registry::PeerRegistry;
use streamgate::signaling::SignalingEndpoint;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

fn print_help() {
    println!(
        "Usage: streamgate [options]\n\
         Options:\n\
         \x20 -c, --config <path>    Config file (default: config.yaml)\n\
         \x20 -h, --help             Show this help\n\
         \n\
         Environment variables:\n\
         \x20 RTSP_URL               RTSP camera URL\n\
         \x20 SIGNALING_PORT         WebSocket signaling port\n\
         \x20 STUN_SERVER            STUN server URL\n\
         \x20 TURN_SERVER            TURN server URL\n\
         \x20 TURN_USERNAME          TURN username\n\
         \x20 TURN_CREDENTIAL        TURN credential\n\
         \x20 VIDEO_BITRATE_KBPS     Video bitrate in kbps\n\
         \x20 VIDEO_MAX_BITRATE_KBPS Max video bitrate in kbps\n\
         \x20 LOG_LEVEL              Log level (trace/debug/info/warn/error)"
    );
}

/// Minimal argument scan: just the config path and help.
fn parse_args() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "config.yaml".to_string();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" if i + 1 < args.len() => {
                i += 1;
                config_path = args[i].clone();
            }
            "-h" | "--help" => {
                print_help();
                return None;
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                return None;
            }
        }
        i += 1;
    }
    Some(config_path)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("streamgate={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_banner(cfg: &AppConfig) {
    info!("streamgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Signaling port  : {}", cfg.server.signaling_port);
    info!(
        "  RTSP URL        : {}",
        if cfg.rtsp.url.is_empty() {
            "(test mode)"
        } else {
            &cfg.rtsp.url
        }
    );
    info!("  Transport       : {}", cfg.rtsp.transport);
    info!("  Codec           : {}", cfg.webrtc.video.codec);
    info!(
        "  Bitrate         : {} kbps (max: {} kbps)",
        cfg.webrtc.video.bitrate_kbps, cfg.webrtc.video.max_bitrate_kbps
    );
    info!("  Max peers       : {}", cfg.webrtc.max_peers);
    info!("  STUN            : {}", cfg.webrtc.stun_server);
    info!(
        "  TURN            : {}",
        if cfg.webrtc.turn_server.is_empty() {
            "(disabled)"
        } else {
            &cfg.webrtc.turn_server
        }
    );
    info!(
        "  HW encode       : {}",
        if cfg.encoding.hw_encode { "yes" } else { "no (software)" }
    );
    info!(
        "  Passthrough     : {}",
        if cfg.encoding.passthrough { "yes" } else { "no" }
    );
    info!("  HTTP port       : {}", cfg.server.http_port);
    info!("  Web root        : {}", cfg.server.web_root);
}

fn log_health(pipeline: &MediaPipeline, registry: &PeerRegistry) {
    let p = pipeline.get_stats();
    let r = registry.get_stats();
    info!(
        "health: pipeline {} | frames {} | {:.1} MB in | reconnects {} || peers {}/{} connected | {:.1} MB out",
        if p.connected { "CONNECTED" } else { "DISCONNECTED" },
        p.frames_received,
        p.bytes_received as f64 / (1024.0 * 1024.0),
        p.reconnect_count,
        r.connected_peers,
        r.total_peers,
        r.total_bytes_sent as f64 / (1024.0 * 1024.0),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let Some(config_path) = parse_args() else {
        return Ok(());
    };

    let config = AppConfig::load(&config_path)?;
    init_logging(&config.logging.level);
    log_banner(&config);

    // Components, leaves first
    let registry = Arc::new(PeerRegistry::new(config.webrtc.clone()));
    let pipeline = Arc::new(MediaPipeline::new(config.clone())?);
    let signaling = Arc::new(SignalingEndpoint::new(&config, Arc::clone(&registry)));

    // RTSP -> peers
    {
        let registry = Arc::clone(&registry);
        pipeline.set_nal_sink(Arc::new(move |data, pts_us| {
            registry.broadcast_nal(&data, pts_us);
        }));
    }

    // Viewer bitrate hints -> encoder
    {
        let pipeline = Arc::clone(&pipeline);
        signaling.set_bitrate_callback(Arc::new(move |kbps| {
            pipeline.set_bitrate(kbps);
        }));
    }

    registry.start();
    signaling
        .start()
        .await
        .context("failed to start signaling server")?;
    pipeline.start().context("failed to start media pipeline")?;

    // Static viewer page; losing it is not fatal
    let web_shutdown = CancellationToken::new();
    {
        let bind: SocketAddr = ([0, 0, 0, 0], config.server.http_port).into();
        let web_root = std::path::PathBuf::from(&config.server.web_root);
        let shutdown = web_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = streamgate::web::serve(bind, web_root, shutdown).await {
                warn!("web viewer unavailable: {:#}", e);
            }
        });
    }

    info!("all systems operational");
    info!(
        "  WebSocket signaling : ws://0.0.0.0:{}",
        config.server.signaling_port
    );
    info!(
        "  Web viewer          : http://0.0.0.0:{}/",
        config.server.http_port
    );

    // Health loop until SIGINT/SIGTERM
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    stats_tick.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = stats_tick.tick() => {
                log_health(&pipeline, &registry);
                // The supervisor restarts the graph itself; only a dead
                // supervisor thread warrants a restart from here.
                if pipeline.is_stopped() {
                    warn!("pipeline supervisor exited, restarting");
                    pipeline.stop();
                    if let Err(e) = pipeline.start() {
                        warn!("pipeline restart failed: {:#}", e);
                    }
                }
            }
        }
    }

    // Ordered shutdown: media first so no NAL broadcast outlives the peers
    pipeline.stop();
    web_shutdown.cancel();
    signaling.stop().await;
    registry.stop().await;
    info!("shutdown complete");

    Ok(())
}
