//! RTSP ingest pipeline
//!
//! Builds and supervises a GStreamer graph that turns the camera's RTSP
//! stream into access-unit-aligned Annex-B H.264 buffers. Three graph
//! shapes exist, chosen once at construction:
//!
//! - test pattern (no RTSP URL, `test-source` feature): synthetic 720p ball
//! - passthrough: depay + parse only, no decode or encode
//! - re-encode: decode + encode with live bitrate control
//!
//! A dedicated supervisor thread owns the graph and rebuilds it after any
//! fault (build error, bus error, end of stream), sleeping
//! `reconnect_interval_ms` between attempts. Buffers are handed to a single
//! installed sink callback together with their presentation timestamp in
//! microseconds.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;

/// Consumer for access-unit-aligned Annex-B buffers with µs timestamps.
pub type NalSink = Arc<dyn Fn(Bytes, u64) + Send + Sync>;

/// Bus poll timeout; bounds how quickly the supervisor notices a stop request.
const BUS_POLL_MS: u64 = 500;
/// Sleep slice during reconnect backoff.
const BACKOFF_SLICE_MS: u64 = 100;

/// Graph shape, fixed at construction from config and build features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Synthetic test pattern, encoded to H.264 baseline
    TestPattern,
    /// Relay the source H.264 untouched
    Passthrough,
    /// Decode and re-encode with dynamic bitrate control
    Reencode { hw: bool },
}

impl PipelineMode {
    /// Pick the mode for this configuration and build.
    pub fn select(config: &AppConfig) -> Self {
        if config.rtsp.url.is_empty() && cfg!(feature = "test-source") {
            PipelineMode::TestPattern
        } else if config.encoding.passthrough {
            PipelineMode::Passthrough
        } else {
            PipelineMode::Reencode {
                hw: cfg!(feature = "jetson") && config.encoding.hw_encode,
            }
        }
    }

    /// Whether `set_bitrate` can reach a live encoder in this mode.
    pub fn has_encoder(&self) -> bool {
        matches!(self, PipelineMode::Reencode { .. })
    }
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub reconnect_count: u32,
    pub connected: bool,
}

#[derive(Default)]
struct SharedStats {
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    reconnect_count: AtomicU32,
    connected: AtomicBool,
}

impl SharedStats {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
        }
    }
}

/// Supervised RTSP to H.264 ingest pipeline.
pub struct MediaPipeline {
    config: AppConfig,
    mode: PipelineMode,
    sink: Mutex<Option<NalSink>>,
    stop_requested: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    encoder: Arc<Mutex<Option<gst::Element>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MediaPipeline {
    /// Construct the pipeline. No I/O happens until `start`.
    pub fn new(config: AppConfig) -> Result<Self> {
        gst::init().context("failed to initialize GStreamer")?;
        let mode = PipelineMode::select(&config);
        info!("media pipeline mode: {:?}", mode);
        Ok(Self {
            config,
            mode,
            sink: Mutex::new(None),
            stop_requested: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SharedStats::default()),
            encoder: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    /// Install the single NAL consumer. Must be called before `start`.
    pub fn set_nal_sink(&self, sink: NalSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    /// Spawn the supervisor thread. Idempotent while the worker is alive.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                warn!("pipeline already running");
                return Ok(());
            }
        }

        let sink = self
            .sink
            .lock()
            .unwrap()
            .clone()
            .context("NAL sink must be installed before start()")?;

        self.stop_requested.store(false, Ordering::SeqCst);
        let ctx = SupervisorContext {
            config: self.config.clone(),
            mode: self.mode,
            sink,
            stop: Arc::clone(&self.stop_requested),
            running: Arc::clone(&self.running),
            stats: Arc::clone(&self.stats),
            encoder: Arc::clone(&self.encoder),
        };

        let handle = thread::Builder::new()
            .name("media-pipeline".to_string())
            .spawn(move || supervise(ctx))
            .context("failed to spawn pipeline supervisor")?;
        *worker = Some(handle);
        Ok(())
    }

    /// Request shutdown and join the supervisor. Idempotent.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("pipeline supervisor panicked");
            }
        }
    }

    /// Apply a new encoder target bitrate, clamped to the configured range.
    ///
    /// Passthrough and test modes have no encoder to steer, and a pipeline
    /// that is not running has nothing to apply to; both are logged no-ops.
    pub fn set_bitrate(&self, kbps: i32) {
        let video = &self.config.webrtc.video;
        let clamped = clamp_bitrate(kbps, video.min_bitrate_kbps, video.max_bitrate_kbps);
        if clamped != kbps {
            debug!("bitrate request {} kbps clamped to {} kbps", kbps, clamped);
        }

        let hw = match self.mode {
            PipelineMode::Reencode { hw } => hw,
            _ => {
                info!(
                    "bitrate hint {} kbps ignored ({:?} mode has no encoder)",
                    clamped, self.mode
                );
                return;
            }
        };

        if !self.is_running() {
            debug!("pipeline not running, bitrate {} kbps not applied", clamped);
            return;
        }

        match self.encoder.lock().unwrap().as_ref() {
            Some(enc) => {
                if hw {
                    // nvv4l2h264enc takes bits per second
                    enc.set_property("bitrate", (clamped as u32).saturating_mul(1000));
                } else {
                    // x264enc takes kbps
                    enc.set_property("bitrate", clamped as u32);
                }
                info!("encoder bitrate adjusted to {} kbps", clamped);
            }
            None => debug!("no encoder element in current graph, bitrate not applied"),
        }
    }

    /// True while the graph is in the PLAYING state.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once the supervisor thread has exited (or never started).
    pub fn is_stopped(&self) -> bool {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    pub fn get_stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Clamp a bitrate request to the configured `[min, max]` range.
pub fn clamp_bitrate(kbps: i32, min_kbps: i32, max_kbps: i32) -> i32 {
    kbps.max(min_kbps).min(max_kbps)
}

struct SupervisorContext {
    config: AppConfig,
    mode: PipelineMode,
    sink: NalSink,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    encoder: Arc<Mutex<Option<gst::Element>>>,
}

/// Build, play, and rebuild the graph until stop is requested.
fn supervise(ctx: SupervisorContext) {
    info!("pipeline supervisor started");
    let mut faults: u32 = 0;

    while !ctx.stop.load(Ordering::SeqCst) {
        match run_once(&ctx) {
            // run_once returns Ok only when stop was requested mid-play
            Ok(()) => break,
            Err(e) => warn!("pipeline fault: {:#}", e),
        }

        if ctx.stop.load(Ordering::SeqCst) {
            break;
        }

        ctx.stats.reconnect_count.fetch_add(1, Ordering::Relaxed);
        faults += 1;
        let max = ctx.config.rtsp.reconnect_max_attempts;
        if max > 0 && faults >= max {
            error!("giving up after {} pipeline faults", faults);
            break;
        }
        backoff(&ctx.stop, ctx.config.rtsp.reconnect_interval_ms);
    }

    ctx.running.store(false, Ordering::SeqCst);
    ctx.stats.connected.store(false, Ordering::Relaxed);
    info!("pipeline supervisor stopped");
}

/// One Building -> Playing cycle. Errors indicate a fault to recover from.
fn run_once(ctx: &SupervisorContext) -> Result<()> {
    let desc = launch_description(ctx.mode, &ctx.config);
    debug!("building graph: {}", desc);

    let pipeline = gst::parse::launch(&desc)
        .context("failed to build media graph")?
        .downcast::<gst::Pipeline>()
        .map_err(|_| anyhow!("launch description did not produce a pipeline"))?;

    let appsink = pipeline
        .by_name("sink")
        .context("appsink element missing from graph")?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| anyhow!("element named \"sink\" is not an appsink"))?;

    install_sample_callback(&appsink, ctx.sink.clone(), Arc::clone(&ctx.stats));

    let encoder = pipeline.by_name("enc");
    if encoder.is_some() {
        info!("encoder element found, dynamic bitrate control enabled");
    }
    *ctx.encoder.lock().unwrap() = encoder;

    let bus = pipeline.bus().context("pipeline has no bus")?;
    let result = run_playing(ctx, &pipeline, &bus);

    ctx.running.store(false, Ordering::SeqCst);
    ctx.stats.connected.store(false, Ordering::Relaxed);
    *ctx.encoder.lock().unwrap() = None;
    let _ = pipeline.set_state(gst::State::Null);

    result
}

fn run_playing(ctx: &SupervisorContext, pipeline: &gst::Pipeline, bus: &gst::Bus) -> Result<()> {
    pipeline
        .set_state(gst::State::Playing)
        .context("failed to set pipeline to PLAYING")?;
    ctx.running.store(true, Ordering::SeqCst);
    ctx.stats.connected.store(true, Ordering::Relaxed);
    info!("pipeline is PLAYING");

    loop {
        if ctx.stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(BUS_POLL_MS)) else {
            continue;
        };
        match msg.view() {
            gst::MessageView::Error(err) => {
                bail!(
                    "bus error from {:?}: {} ({:?})",
                    err.src().map(|s| s.path_string()),
                    err.error(),
                    err.debug()
                );
            }
            gst::MessageView::Eos(..) => bail!("end of stream"),
            gst::MessageView::Warning(w) => {
                warn!("bus warning: {} ({:?})", w.error(), w.debug());
            }
            gst::MessageView::StateChanged(sc) => {
                debug!("state change: {:?} -> {:?}", sc.old(), sc.current());
            }
            _ => {}
        }
    }
}

fn install_sample_callback(appsink: &gst_app::AppSink, sink: NalSink, stats: Arc<SharedStats>) {
    let last_ts = Arc::new(AtomicU64::new(0));
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |appsink| {
                let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let Some(buffer) = sample.buffer() else {
                    return Ok(gst::FlowSuccess::Ok);
                };
                let Ok(map) = buffer.map_readable() else {
                    return Ok(gst::FlowSuccess::Ok);
                };
                let data = map.as_slice();
                if data.is_empty() {
                    return Ok(gst::FlowSuccess::Ok);
                }

                let candidate = buffer
                    .pts()
                    .map(|t| t.useconds())
                    .unwrap_or_else(monotonic_us);
                let pts_us = ascending(&last_ts, candidate);

                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                stats.connected.store(true, Ordering::Relaxed);

                (sink)(Bytes::copy_from_slice(data), pts_us);
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
}

/// Sleep `interval_ms` in small slices so a stop request is noticed quickly.
fn backoff(stop: &AtomicBool, interval_ms: u32) {
    info!("reconnecting in {} ms", interval_ms);
    let mut elapsed: u64 = 0;
    while elapsed < interval_ms as u64 && !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(BACKOFF_SLICE_MS));
        elapsed += BACKOFF_SLICE_MS;
    }
}

/// Steady-clock microseconds, used when the source provides no PTS.
fn monotonic_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Force timestamps to be non-decreasing.
fn ascending(last: &AtomicU64, candidate: u64) -> u64 {
    let prev = last.fetch_max(candidate, Ordering::Relaxed);
    candidate.max(prev)
}

/// Produce the gst-launch description for a mode. Mirrors the graphs the
/// gateway has always run; kept as a pure function so the shapes are
/// testable without GStreamer initialized.
pub fn launch_description(mode: PipelineMode, config: &AppConfig) -> String {
    let video = &config.webrtc.video;
    let enc = &config.encoding;

    const APPSINK: &str =
        "appsink name=sink emit-signals=true sync=false max-buffers=5 drop=true";

    match mode {
        PipelineMode::TestPattern => {
            let mut desc = String::from(
                "videotestsrc is-live=true pattern=ball ! \
                 video/x-raw,width=1280,height=720,framerate=30/1 ! ",
            );
            if cfg!(feature = "jetson") && enc.hw_encode {
                desc.push_str(&format!(
                    "nvvidconv ! video/x-raw(memory:NVMM),format=NV12 ! \
                     nvv4l2h264enc bitrate={} maxperf-enable=1 preset-level=1 \
                     insert-sps-pps={} idrinterval={} ! ",
                    video.bitrate_kbps * 1000,
                    enc.insert_sps_pps as u8,
                    enc.idr_interval,
                ));
            } else {
                desc.push_str(&format!(
                    "x264enc tune=zerolatency speed-preset=ultrafast bitrate={} \
                     key-int-max={} bframes=0 ! ",
                    video.bitrate_kbps, enc.idr_interval,
                ));
            }
            desc.push_str("video/x-h264,profile=baseline ! h264parse config-interval=1 ! ");
            desc.push_str(APPSINK);
            desc
        }
        PipelineMode::Passthrough => format!(
            "rtspsrc location={} latency={} protocols={} is-live=true \
             buffer-mode=auto do-retransmission=false drop-on-latency=true ! \
             rtph264depay ! h264parse config-interval=1 ! \
             video/x-h264,stream-format=byte-stream,alignment=au ! {}",
            config.rtsp.url, config.rtsp.latency_ms, config.rtsp.transport, APPSINK,
        ),
        PipelineMode::Reencode { hw } => {
            let mut desc = format!(
                "rtspsrc location={} latency={} protocols={} is-live=true \
                 buffer-mode=auto do-retransmission=false drop-on-latency=true ! \
                 rtph264depay ! h264parse config-interval=-1 ! \
                 video/x-h264,stream-format=byte-stream,alignment=au ! ",
                config.rtsp.url, config.rtsp.latency_ms, config.rtsp.transport,
            );
            if hw {
                desc.push_str(&format!(
                    "nvv4l2decoder enable-max-performance=1 ! \
                     nvv4l2h264enc name=enc bitrate={} peak-bitrate={} \
                     maxperf-enable=1 preset-level=1 control-rate=1 \
                     insert-sps-pps={} idrinterval={} ! ",
                    video.bitrate_kbps * 1000,
                    video.max_bitrate_kbps * 1000,
                    enc.insert_sps_pps as u8,
                    enc.idr_interval,
                ));
            } else {
                desc.push_str(&format!(
                    "avdec_h264 ! videoconvert ! \
                     x264enc name=enc tune=zerolatency speed-preset=ultrafast bitrate={} \
                     vbv-buf-capacity={} key-int-max={} bframes=0 ! ",
                    video.bitrate_kbps, video.max_bitrate_kbps, enc.idr_interval,
                ));
            }
            desc.push_str(
                "video/x-h264,stream-format=byte-stream,alignment=au ! \
                 h264parse config-interval=1 ! ",
            );
            desc.push_str(APPSINK);
            desc
        }
    }
}
