//! streamgate - RTSP to WebRTC streaming gateway
//!
//! Ingests a single live H.264 RTSP source, optionally re-encodes it with
//! dynamic bitrate control, and fans it out over WebRTC to a bounded set
//! of browser viewers. Built for a robot camera: the robot publishes
//! RTSP, operators watch in a browser over STUN/TURN.
//!
//! - [`pipeline`]: supervised GStreamer graph, RTSP to Annex-B H.264
//! - [`peer`]: one WebRTC session per viewer, RTP packetization
//! - [`registry`]: bounded peer set, broadcast, reaping
//! - [`signaling`]: WebSocket offer/answer/ICE bridge with bitrate hints
//! - [`config`], [`protocol`], [`h264`], [`web`]: supporting pieces

pub mod config;
pub mod h264;
pub mod peer;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod signaling;
pub mod web;
