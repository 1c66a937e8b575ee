//! Synchronized always-on internet radio server.
//!
//! A curated directory of Ogg Opus files plays as one wall-clock timeline
//! that every listener receives in lock-step over three transports:
//! WebRTC (WHEP), HLS (fMP4/AAC), and an Icecast-style MP3 stream. The
//! playlist driver is the single producer; encoder subprocesses and the
//! shared audio track all hang off its tee'd byte stream.
//!
//! This crate is the **public gateway** for the engine. Integrations and
//! the binary import through the re-exports below rather than drilling
//! into module structure.

pub mod audio;
pub mod broadcast;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod hls;
pub mod http;
pub mod icecast;
pub mod pipe;
pub mod playlist;
pub mod status;
pub mod transcoder;
pub mod viewers;
pub mod watchdog;
pub mod webrtc;

pub use audio::{Cursor, CursorSnapshot, OggOpusPacketReader, OpusPacket, Tee};
pub use broadcast::Broadcaster;
pub use catalog::{load_catalog, TrackMeta};
pub use config::Config;
pub use engine::Engine;
pub use playlist::{PlaylistDriver, ResumePolicy};
pub use status::StreamStatus;
pub use viewers::{Protocol, ViewerTracker};
