//! The broadcast engine: one object owning the station's shared state.
//!
//! Everything single-instance — cursor, audio track, tee, transcoders,
//! viewer tracker, metrics — hangs off an `Engine` built once at startup
//! and passed by `Arc` into the HTTP layer and background tasks. There are
//! no ambient globals.

use std::sync::Arc;
use std::time::Duration;

use ::webrtc::api::API;
use anyhow::{Context, Result};
use tracing::info;

use crate::audio::{Cursor, Tee};
use crate::catalog::{self, TrackMeta};
use crate::config::Config;
use crate::hls::{HlsConfig, HlsStreamer};
use crate::icecast::{IcecastConfig, IcecastStreamer};
use crate::playlist::{DriverContext, PlaylistDriver, ResumePolicy};
use crate::viewers::ViewerTracker;
use crate::watchdog;
use crate::webrtc::{build_api, SampleWriter, StreamState};
use opuscast_common::MetricsContext;

const GAUGE_SAMPLE_EVERY: Duration = Duration::from_secs(10);

pub struct Engine {
    // ---
    pub config: Config,
    pub metrics: Arc<MetricsContext>,

    pub cursor: Arc<Cursor>,
    pub tee: Tee,
    pub catalog: Arc<Vec<TrackMeta>>,

    pub stream: Arc<StreamState>,
    pub api: API,
    pub sample_writer: Arc<SampleWriter>,

    pub playlist: PlaylistDriver,
    pub hls: Arc<HlsStreamer>,
    pub icecast: Arc<IcecastStreamer>,
    pub viewers: ViewerTracker,
}

impl Engine {
    // ---
    /// Wires up the whole broadcast pipeline. Failures here are
    /// fatal-at-start by design: no encoder binary, unreadable or empty
    /// media directory, unbindable mux port.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let metrics = Arc::new(MetricsContext::new("server").context("init metrics")?);

        let catalog = Arc::new(catalog::load_catalog(&config.media_dir)?);
        info!(
            "Loaded {} track(s) from {}",
            catalog.len(),
            config.media_dir.display()
        );

        let cursor = Arc::new(Cursor::new());
        let tee = Tee::new();
        let stream = StreamState::new();
        let api = build_api(&config).await?;
        let sample_writer = SampleWriter::start(Arc::clone(&stream.audio_track));

        let icecast = IcecastStreamer::start(IcecastConfig {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            station_name: config.station_name.clone(),
            stream_path: "/api/icecast.mp3".to_string(),
            cursor: Arc::clone(&cursor),
            metrics: Arc::clone(&metrics),
        })?;
        tee.attach("icecast", icecast.audio_sink());

        let hls = HlsStreamer::start(HlsConfig {
            output_dir: config.hls_output_dir.clone(),
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            segment_cache_control: config.hls_segment_cache_control.clone(),
            ffmpeg_loglevel: config.ffmpeg_loglevel_hls.clone(),
            cursor: Arc::clone(&cursor),
            metrics: Arc::clone(&metrics),
        })?;
        tee.attach("hls", hls.audio_sink());

        let viewers = ViewerTracker::new(
            config.viewer_ttl_hls,
            config.viewer_ttl_icecast,
            &config.viewer_hash_salt,
        );

        let playlist = PlaylistDriver::new(DriverContext {
            cursor: Arc::clone(&cursor),
            sample_writer: Arc::clone(&sample_writer),
            tee: tee.clone(),
            stream: Arc::clone(&stream),
            metrics: Arc::clone(&metrics),
            catalog: Arc::clone(&catalog),
            resume: ResumePolicy::from_config(config.random_timestamp, config.resume_timestamp),
        });

        Ok(Arc::new(Self {
            config,
            metrics,
            cursor,
            tee,
            catalog,
            stream,
            api,
            sample_writer,
            playlist,
            hls,
            icecast,
            viewers,
        }))
    }

    /// Kicks off playback and the background observers.
    pub fn start(engine: &Arc<Engine>) -> Result<()> {
        engine.playlist.start()?;
        watchdog::spawn(Arc::clone(engine), engine.config.cursor_stall_timeout);
        Self::spawn_gauge_sampler(engine);
        Ok(())
    }

    /// Restart path used by the watchdog: a fresh playlist driver plus
    /// both encoder subprocesses.
    pub fn restart_pipeline(&self) {
        if let Err(e) = self.playlist.restart() {
            tracing::error!("playlist restart failed: {e:#}");
        }
        self.hls.restart();
        self.icecast.restart();
    }

    /// Winds down the encoder subprocesses and listener channels.
    pub fn shutdown(&self) {
        self.sample_writer.close();
        self.hls.close();
        self.icecast.close();
    }

    /// Periodically mirrors component counters into Prometheus gauges.
    fn spawn_gauge_sampler(engine: &Arc<Engine>) {
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GAUGE_SAMPLE_EVERY);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let m = &engine.metrics;
                m.cursor_position_seconds
                    .set(engine.cursor.position().as_secs() as i64);
                m.hls_dropped_writes.set(engine.hls.drop_count() as i64);
                m.icecast_dropped_writes
                    .set(engine.icecast.drop_count() as i64);
                m.webrtc_dropped_samples
                    .set(engine.sample_writer.drop_count() as i64);
                m.whep_sessions.set(engine.stream.session_count() as i64);

                let counts = engine.viewers.counts();
                m.hls_viewers.set(counts.hls as i64);
                m.icecast_viewers.set(counts.icecast as i64);
            }
        });
    }
}
