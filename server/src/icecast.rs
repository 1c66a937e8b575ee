//! Icecast-style MP3 transport.
//!
//! An ffmpeg child consumes the live Ogg Opus stream on stdin and emits
//! MP3 on stdout; a pump task feeds those bytes into the [`Broadcaster`]
//! that the HTTP listeners drain. The supervisor restarts the encoder on
//! crash and the pipe sink re-primes it with the cached header pages.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audio::{ByteSink, Cursor};
use crate::broadcast::Broadcaster;
use crate::pipe::PipeSink;
use crate::transcoder::{
    find_encoder_binary, run_supervisor, spawn_stderr_logger, Spawned, StdinSlot,
};
use opuscast_common::MetricsContext;

pub const MP3_BITRATE_KBPS: u32 = 128;
pub const MP3_CHANNELS: u32 = 2;
pub const MP3_SAMPLE_RATE: u32 = 48_000;

const STDOUT_CHUNK_BYTES: usize = 32 * 1024;

pub struct IcecastConfig {
    pub ffmpeg_bin: String,
    pub station_name: String,
    pub stream_path: String,
    pub cursor: Arc<Cursor>,
    pub metrics: Arc<MetricsContext>,
}

/// The MP3 side of the station: encoder subprocess + listener fan-out.
pub struct IcecastStreamer {
    // ---
    station_name: String,
    stream_path: String,

    sink: Arc<PipeSink>,
    output: Arc<Broadcaster>,
    restart: Arc<Notify>,
    shutdown: CancellationToken,
}

impl IcecastStreamer {
    // ---
    /// Spawns ffmpeg and the supervision machinery. Fails only when the
    /// encoder binary cannot be found or the first spawn fails.
    pub fn start(cfg: IcecastConfig) -> Result<Arc<Self>> {
        let ffmpeg = find_encoder_binary(&cfg.ffmpeg_bin)
            .context("ffmpeg is required for the icecast/mp3 transport")?;

        let station_name = non_empty(cfg.station_name, "Opuscast");
        let stream_path = non_empty(cfg.stream_path, "/api/icecast.mp3");

        let shutdown = CancellationToken::new();
        let output = Arc::new(Broadcaster::new());
        let slot = StdinSlot::new();
        let sink = PipeSink::start("icecast", Arc::clone(&slot), shutdown.clone());
        let restart = Arc::new(Notify::new());

        let first = spawn_mp3_encoder(&ffmpeg, Arc::clone(&output), shutdown.clone())?;

        {
            let pump_output = Arc::clone(&output);
            let pump_shutdown = shutdown.clone();
            let spawner = move || {
                spawn_mp3_encoder(&ffmpeg, Arc::clone(&pump_output), pump_shutdown.clone())
            };
            run_supervisor(
                "icecast",
                first,
                spawner,
                Arc::clone(&slot),
                Arc::clone(&sink),
                Arc::clone(&restart),
                shutdown.clone(),
                Arc::new(Mutex::new(Instant::now())),
                Arc::clone(&cfg.metrics),
            );
        }

        let snap = cfg.cursor.snapshot();
        info!(
            "Icecast ready at {} (cursor position {:?})",
            stream_path, snap.position
        );

        Ok(Arc::new(Self {
            station_name,
            stream_path,
            sink,
            output,
            restart,
            shutdown,
        }))
    }

    /// Best-effort writer for the live Ogg stream; registered on the tee.
    pub fn audio_sink(&self) -> Arc<dyn ByteSink> {
        Arc::clone(&self.sink) as Arc<dyn ByteSink>
    }

    /// Total dropped Ogg writes on the encoder pipe.
    pub fn drop_count(&self) -> u64 {
        self.sink.drop_count()
    }

    /// Listener-side fan-out bus.
    pub fn output(&self) -> &Arc<Broadcaster> {
        &self.output
    }

    pub fn station_name(&self) -> &str {
        &self.station_name
    }

    /// Forces the encoder subprocess to restart.
    pub fn restart(&self) {
        if self.is_closed() {
            return;
        }
        self.restart.notify_waiters();
    }

    /// Stops the encoder and closes every listener. Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.sink.close();
        self.output.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// M3U playlist body pointing listeners at the live stream. Relative
    /// paths are made absolute from proxy headers when present, otherwise
    /// from the request host and TLS state.
    pub fn playlist_body(
        &self,
        forwarded_host: Option<&str>,
        forwarded_proto: Option<&str>,
        host: Option<&str>,
        tls: bool,
    ) -> String {
        let url = self.resolve_stream_url(forwarded_host, forwarded_proto, host, tls);
        format!("#EXTM3U\n#EXTINF:-1,{}\n{}\n", self.station_name, url)
    }

    fn resolve_stream_url(
        &self,
        forwarded_host: Option<&str>,
        forwarded_proto: Option<&str>,
        host: Option<&str>,
        tls: bool,
    ) -> String {
        let path = &self.stream_path;
        if path.starts_with("http://") || path.starts_with("https://") || !path.starts_with('/') {
            return path.clone();
        }

        let host = first_value(forwarded_host)
            .or_else(|| first_value(host))
            .unwrap_or_default();
        if host.is_empty() {
            return path.clone();
        }

        let proto = first_value(forwarded_proto)
            .unwrap_or_else(|| if tls { "https" } else { "http" }.to_string());

        format!("{proto}://{host}{path}")
    }
}

/// First comma-separated element of a header value, trimmed.
fn first_value(value: Option<&str>) -> Option<String> {
    let value = value?.split(',').next()?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn non_empty(value: String, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn build_args() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-fflags",
        "+igndts+genpts",
        "-use_wallclock_as_timestamps",
        "1",
        "-flush_packets",
        "1",
        "-f",
        "ogg",
        "-i",
        "pipe:0",
        "-map",
        "0:a:0",
        "-c:a",
        "libmp3lame",
        "-ac",
        "2",
        "-ar",
        "48000",
        "-b:a",
        "128k",
        "-af",
        "asetpts=N/SR/TB",
        "-f",
        "mp3",
        "pipe:1",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Spawns one MP3 encoder with stdout pumped into the broadcaster.
fn spawn_mp3_encoder(
    ffmpeg: &PathBuf,
    output: Arc<Broadcaster>,
    shutdown: CancellationToken,
) -> Result<Spawned> {
    let mut child = Command::new(ffmpeg)
        .args(build_args())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("start ffmpeg for icecast")?;

    let stdin = child.stdin.take().context("ffmpeg stdin missing")?;
    let stdout = child.stdout.take().context("ffmpeg stdout missing")?;
    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_logger(stderr, "ffmpeg (icecast): ");
    }

    tokio::spawn(async move {
        let mut stdout = stdout;
        let mut buf = vec![0u8; STDOUT_CHUNK_BYTES];
        loop {
            let n = tokio::select! {
                _ = shutdown.cancelled() => return,
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(e) => {
                        warn!("icecast stdout error: {e}");
                        return;
                    }
                },
            };
            output.broadcast(Bytes::copy_from_slice(&buf[..n]));
        }
    });

    Ok(Spawned { child, stdin })
}
