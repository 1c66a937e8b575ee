//! HLS (fMP4/AAC) transport.
//!
//! An ffmpeg child consumes the live Ogg Opus stream on stdin and writes
//! fragmented-MP4 segments plus playlists into the output directory, which
//! the HTTP layer serves as static files. A monitor task watches playlist
//! freshness: a stalled encoder that stops updating `live.m3u8` is killed
//! so the supervisor replaces it, and long-lived encoders are recycled
//! before their internal timestamps get close to wrapping.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audio::{ByteSink, Cursor};
use crate::pipe::PipeSink;
use crate::transcoder::{
    find_encoder_binary, run_supervisor, spawn_stderr_logger, Spawned, StdinSlot,
};
use opuscast_common::MetricsContext;

pub const PLAYLIST_FILENAME: &str = "live.m3u8";
pub const PLAYLIST_CACHE_CONTROL: &str = "no-store, max-age=0";

const STALE_CHECK_EVERY: Duration = Duration::from_secs(10);
const STALE_PLAYLIST_AGE: Duration = Duration::from_secs(45);
// At 48 kHz the muxer's timestamp accounting overflows past 12 h, so the
// encoder is recycled well before that.
const MAX_ENCODER_UPTIME: Duration = Duration::from_secs(8 * 60 * 60);

pub struct HlsConfig {
    pub output_dir: PathBuf,
    pub ffmpeg_bin: String,
    pub segment_cache_control: Option<String>,
    pub ffmpeg_loglevel: String,
    pub cursor: Arc<Cursor>,
    pub metrics: Arc<MetricsContext>,
}

/// The HLS side of the station: encoder subprocess + on-disk artifacts.
pub struct HlsStreamer {
    // ---
    dir: PathBuf,
    segment_cache_control: String,

    sink: Arc<PipeSink>,
    restart: Arc<Notify>,
    shutdown: CancellationToken,
}

impl HlsStreamer {
    // ---
    /// Wipes the output directory, spawns ffmpeg, and starts supervision
    /// plus the staleness monitor.
    pub fn start(cfg: HlsConfig) -> Result<Arc<Self>> {
        let ffmpeg = find_encoder_binary(&cfg.ffmpeg_bin)
            .context("ffmpeg is required for the HLS/AAC transport")?;

        let dir = cfg.output_dir;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create hls output dir {}", dir.display()))?;
        wipe_dir(&dir)?;

        let segment_cache_control = cfg
            .segment_cache_control
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| PLAYLIST_CACHE_CONTROL.to_string());

        let shutdown = CancellationToken::new();
        let slot = StdinSlot::new();
        let sink = PipeSink::start("hls", Arc::clone(&slot), shutdown.clone());
        let restart = Arc::new(Notify::new());
        let started_at = Arc::new(Mutex::new(Instant::now()));

        let loglevel = non_empty(cfg.ffmpeg_loglevel, "warning");
        let first = spawn_hls_encoder(&ffmpeg, &dir, &loglevel)?;

        {
            let dir = dir.clone();
            let spawner = move || spawn_hls_encoder(&ffmpeg, &dir, &loglevel);
            run_supervisor(
                "hls",
                first,
                spawner,
                Arc::clone(&slot),
                Arc::clone(&sink),
                Arc::clone(&restart),
                shutdown.clone(),
                Arc::clone(&started_at),
                Arc::clone(&cfg.metrics),
            );
        }

        spawn_playlist_monitor(
            dir.join(PLAYLIST_FILENAME),
            Arc::clone(&restart),
            Arc::clone(&started_at),
            shutdown.clone(),
        );

        let snap = cfg.cursor.snapshot();
        info!(
            "HLS ready at /api/hls/ (output: {}, cursor position {:?})",
            dir.display(),
            snap.position
        );

        Ok(Arc::new(Self {
            dir,
            segment_cache_control,
            sink,
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

    /// Root of the generated artifacts.
    pub fn output_dir(&self) -> &Path {
        &self.dir
    }

    /// Content type and cache policy for a served artifact path.
    pub fn headers_for(&self, path: &str) -> (Option<&'static str>, &str) {
        if path.ends_with(".m3u8") {
            (
                Some("application/vnd.apple.mpegurl"),
                PLAYLIST_CACHE_CONTROL,
            )
        } else if path.ends_with(".m4s") {
            (Some("video/iso.segment"), &self.segment_cache_control)
        } else if path.ends_with(".mp4") {
            (Some("video/mp4"), &self.segment_cache_control)
        } else {
            (None, PLAYLIST_CACHE_CONTROL)
        }
    }

    /// Forces the encoder subprocess to restart.
    pub fn restart(&self) {
        if self.is_closed() {
            return;
        }
        self.restart.notify_waiters();
    }

    /// Stops the encoder and background tasks. Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.sink.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Why the monitor decided to recycle the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorVerdict {
    Healthy,
    UptimeExceeded,
    PlaylistMissing,
    PlaylistStale,
}

/// The monitor's decision for one check. Staleness only counts once the
/// encoder has had a full threshold of uptime to produce its first
/// playlist.
fn monitor_verdict(uptime: Duration, playlist_age: Option<Duration>) -> MonitorVerdict {
    if uptime > MAX_ENCODER_UPTIME {
        return MonitorVerdict::UptimeExceeded;
    }
    if uptime <= STALE_PLAYLIST_AGE {
        return MonitorVerdict::Healthy;
    }

    match playlist_age {
        None => MonitorVerdict::PlaylistMissing,
        Some(age) if age > STALE_PLAYLIST_AGE => MonitorVerdict::PlaylistStale,
        Some(_) => MonitorVerdict::Healthy,
    }
}

/// Kills the encoder when the playlist goes stale or uptime exceeds the
/// ceiling; the supervisor then respawns it.
fn spawn_playlist_monitor(
    playlist_path: PathBuf,
    restart: Arc<Notify>,
    started_at: Arc<Mutex<Instant>>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STALE_CHECK_EVERY);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }

            let uptime = started_at.lock().expect("started_at poisoned").elapsed();
            let playlist_age = std::fs::metadata(&playlist_path)
                .and_then(|m| m.modified())
                .ok()
                .map(|modified| modified.elapsed().unwrap_or_default());

            match monitor_verdict(uptime, playlist_age) {
                MonitorVerdict::Healthy => {}
                MonitorVerdict::UptimeExceeded => {
                    warn!("hls transcoder uptime exceeded; restarting to wrap timestamps");
                    restart.notify_waiters();
                }
                MonitorVerdict::PlaylistMissing => {
                    warn!("hls playlist missing; restarting ffmpeg");
                    restart.notify_waiters();
                }
                MonitorVerdict::PlaylistStale => {
                    warn!("hls playlist stale; restarting ffmpeg");
                    restart.notify_waiters();
                }
            }
        }
    });
}

/// Clears previous-run artifacts; the directory only holds generated state.
fn wipe_dir(dir: &Path) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("read hls dir {}", dir.display())),
    };

    for entry in entries {
        let path = entry
            .with_context(|| format!("scan hls dir {}", dir.display()))?
            .path();
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.with_context(|| format!("remove {}", path.display()))?;
    }

    Ok(())
}

fn non_empty(value: String, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn build_args(segment_prefix: &str, loglevel: &str) -> Vec<String> {
    let segment_pattern = format!("{segment_prefix}/segment_%05d.m4s");
    let init_filename = format!("{segment_prefix}/init.mp4");
    let hls_flags = [
        "delete_segments",
        "independent_segments",
        "omit_endlist",
        "program_date_time",
        "temp_file",
    ]
    .join("+");

    [
        "-hide_banner",
        "-loglevel",
        loglevel,
        "-fflags",
        "+igndts+genpts",
        "-use_wallclock_as_timestamps",
        "1",
        "-f",
        "ogg",
        "-i",
        "pipe:0",
        "-map",
        "0:a:0",
        "-c:a",
        "aac",
        "-ac",
        "2",
        "-ar",
        "48000",
        "-b:a",
        "192k",
        "-profile:a",
        "aac_low",
        "-af",
        "asetpts=N/SR/TB",
        "-f",
        "hls",
        "-hls_time",
        "3",
        "-hls_init_time",
        "3",
        "-hls_list_size",
        "32",
        "-hls_delete_threshold",
        "200",
        "-hls_flags",
        &hls_flags,
        "-strftime_mkdir",
        "1",
        "-hls_segment_type",
        "fmp4",
        "-hls_fmp4_init_filename",
        &init_filename,
        "-hls_segment_filename",
        &segment_pattern,
        "-master_pl_name",
        "master.m3u8",
        "-hls_allow_cache",
        "0",
        PLAYLIST_FILENAME,
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Spawns one HLS encoder writing under a unique per-run segment prefix so
/// a restarted encoder never fights its predecessor's files.
fn spawn_hls_encoder(ffmpeg: &PathBuf, dir: &Path, loglevel: &str) -> Result<Spawned> {
    let segment_prefix = format!("segments/{}", Uuid::new_v4());
    let segment_dir = dir.join(&segment_prefix);
    std::fs::create_dir_all(&segment_dir)
        .with_context(|| format!("create hls segment dir {}", segment_dir.display()))?;

    let mut child = Command::new(ffmpeg)
        .args(build_args(&segment_prefix, loglevel))
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("start ffmpeg for hls")?;

    let stdin = child.stdin.take().context("ffmpeg stdin missing")?;
    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_logger(stderr, "ffmpeg (hls): ");
    }

    Ok(Spawned { child, stdin })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn wipe_dir_clears_files_and_subdirs() {
        // ---
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("live.m3u8"), "#EXTM3U").unwrap();
        std::fs::create_dir_all(dir.path().join("segments/run1")).unwrap();
        std::fs::write(dir.path().join("segments/run1/seg.m4s"), [0u8; 4]).unwrap();

        wipe_dir(dir.path()).expect("wipe");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn wipe_dir_tolerates_missing_directory() {
        // ---
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("never-created");
        assert!(wipe_dir(&missing).is_ok());
    }

    #[test]
    fn headers_cover_hls_artifact_types() {
        // ---
        let s = HlsStreamer {
            dir: PathBuf::from("hls"),
            segment_cache_control: "max-age=10".to_string(),
            sink: PipeSink::start_detached_for_tests(),
            restart: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        };

        assert_eq!(
            s.headers_for("live.m3u8"),
            (
                Some("application/vnd.apple.mpegurl"),
                PLAYLIST_CACHE_CONTROL
            )
        );
        assert_eq!(
            s.headers_for("segments/x/segment_00001.m4s"),
            (Some("video/iso.segment"), "max-age=10")
        );
        assert_eq!(
            s.headers_for("segments/x/init.mp4"),
            (Some("video/mp4"), "max-age=10")
        );
        assert_eq!(s.headers_for("readme.txt").0, None);
    }

    #[test]
    fn monitor_gives_a_fresh_encoder_time_to_produce_output() {
        // ---
        // Under the threshold nothing triggers, playlist or not.
        assert_eq!(
            monitor_verdict(Duration::from_secs(10), None),
            MonitorVerdict::Healthy
        );
        assert_eq!(
            monitor_verdict(Duration::from_secs(10), Some(Duration::from_secs(300))),
            MonitorVerdict::Healthy
        );
    }

    #[test]
    fn monitor_flags_missing_and_stale_playlists() {
        // ---
        let settled = Duration::from_secs(120);

        assert_eq!(
            monitor_verdict(settled, None),
            MonitorVerdict::PlaylistMissing
        );
        assert_eq!(
            monitor_verdict(settled, Some(Duration::from_secs(46))),
            MonitorVerdict::PlaylistStale
        );
        assert_eq!(
            monitor_verdict(settled, Some(Duration::from_secs(5))),
            MonitorVerdict::Healthy
        );
    }

    #[test]
    fn monitor_recycles_long_lived_encoders() {
        // ---
        let old = MAX_ENCODER_UPTIME + Duration::from_secs(1);
        assert_eq!(
            monitor_verdict(old, Some(Duration::from_secs(1))),
            MonitorVerdict::UptimeExceeded
        );
    }

    #[test]
    fn segment_args_isolate_each_run() {
        // ---
        let args = build_args("segments/abc", "warning");
        assert!(args.contains(&"segments/abc/segment_%05d.m4s".to_string()));
        assert!(args.contains(&"segments/abc/init.mp4".to_string()));
        assert!(args.last().unwrap() == PLAYLIST_FILENAME);
    }
}
