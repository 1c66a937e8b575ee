//! Playlist driver: the single producer of the station's timeline.
//!
//! A dedicated OS thread walks the catalog in a loop, reads each track
//! through the tee (so every encoder pipe sees the same live Ogg bytes),
//! pushes Opus packets at real-time pace into the WebRTC sample writer,
//! and advances the shared cursor. Pacing accumulates a next-send deadline
//! per packet and resynchronizes to "now" whenever it falls behind.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{info, warn};

use crate::audio::{self, Cursor, OggOpusPacketReader, Tee, FALLBACK_PACKET_DURATION};
use crate::catalog::TrackMeta;
use crate::webrtc::{SampleWriter, StreamState};
use opuscast_common::MetricsContext;

/// How long a restart waits for the previous driver to wind down.
pub const RESTART_WAIT: Duration = Duration::from_secs(5);

/// Where playback resumes at each track start. Policies are mutually
/// exclusive; a random bound takes precedence over a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePolicy {
    FromStart,
    Fixed(Duration),
    RandomWithin(Duration),
}

impl ResumePolicy {
    // ---
    pub fn from_config(
        random_timestamp: Option<Duration>,
        resume_timestamp: Option<Duration>,
    ) -> Self {
        if let Some(bound) = random_timestamp.filter(|d| !d.is_zero()) {
            return ResumePolicy::RandomWithin(bound);
        }
        if let Some(fixed) = resume_timestamp.filter(|d| !d.is_zero()) {
            return ResumePolicy::Fixed(fixed);
        }
        ResumePolicy::FromStart
    }

    /// Picks the offset for one track start.
    pub fn pick(&self) -> Duration {
        match *self {
            ResumePolicy::FromStart => Duration::ZERO,
            ResumePolicy::Fixed(offset) => offset,
            ResumePolicy::RandomWithin(bound) => {
                let nanos = rand::thread_rng().gen_range(0..=bound.as_nanos() as u64);
                Duration::from_nanos(nanos)
            }
        }
    }
}

/// Everything one driver run needs, shared by reference.
#[derive(Clone)]
pub struct DriverContext {
    pub cursor: Arc<Cursor>,
    pub sample_writer: Arc<SampleWriter>,
    pub tee: Tee,
    pub stream: Arc<StreamState>,
    pub metrics: Arc<MetricsContext>,
    pub catalog: Arc<Vec<TrackMeta>>,
    pub resume: ResumePolicy,
}

struct DriverHandle {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    done_rx: mpsc::Receiver<()>,
}

/// Owns at most one running driver thread at a time.
pub struct PlaylistDriver {
    // ---
    ctx: DriverContext,
    state: Mutex<Option<DriverHandle>>,
}

impl PlaylistDriver {
    // ---
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(None),
        }
    }

    /// Starts the driver. A no-op while a previous start is still running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().expect("driver state poisoned");
        if let Some(handle) = state.as_ref() {
            if !handle.finished.load(Ordering::Acquire) {
                return Ok(());
            }
        }

        *state = Some(self.spawn_driver()?);
        Ok(())
    }

    /// Stops the current driver (one-shot stop signal), waits up to
    /// [`RESTART_WAIT`] for it to finish, then starts afresh.
    pub fn restart(&self) -> Result<()> {
        let mut state = self.state.lock().expect("driver state poisoned");

        if let Some(handle) = state.take() {
            if !handle.finished.load(Ordering::Acquire) {
                handle.stop.store(true, Ordering::Release);
                match handle.done_rx.recv_timeout(RESTART_WAIT) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                    Err(RecvTimeoutError::Timeout) => {
                        warn!("previous playlist driver did not stop within {RESTART_WAIT:?}");
                    }
                }
            }
        }

        *state = Some(self.spawn_driver()?);
        Ok(())
    }

    /// Total audio packets dropped on the sample-writer queue since start.
    pub fn drop_count(&self) -> u64 {
        self.ctx.sample_writer.drop_count()
    }

    fn spawn_driver(&self) -> Result<DriverHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();

        let ctx = self.ctx.clone();
        let thread_stop = Arc::clone(&stop);
        let thread_finished = Arc::clone(&finished);

        std::thread::Builder::new()
            .name("playlist-driver".to_string())
            .spawn(move || {
                drive(ctx, thread_stop);
                thread_finished.store(true, Ordering::Release);
                let _ = done_tx.send(());
            })
            .context("spawn playlist driver thread")?;

        Ok(DriverHandle {
            stop,
            finished,
            done_rx,
        })
    }
}

/// The driver loop: walk the catalog forever, one track at a time.
fn drive(ctx: DriverContext, stop: Arc<AtomicBool>) {
    let catalog = Arc::clone(&ctx.catalog);
    if catalog.is_empty() {
        return;
    }

    info!("Autoplay running over {} track(s)", catalog.len());

    // Publish track 0 immediately so status is meaningful before the first
    // packet goes out.
    let first = &catalog[0];
    info!("Now playing: {:?}", first.title);
    ctx.stream.publish_now_playing(&first.title, &first.artists);
    let mut last_path = first.path.clone();

    let mut index = 0usize;
    loop {
        if stop.load(Ordering::Acquire) {
            info!("playlist driver stopping");
            return;
        }

        let track = &catalog[index];
        if track.path != last_path {
            info!("Now playing: {:?}", track.title);
            ctx.stream.publish_now_playing(&track.title, &track.artists);
            last_path = track.path.clone();
        }

        match play_once(&ctx, &stop, track) {
            Ok(()) => {
                ctx.metrics.tracks_played_total.inc();
            }
            Err(e) => {
                warn!("autoplay: {e:#}");
                // Transient file trouble; don't spin on it.
                std::thread::sleep(Duration::from_secs(1));
            }
        }

        if stop.load(Ordering::Acquire) {
            info!("playlist driver stopping");
            return;
        }

        index = (index + 1) % catalog.len();
    }
}

/// Plays one track to completion (or until stopped), pacing packets at
/// real time against an accumulated deadline.
fn play_once(ctx: &DriverContext, stop: &AtomicBool, track: &TrackMeta) -> Result<()> {
    let mut file =
        File::open(&track.path).with_context(|| format!("open {}", track.path.display()))?;

    let offset = ctx.resume.pick();
    let mut header_pages = Vec::new();
    let mut seek_state = None;

    if !offset.is_zero() {
        // Cache the header pages first so the tee'd encoders receive a
        // well-formed stream, then jump by granule.
        let prepared = audio::read_header_pages(&mut file)
            .and_then(|(pages, _)| audio::seek_offset(&mut file, offset).map(|state| (pages, state)));

        match prepared {
            Ok((pages, state)) => {
                header_pages = pages;
                seek_state = Some(state);
            }
            Err(e) => {
                warn!(
                    "seek to {offset:?} in {} failed ({e}); playing from the start",
                    track.path.display()
                );
                file.seek(SeekFrom::Start(0))
                    .with_context(|| format!("rewind {}", track.path.display()))?;
            }
        }
    }

    let source: Box<dyn Read> = if header_pages.is_empty() {
        Box::new(file)
    } else {
        Box::new(std::io::Cursor::new(header_pages).chain(file))
    };

    let mut reader = OggOpusPacketReader::new(ctx.tee.reader(source));
    if let Some(state) = seek_state {
        reader.set_seek_state(state.prev_granule, state.pre_skip);
        // The skipped span still belongs to the shared timeline.
        ctx.cursor.advance(offset);
    }

    let mut next_send = Instant::now();
    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }

        let packet = match reader.next_packet().context("read ogg packet")? {
            Some(packet) => packet,
            None => return Ok(()), // end of track
        };
        if packet.data.is_empty() {
            continue;
        }

        let duration = if packet.duration.is_zero() {
            FALLBACK_PACKET_DURATION
        } else {
            packet.duration
        };

        let payload_len = packet.data.len() as u64;
        ctx.sample_writer.push(packet.data, duration);
        ctx.metrics.packets_streamed_total.inc();
        ctx.metrics.bytes_streamed_total.inc_by(payload_len);

        ctx.cursor.advance(duration);

        next_send += duration;
        let now = Instant::now();
        if next_send > now {
            std::thread::sleep(next_send - now);
        } else {
            // Fallen behind; resynchronize instead of bursting.
            next_send = now;
        }
    }
}
