//! Encoder subprocess lifecycle shared by the MP3 and HLS pipelines.
//!
//! One supervise task per transport owns the ffmpeg child: it waits for
//! exit, honors restart requests and shutdown, respawns with exponential
//! backoff, and swaps the stdin slot the pipe sink drains into. The slot
//! carries a generation number so a write racing a restart lands on the
//! floor instead of on a defunct pipe.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pipe::PipeSink;
use opuscast_common::MetricsContext;

/// Delay before the first respawn attempt.
pub const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Backoff ceiling for repeated spawn failures.
pub const RESTART_MAX_DELAY: Duration = Duration::from_secs(30);

/// A freshly spawned encoder. Any stdout/stderr pump tasks are wired up by
/// the transport-specific spawner before this is handed over.
pub(crate) struct Spawned {
    pub child: Child,
    pub stdin: ChildStdin,
}

/// The stdin pipe currently owned by the live encoder process, tagged with
/// a generation so late writers can detect they lost the race.
pub(crate) struct StdinSlot {
    slot: Mutex<Option<(u64, ChildStdin)>>,
    generation: AtomicU64,
}

impl StdinSlot {
    // ---
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    /// Installs the stdin of a new process and returns its generation.
    pub(crate) fn install(&self, stdin: ChildStdin) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut slot = self.slot.lock().expect("stdin slot poisoned");
        *slot = Some((generation, stdin));
        generation
    }

    /// Drops the current stdin, closing the pipe. Bumps the generation so a
    /// write that borrowed the old pipe cannot restore it afterwards.
    pub(crate) fn clear(&self) {
        let mut slot = self.slot.lock().expect("stdin slot poisoned");
        self.generation.fetch_add(1, Ordering::AcqRel);
        *slot = None;
    }

    /// Generation the next [`install`](Self::install) will assign. Lets the
    /// supervisor arm a header re-prime before the new pipe becomes
    /// visible to the drain.
    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire) + 1
    }

    /// Borrows the pipe out of the slot for one write.
    pub(crate) fn take(&self) -> Option<(u64, ChildStdin)> {
        let mut slot = self.slot.lock().expect("stdin slot poisoned");
        slot.take()
    }

    /// Returns the pipe after a write, unless the process has been replaced
    /// in the meantime; a stale pipe is silently dropped.
    pub(crate) fn restore(&self, generation: u64, stdin: ChildStdin) {
        let mut slot = self.slot.lock().expect("stdin slot poisoned");
        if self.generation.load(Ordering::Acquire) == generation && slot.is_none() {
            *slot = Some((generation, stdin));
        }
    }
}

/// Resolves the encoder binary the way a shell would: an explicit path is
/// checked directly, a bare name is searched on `PATH`. Missing encoder is
/// unrecoverable, so this is called once at transport start.
pub(crate) fn find_encoder_binary(name: &str) -> Result<PathBuf> {
    let name = name.trim();
    let name = if name.is_empty() { "ffmpeg" } else { name };

    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(name);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        bail!("encoder binary not found at {name}");
    }

    let path_var = std::env::var_os("PATH").context("PATH is not set")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    bail!("encoder binary {name:?} not found on PATH");
}

/// Forwards an encoder's stderr to the log, one line at a time.
pub(crate) fn spawn_stderr_logger(stderr: ChildStderr, prefix: &'static str) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() {
                warn!("{prefix}{line}");
            }
        }
    });
}

/// Supervises one encoder process until shutdown.
///
/// `first` is the already-running process from transport start; `spawner`
/// produces replacements. On every successful respawn the new stdin is
/// installed and the pipe sink is asked to re-prime it with the cached
/// header pages.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_supervisor<F>(
    label: &'static str,
    first: Spawned,
    spawner: F,
    slot: Arc<StdinSlot>,
    sink: Arc<PipeSink>,
    restart: Arc<Notify>,
    shutdown: CancellationToken,
    started_at: Arc<Mutex<Instant>>,
    metrics: Arc<MetricsContext>,
) where
    F: Fn() -> Result<Spawned> + Send + 'static,
{
    tokio::spawn(async move {
        let mut child = first.child;
        slot.install(first.stdin);
        *started_at.lock().expect("started_at poisoned") = Instant::now();

        enum Wake {
            Exited(std::io::Result<std::process::ExitStatus>),
            Shutdown,
            Restart,
        }

        loop {
            let wake = tokio::select! {
                status = child.wait() => Wake::Exited(status),
                _ = shutdown.cancelled() => Wake::Shutdown,
                _ = restart.notified() => Wake::Restart,
            };

            match wake {
                Wake::Exited(Ok(code)) => info!("{label} transcoder exited: {code}"),
                Wake::Exited(Err(e)) => warn!("{label} transcoder wait failed: {e}"),
                Wake::Shutdown => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return;
                }
                Wake::Restart => {
                    info!("{label} transcoder restart requested");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }

            if shutdown.is_cancelled() {
                return;
            }

            slot.clear();

            // Respawn with bounded exponential backoff until it sticks.
            let mut backoff = RESTART_DELAY;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => return,
                }

                match spawner() {
                    Ok(spawned) => {
                        // Arm the re-prime before the new pipe is visible so
                        // no chunk can slip through unprimed.
                        sink.request_prime(slot.next_generation());
                        let generation = slot.install(spawned.stdin);
                        *started_at.lock().expect("started_at poisoned") = Instant::now();
                        metrics.transcoder_restarts_total.inc();
                        child = spawned.child;
                        info!("{label} transcoder restarted (generation {generation})");
                        break;
                    }
                    Err(e) => {
                        warn!("{label} transcoder restart failed: {e:#}");
                        backoff = (backoff * 2).min(RESTART_MAX_DELAY);
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn encoder_lookup_finds_a_standard_tool() {
        // ---
        // `sh` exists on any unix PATH this test will run on.
        let found = find_encoder_binary("sh");
        assert!(found.is_ok());
    }

    #[test]
    fn encoder_lookup_rejects_nonsense() {
        // ---
        assert!(find_encoder_binary("definitely-not-an-encoder-9000").is_err());
        assert!(find_encoder_binary("/nonexistent/path/ffmpeg").is_err());
    }

    /// Full supervise-loop exercise with `cat` standing in for the
    /// encoder: the stream flows through stdin and back out of stdout, a
    /// forced restart respawns the process after the backoff, and the
    /// replacement is re-primed with the cached header pages before any
    /// audio reaches it.
    #[tokio::test(flavor = "multi_thread")]
    async fn supervisor_restarts_and_reprimes_the_stream() {
        // ---
        use crate::audio::ogg_fixtures::{build_page, laces_for, opus_head, opus_tags};
        use crate::audio::ByteSink;
        use crate::pipe::PipeSink;
        use std::process::Stdio;
        use std::sync::Mutex as StdMutex;
        use tokio::io::AsyncReadExt;

        // Everything every spawned `cat` echoes back, across generations.
        let captured: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));

        let spawn_cat = {
            let captured = Arc::clone(&captured);
            move || -> Result<Spawned> {
                let mut child = tokio::process::Command::new("cat")
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .spawn()
                    .context("spawn cat")?;
                let stdin = child.stdin.take().context("cat stdin")?;
                let mut stdout = child.stdout.take().context("cat stdout")?;

                let captured = Arc::clone(&captured);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stdout.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => captured
                                .lock()
                                .expect("capture lock")
                                .extend_from_slice(&buf[..n]),
                        }
                    }
                });

                Ok(Spawned { child, stdin })
            }
        };

        let slot = StdinSlot::new();
        let shutdown = CancellationToken::new();
        let sink = PipeSink::start("cat", Arc::clone(&slot), shutdown.clone());
        let restart = Arc::new(Notify::new());
        let metrics = Arc::new(MetricsContext::new("supervisor-test").expect("metrics"));

        let first = spawn_cat().expect("first spawn");
        run_supervisor(
            "cat",
            first,
            spawn_cat.clone(),
            Arc::clone(&slot),
            Arc::clone(&sink),
            Arc::clone(&restart),
            shutdown.clone(),
            Arc::new(Mutex::new(Instant::now())),
            Arc::clone(&metrics),
        );

        // Let the supervise task install the first stdin before writing so
        // the opening pages are not dropped on the floor.
        tokio::time::sleep(Duration::from_millis(200)).await;

        // A well-formed stream start: headers, then one audio page.
        let head = opus_head(48_000, 0);
        let tags = opus_tags("supervisor", &[]);
        let head_page = build_page(0, 0x02, &laces_for(head.len(), true), &head);
        let tags_page = build_page(0, 0x00, &laces_for(tags.len(), true), &tags);
        let audio_page = build_page(960, 0x00, &laces_for(40, true), &[7u8; 40]);

        sink.write_chunk(&head_page).expect("write");
        sink.write_chunk(&tags_page).expect("write");
        sink.write_chunk(&audio_page).expect("write");

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if count_occurrences(&captured.lock().expect("capture lock"), b"OpusTags") >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(
            count_occurrences(&captured.lock().expect("capture lock"), b"OpusHead") >= 1,
            "first encoder never saw the stream"
        );

        // Force a restart and keep feeding audio; writes during the backoff
        // window are dropped, the first one after respawn triggers the
        // header replay.
        restart.notify_waiters();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            assert!(Instant::now() < deadline, "restarted encoder never re-primed");

            sink.write_chunk(&audio_page).expect("write");
            tokio::time::sleep(Duration::from_millis(100)).await;

            if count_occurrences(&captured.lock().expect("capture lock"), b"OpusHead") >= 2 {
                break;
            }
        }

        let output = captured.lock().expect("capture lock").clone();
        assert!(count_occurrences(&output, b"OpusTags") >= 2);
        assert_eq!(metrics.transcoder_restarts_total.get(), 1);

        shutdown.cancel();
    }

    fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
        // ---
        haystack
            .windows(needle.len())
            .filter(|w| *w == needle)
            .count()
    }

    #[tokio::test]
    async fn stdin_slot_generation_discipline() {
        // ---
        use std::process::Stdio;

        let spawn_cat = || {
            tokio::process::Command::new("cat")
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .spawn()
                .expect("spawn cat")
        };

        let slot = StdinSlot::new();

        let mut first = spawn_cat();
        let gen1 = slot.install(first.stdin.take().expect("stdin"));
        assert_eq!(gen1, 1);

        // A writer borrows the pipe, a restart happens meanwhile.
        let (taken_gen, taken_stdin) = slot.take().expect("pipe present");
        assert_eq!(taken_gen, 1);

        let mut second = spawn_cat();
        let gen2 = slot.install(second.stdin.take().expect("stdin"));
        assert_eq!(gen2, 2);

        // The late restore must not clobber the new process's pipe.
        slot.restore(taken_gen, taken_stdin);
        let (current_gen, _) = slot.take().expect("pipe present");
        assert_eq!(current_gen, 2);

        let _ = first.start_kill();
        let _ = second.start_kill();
        let _ = first.wait().await;
        let _ = second.wait().await;
    }
}
