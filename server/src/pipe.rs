//! Bounded pipe between the live Ogg stream and an encoder's stdin.
//!
//! The write side is non-blocking: the playlist driver's tee must never
//! stall on a wedged encoder, so a full buffer drops the chunk and counts
//! it. A drain task forwards chunks to whichever stdin the supervisor has
//! installed; when the encoder has been restarted, the drain first replays
//! the cached OpusHead+OpusTags pages and then discards bytes up to the
//! next `OggS` capture pattern so the new process sees a well-formed
//! stream starting at a page boundary.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::audio::{ByteSink, OpusHeaderCollector};
use crate::transcoder::StdinSlot;

/// Buffered chunk capacity between tee and encoder stdin.
pub const PIPE_BUFFER_SLOTS: usize = 256;

/// Decoupling sink in front of an encoder subprocess.
pub struct PipeSink {
    // ---
    label: &'static str,
    tx: mpsc::Sender<Bytes>,
    drops: AtomicU64,
    closed: AtomicBool,
    full_logged: AtomicBool,

    // Cached raw header pages for re-priming a restarted encoder.
    header: RwLock<Vec<u8>>,
    collector: Mutex<OpusHeaderCollector>,

    // Generation whose stdin still needs the header replay; zero when none.
    prime_pending: AtomicU64,
}

impl PipeSink {
    // ---
    /// Creates the sink and spawns its drain task.
    pub(crate) fn start(
        label: &'static str,
        slot: Arc<StdinSlot>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(PIPE_BUFFER_SLOTS);

        let sink = Arc::new(Self {
            label,
            tx,
            drops: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            full_logged: AtomicBool::new(false),
            header: RwLock::new(Vec::new()),
            collector: Mutex::new(OpusHeaderCollector::new()),
            prime_pending: AtomicU64::new(0),
        });

        tokio::spawn(drain(Arc::clone(&sink), slot, rx, shutdown));
        sink
    }

    /// Sink with no drain task behind it, for synchronous tests.
    #[cfg(test)]
    pub(crate) fn start_detached_for_tests() -> Arc<Self> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Self {
            label: "test",
            tx,
            drops: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            full_logged: AtomicBool::new(false),
            header: RwLock::new(Vec::new()),
            collector: Mutex::new(OpusHeaderCollector::new()),
            prime_pending: AtomicU64::new(0),
        })
    }

    /// Total chunks dropped: buffer full, stdin missing, or write failure.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Stops accepting writes. Idempotent; the drain task is wound down by
    /// the owner's cancellation token.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Marks `generation`'s stdin as needing the cached header pages before
    /// any audio bytes.
    pub(crate) fn request_prime(&self, generation: u64) {
        self.prime_pending.store(generation, Ordering::Release);
    }

    fn count_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    fn cached_header(&self) -> Vec<u8> {
        self.header.read().expect("header lock poisoned").clone()
    }
}

impl ByteSink for PipeSink {
    fn write_chunk(&self, chunk: &[u8]) -> io::Result<usize> {
        if chunk.is_empty() {
            return Ok(0);
        }
        let n = chunk.len();

        if self.closed.load(Ordering::Acquire) {
            self.count_drop();
            return Ok(n);
        }

        // Keep the header cache current even for chunks we end up dropping.
        {
            let mut collector = self.collector.lock().expect("collector lock poisoned");
            if let Some(header) = collector.feed(chunk) {
                *self.header.write().expect("header lock poisoned") = header;
            }
        }

        let copy = Bytes::copy_from_slice(chunk);
        if self.tx.try_send(copy).is_err() {
            self.count_drop();
            if !self.full_logged.swap(true, Ordering::Relaxed) {
                warn!("{} sink dropping audio: buffer full", self.label);
            }
        }

        Ok(n)
    }
}

async fn drain(
    sink: Arc<PipeSink>,
    slot: Arc<StdinSlot>,
    mut rx: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
) {
    let mut sync_needed = false;
    let mut write_error_logged = false;

    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = rx.recv() => match received {
                Some(chunk) => chunk,
                None => return,
            },
        };

        let Some((generation, mut stdin)) = slot.take() else {
            sink.count_drop();
            continue;
        };

        // A restarted encoder first gets the cached header pages, then only
        // bytes from the next page boundary on.
        if sink
            .prime_pending
            .compare_exchange(generation, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let header = sink.cached_header();
            if !header.is_empty() {
                if let Err(e) = stdin.write_all(&header).await {
                    sink.count_drop();
                    if !write_error_logged {
                        write_error_logged = true;
                        warn!("{} sink dropped header: {e}", sink.label);
                    }
                    continue; // stdin dropped; supervisor will respawn
                }
            }
            sync_needed = true;
        }

        let mut chunk = chunk;
        if sync_needed {
            match find_capture_pattern(&chunk) {
                Some(idx) => {
                    chunk = chunk.slice(idx..);
                    sync_needed = false;
                }
                None => {
                    slot.restore(generation, stdin);
                    continue;
                }
            }
        }

        match stdin.write_all(&chunk).await {
            Ok(()) => slot.restore(generation, stdin),
            Err(e) => {
                sink.count_drop();
                if !write_error_logged {
                    write_error_logged = true;
                    warn!("{} sink dropped audio: {e}", sink.label);
                }
            }
        }
    }
}

fn find_capture_pattern(chunk: &[u8]) -> Option<usize> {
    chunk.windows(4).position(|w| w == b"OggS")
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn write_never_blocks_without_a_process() {
        // ---
        let shutdown = CancellationToken::new();
        let slot = StdinSlot::new();
        let sink = PipeSink::start("test", slot, shutdown.clone());

        // Push well past the buffer depth; every call must return the full
        // length immediately.
        let chunk = vec![0u8; 128];
        for _ in 0..(PIPE_BUFFER_SLOTS + 50) {
            let n = sink.write_chunk(&chunk).expect("non-blocking write");
            assert_eq!(n, chunk.len());
        }

        // Give the drain a moment to consume whatever it can; with no stdin
        // installed, everything it receives is dropped.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(sink.drop_count() > 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn closed_sink_counts_drops_but_still_accepts_length() {
        // ---
        let shutdown = CancellationToken::new();
        let sink = PipeSink::start("test", StdinSlot::new(), shutdown.clone());

        sink.close();
        let n = sink.write_chunk(&[1, 2, 3]).expect("write after close");
        assert_eq!(n, 3);
        assert_eq!(sink.drop_count(), 1);

        shutdown.cancel();
    }

    #[test]
    fn capture_pattern_scan_finds_mid_chunk_pages() {
        // ---
        let mut chunk = vec![0u8; 10];
        chunk.extend_from_slice(b"OggS");
        chunk.extend_from_slice(&[9; 4]);

        assert_eq!(find_capture_pattern(&chunk), Some(10));
        assert_eq!(find_capture_pattern(&[1, 2, 3]), None);
    }
}
