//! Read-through fan-out of the live Ogg byte stream.
//!
//! A [`TeeReader`] sits between the track file and the packet reader. Every
//! chunk handed to the caller is mirrored to the registered sinks (the
//! encoder pipes) best-effort: a failing sink is logged once and never
//! blocks or fails the read path.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

/// A non-blocking byte consumer. Implementations must return quickly; the
/// read path of the whole station runs through them.
pub trait ByteSink: Send + Sync {
    /// Consumes `chunk`, returning how many bytes were accepted. Anything
    /// short of the full chunk is treated as an error by the tee.
    fn write_chunk(&self, chunk: &[u8]) -> io::Result<usize>;
}

struct TeeSinkEntry {
    name: String,
    sink: Arc<dyn ByteSink>,
    error_logged: AtomicBool,
}

/// Cheaply cloneable registry of downstream sinks shared by successive
/// [`TeeReader`]s.
#[derive(Default, Clone)]
pub struct Tee {
    // ---
    sinks: Arc<RwLock<Vec<TeeSinkEntry>>>,
}

impl Tee {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink for all future reads. Sinks live for the process
    /// lifetime; there is no detach.
    pub fn attach(&self, name: impl Into<String>, sink: Arc<dyn ByteSink>) {
        let mut sinks = self.sinks.write().expect("tee lock poisoned");
        sinks.push(TeeSinkEntry {
            name: name.into(),
            sink,
            error_logged: AtomicBool::new(false),
        });
    }

    /// Wraps `inner` so that everything read through it is mirrored to the
    /// registered sinks.
    pub fn reader<R: Read>(&self, inner: R) -> TeeReader<R> {
        TeeReader {
            inner,
            sinks: Arc::clone(&self.sinks),
        }
    }
}

/// `Read` adapter mirroring every chunk to the tee's sinks.
pub struct TeeReader<R> {
    inner: R,
    sinks: Arc<RwLock<Vec<TeeSinkEntry>>>,
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            fan_out(&self.sinks, &buf[..n]);
        }
        Ok(n)
    }
}

fn fan_out(sinks: &RwLock<Vec<TeeSinkEntry>>, chunk: &[u8]) {
    // Read lock only; the hot path never contends with attach.
    let sinks = sinks.read().expect("tee lock poisoned");
    for entry in sinks.iter() {
        let outcome = match entry.sink.write_chunk(chunk) {
            Ok(n) if n == chunk.len() => Ok(()),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {n} of {}", chunk.len()),
            )),
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            if !entry.error_logged.swap(true, Ordering::Relaxed) {
                warn!("tee sink {} failed, further errors muted: {e}", entry.name);
            }
        }
    }
}
