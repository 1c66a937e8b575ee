//! Shared audio cursor.
//!
//! The cursor anchors a single wall-clock timeline that every output
//! (WebRTC, HLS, Icecast) hangs off. The playlist driver advances it as
//! packets go out; the status endpoint and the watchdog only read it.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Monotonic, wall-clock-anchored play position.
///
/// Exactly one cursor exists per process. It never rewinds: `advance` with a
/// zero duration is a no-op, and there is no way to subtract time.
#[derive(Debug)]
pub struct Cursor {
    // ---
    inner: Mutex<CursorState>,
}

#[derive(Debug, Clone, Copy)]
struct CursorState {
    started_at: SystemTime,
    position: Duration,
}

/// Atomic view of the cursor taken under a single lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub started_at: SystemTime,
    pub position: Duration,
    pub wall_clock: SystemTime,
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

impl Cursor {
    // ---
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CursorState {
                started_at: SystemTime::now(),
                position: Duration::ZERO,
            }),
        }
    }

    /// Increments the cursor and returns the new absolute position.
    pub fn advance(&self, d: Duration) -> Duration {
        if d.is_zero() {
            return self.position();
        }

        let mut state = self.inner.lock().expect("cursor lock poisoned");
        state.position += d;
        state.position
    }

    /// Returns the current offset from the start of the stream.
    pub fn position(&self) -> Duration {
        self.inner.lock().expect("cursor lock poisoned").position
    }

    /// Returns the wall clock time when the cursor began.
    pub fn started_at(&self) -> SystemTime {
        self.inner.lock().expect("cursor lock poisoned").started_at
    }

    /// Returns a consistent snapshot of the cursor state.
    pub fn snapshot(&self) -> CursorSnapshot {
        let state = self.inner.lock().expect("cursor lock poisoned");

        CursorSnapshot {
            started_at: state.started_at,
            position: state.position,
            wall_clock: state.started_at + state.position,
        }
    }
}
