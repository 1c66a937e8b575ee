//! Encoded-byte fan-out to HTTP listeners.
//!
//! One encoder feeds many listeners. Each listener gets a bounded channel;
//! broadcast never blocks on a listener — a client whose channel is full is
//! evicted on the spot. A small ring of recent chunks warm-starts new
//! listeners so they hear audio within the first page instead of waiting
//! for the next MP3 frame boundary.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-client channel depth in chunks.
pub const CLIENT_BUFFER_SLOTS: usize = 64;

/// Byte cap of the warm-start ring.
pub const WARM_BUFFER_BYTES: usize = 32 * 1024;

/// Handle identifying a registered listener.
pub type ClientId = u64;

struct Inner {
    clients: HashMap<ClientId, mpsc::Sender<Bytes>>,
    next_id: ClientId,
    closed: bool,
    recent: VecDeque<Bytes>,
    recent_bytes: usize,
    recent_max_bytes: usize,
}

/// In-memory multicast bus from one encoder to many HTTP listeners.
pub struct Broadcaster {
    // ---
    inner: Mutex<Inner>,
    evictions: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    // ---
    pub fn new() -> Self {
        Self::with_warm_capacity(WARM_BUFFER_BYTES)
    }

    pub fn with_warm_capacity(recent_max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                clients: HashMap::new(),
                next_id: 1,
                closed: false,
                recent: VecDeque::new(),
                recent_bytes: 0,
                recent_max_bytes,
            }),
            evictions: AtomicU64::new(0),
        }
    }

    /// Registers a listener. When the broadcaster is already closed the
    /// returned channel is closed too, so the caller observes immediate
    /// end-of-stream rather than an error path.
    pub fn add_client(&self) -> (ClientId, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER_SLOTS);

        let mut inner = self.inner.lock().expect("broadcaster lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.clients.insert(id, tx);
        }
        (id, rx)
    }

    /// Unregisters a listener; harmless to call twice. Dropping the sender
    /// closes the client channel exactly once.
    pub fn remove_client(&self, id: ClientId) {
        let mut inner = self.inner.lock().expect("broadcaster lock poisoned");
        inner.clients.remove(&id);
    }

    /// Chunks a newly attached listener should receive before live data.
    pub fn snapshot(&self) -> Vec<Bytes> {
        let inner = self.inner.lock().expect("broadcaster lock poisoned");
        if inner.closed {
            return Vec::new();
        }
        inner.recent.iter().cloned().collect()
    }

    /// Enqueues `chunk` to every client without blocking. Clients whose
    /// channel is full are evicted so the encoder never stalls.
    pub fn broadcast(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        let targets: Vec<(ClientId, mpsc::Sender<Bytes>)> = {
            let mut inner = self.inner.lock().expect("broadcaster lock poisoned");
            if inner.closed {
                return;
            }
            push_recent(&mut inner, chunk.clone());
            inner
                .clients
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut stale: Vec<ClientId> = Vec::new();
        for (id, tx) in targets {
            if tx.try_send(chunk.clone()).is_err() {
                stale.push(id);
            }
        }

        if stale.is_empty() {
            return;
        }

        let mut inner = self.inner.lock().expect("broadcaster lock poisoned");
        for id in stale {
            if inner.clients.remove(&id).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("evicted slow listener {id}");
            }
        }
    }

    /// Closes every client channel exactly once and rejects future work.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("broadcaster lock poisoned");
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.clients.clear();
        inner.recent.clear();
        inner.recent_bytes = 0;
    }

    pub fn client_count(&self) -> usize {
        self.inner
            .lock()
            .expect("broadcaster lock poisoned")
            .clients
            .len()
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

fn push_recent(inner: &mut Inner, chunk: Bytes) {
    if inner.recent_max_bytes == 0 {
        return;
    }
    inner.recent_bytes += chunk.len();
    inner.recent.push_back(chunk);
    while inner.recent_bytes > inner.recent_max_bytes {
        match inner.recent.pop_front() {
            Some(old) => inner.recent_bytes -= old.len(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn chunk(size: usize, fill: u8) -> Bytes {
        // ---
        Bytes::from(vec![fill; size])
    }

    #[tokio::test]
    async fn warm_buffer_evicts_oldest_first() {
        // ---
        let b = Broadcaster::with_warm_capacity(32 * 1024);
        b.broadcast(chunk(10 * 1024, 1));
        b.broadcast(chunk(15 * 1024, 2));
        b.broadcast(chunk(12 * 1024, 3));

        let snapshot = b.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].len(), 15 * 1024);
        assert_eq!(snapshot[1].len(), 12 * 1024);
    }

    #[tokio::test]
    async fn listeners_receive_chunks_in_order() {
        // ---
        let b = Broadcaster::new();
        let (_id, mut rx) = b.add_client();

        b.broadcast(chunk(3, 1));
        b.broadcast(chunk(3, 2));

        assert_eq!(rx.recv().await.unwrap()[0], 1);
        assert_eq!(rx.recv().await.unwrap()[0], 2);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_and_fast_one_survives() {
        // ---
        let b = Broadcaster::new();
        let (_slow_id, mut slow_rx) = b.add_client();
        let (_fast_id, mut fast_rx) = b.add_client();

        // Fill the slow client's channel to the brim, draining the fast one.
        for i in 0..CLIENT_BUFFER_SLOTS {
            b.broadcast(chunk(1, i as u8));
            fast_rx.recv().await.unwrap();
        }
        assert_eq!(b.client_count(), 2);

        // One more broadcast overflows the untouched slow client.
        b.broadcast(chunk(1, 0xFF));
        assert_eq!(b.client_count(), 1);
        assert_eq!(b.eviction_count(), 1);

        // The fast client still gets the chunk; the slow one's channel ends
        // after its buffered backlog.
        assert_eq!(fast_rx.recv().await.unwrap()[0], 0xFF);
        let mut drained = 0;
        while slow_rx.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, CLIENT_BUFFER_SLOTS);
    }

    #[tokio::test]
    async fn close_ends_every_client_exactly_once() {
        // ---
        let b = Broadcaster::new();
        let (_a, mut rx_a) = b.add_client();
        let (_b, mut rx_b) = b.add_client();

        b.close();
        b.close(); // idempotent

        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
        assert!(b.snapshot().is_empty());

        // Clients attached after close see an already-closed channel.
        let (_c, mut rx_c) = b.add_client();
        assert!(rx_c.recv().await.is_none());
    }

    #[tokio::test]
    async fn remove_client_is_idempotent() {
        // ---
        let b = Broadcaster::new();
        let (id, mut rx) = b.add_client();

        b.remove_client(id);
        b.remove_client(id);

        assert!(rx.recv().await.is_none());
        b.broadcast(chunk(1, 9)); // nobody to deliver to; must not panic
    }
}
