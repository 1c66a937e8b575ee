//! Viewer-count tracking for the HTTP audio transports.
//!
//! Listeners are keyed by a salted SHA-256 of their client IP so no raw
//! addresses are retained. Connection-oriented protocols (Icecast) hold an
//! active count for the connection's lifetime via a guard; request-scoped
//! protocols (HLS) refresh a TTL on every segment fetch. Expired entries
//! are swept lazily on access.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

pub const DEFAULT_HLS_TTL: Duration = Duration::from_secs(45);
pub const DEFAULT_ICECAST_TTL: Duration = Duration::ZERO;

const CLEANUP_EVERY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Hls,
    Icecast,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolCounts {
    pub hls: usize,
    pub icecast: usize,
}

#[derive(Debug)]
struct ViewerEntry {
    last_seen: Instant,
    active: usize,
}

struct TrackerState {
    hls: HashMap<String, ViewerEntry>,
    icecast: HashMap<String, ViewerEntry>,
    last_cleanup: Instant,
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    ttl_hls: Duration,
    ttl_icecast: Duration,
    salt: Vec<u8>,
}

/// Pluggable viewer tracker consumed by the HTTP layer. Cloning is cheap;
/// all clones share one entry table.
#[derive(Clone)]
pub struct ViewerTracker {
    // ---
    inner: Arc<TrackerInner>,
}

/// Active-connection registration; dropping it releases the connection.
pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
    protocol: Protocol,
    hash: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.release(self.protocol, &self.hash);
    }
}

impl ViewerTracker {
    // ---
    pub fn new(ttl_hls: Duration, ttl_icecast: Duration, salt: &str) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(TrackerState {
                    hls: HashMap::new(),
                    icecast: HashMap::new(),
                    last_cleanup: Instant::now(),
                }),
                ttl_hls,
                ttl_icecast,
                salt: salt.as_bytes().to_vec(),
            }),
        }
    }

    /// Refreshes TTL-scoped presence for one request (HLS segment fetches).
    pub fn track_request(&self, protocol: Protocol, ip: Option<String>) {
        let Some(hash) = ip.map(|ip| self.inner.hash_ip(&ip)) else {
            return;
        };

        let now = Instant::now();
        let mut state = self.inner.state.lock().expect("viewer lock poisoned");
        let entry = entries_mut(&mut state, protocol)
            .entry(hash)
            .or_insert(ViewerEntry {
                last_seen: now,
                active: 0,
            });
        entry.last_seen = now;
        self.inner.maybe_cleanup(&mut state, now);
    }

    /// Registers a long-lived connection; the guard keeps it counted.
    pub fn track_connection(&self, protocol: Protocol, ip: Option<String>) -> Option<ConnectionGuard> {
        let hash = self.inner.hash_ip(&ip?);

        let now = Instant::now();
        {
            let mut state = self.inner.state.lock().expect("viewer lock poisoned");
            let entry = entries_mut(&mut state, protocol)
                .entry(hash.clone())
                .or_insert(ViewerEntry {
                    last_seen: now,
                    active: 0,
                });
            entry.active += 1;
            entry.last_seen = now;
            self.inner.maybe_cleanup(&mut state, now);
        }

        Some(ConnectionGuard {
            inner: Arc::clone(&self.inner),
            protocol,
            hash,
        })
    }

    /// Current distinct-viewer counts per protocol.
    pub fn counts(&self) -> ProtocolCounts {
        let now = Instant::now();
        let mut state = self.inner.state.lock().expect("viewer lock poisoned");
        ProtocolCounts {
            hls: count_live(&mut state.hls, self.inner.ttl_hls, now),
            icecast: count_live(&mut state.icecast, self.inner.ttl_icecast, now),
        }
    }

    #[cfg(test)]
    fn hash_ip(&self, ip: &str) -> String {
        self.inner.hash_ip(ip)
    }
}

impl TrackerInner {
    // ---
    fn release(&self, protocol: Protocol, hash: &str) {
        let now = Instant::now();
        let ttl = self.ttl(protocol);
        let mut state = self.state.lock().expect("viewer lock poisoned");
        let entries = entries_mut(&mut state, protocol);

        if let Some(entry) = entries.get_mut(hash) {
            entry.active = entry.active.saturating_sub(1);
            if entry.active == 0 && ttl.is_zero() {
                entries.remove(hash);
            } else {
                entry.last_seen = now;
            }
        }
        self.maybe_cleanup(&mut state, now);
    }

    fn ttl(&self, protocol: Protocol) -> Duration {
        match protocol {
            Protocol::Hls => self.ttl_hls,
            Protocol::Icecast => self.ttl_icecast,
        }
    }

    fn maybe_cleanup(&self, state: &mut TrackerState, now: Instant) {
        if now.duration_since(state.last_cleanup) < CLEANUP_EVERY {
            return;
        }
        count_live(&mut state.hls, self.ttl_hls, now);
        count_live(&mut state.icecast, self.ttl_icecast, now);
        state.last_cleanup = now;
    }

    fn hash_ip(&self, ip: &str) -> String {
        let mut hasher = Sha256::new();
        if !self.salt.is_empty() {
            hasher.update(&self.salt);
        }
        hasher.update(ip.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn entries_mut(state: &mut TrackerState, protocol: Protocol) -> &mut HashMap<String, ViewerEntry> {
    match protocol {
        Protocol::Hls => &mut state.hls,
        Protocol::Icecast => &mut state.icecast,
    }
}

/// Counts entries still live, sweeping the rest.
fn count_live(entries: &mut HashMap<String, ViewerEntry>, ttl: Duration, now: Instant) -> usize {
    let mut count = 0;
    entries.retain(|_, entry| {
        if entry.active > 0 {
            count += 1;
            return true;
        }
        if ttl.is_zero() {
            return false;
        }
        if now.duration_since(entry.last_seen) <= ttl {
            count += 1;
            true
        } else {
            false
        }
    });
    count
}

/// Resolves the client IP for a request behind optional proxies:
/// `Forwarded`, then `X-Forwarded-For`, then `X-Real-IP`, then the socket
/// peer address. Unparseable values are ignored.
pub fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> Option<String> {
    if let Some(forwarded) = header_str(headers, "forwarded") {
        if let Some(ip) = parse_forwarded_for(forwarded) {
            return Some(ip);
        }
    }
    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = xff.split(',').next() {
            if let Some(ip) = normalize_ip(first) {
                return Some(ip);
            }
        }
    }
    if let Some(real) = header_str(headers, "x-real-ip") {
        if let Some(ip) = normalize_ip(real) {
            return Some(ip);
        }
    }

    Some(remote.ip().to_string())
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name)?.to_str().ok()
}

/// Pulls the first `for=` element out of an RFC 7239 `Forwarded` header.
fn parse_forwarded_for(value: &str) -> Option<String> {
    let first = value.split(',').next()?.trim();
    for pair in first.split(';') {
        let pair = pair.trim();
        if let Some(raw) = pair
            .strip_prefix("for=")
            .or_else(|| pair.strip_prefix("For="))
            .or_else(|| pair.strip_prefix("FOR="))
        {
            let raw = raw
                .trim_matches('"')
                .trim_start_matches('[')
                .trim_end_matches(']');
            if let Some(ip) = normalize_ip(raw) {
                return Some(ip);
            }
        }
    }
    None
}

/// Canonicalizes an IP-ish string, stripping ports and brackets.
fn normalize_ip(value: &str) -> Option<String> {
    let raw = value.trim();
    if raw.is_empty() {
        return None;
    }

    let host = match raw.parse::<SocketAddr>() {
        Ok(addr) => return Some(addr.ip().to_string()),
        Err(_) => raw.trim_matches(|c| c == '[' || c == ']'),
    };

    host.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn remote() -> SocketAddr {
        // ---
        "203.0.113.9:52110".parse().unwrap()
    }

    #[test]
    fn connection_guard_counts_until_dropped() {
        // ---
        let tracker = ViewerTracker::new(DEFAULT_HLS_TTL, Duration::ZERO, "salt");

        let guard = tracker
            .track_connection(Protocol::Icecast, Some("198.51.100.4".into()))
            .expect("guard");
        assert_eq!(tracker.counts().icecast, 1);

        // Same address twice is still one distinct viewer.
        let guard2 = tracker
            .track_connection(Protocol::Icecast, Some("198.51.100.4".into()))
            .expect("guard");
        assert_eq!(tracker.counts().icecast, 1);

        drop(guard);
        assert_eq!(tracker.counts().icecast, 1);
        drop(guard2);
        assert_eq!(tracker.counts().icecast, 0);
    }

    #[test]
    fn request_presence_expires_with_ttl() {
        // ---
        let tracker = ViewerTracker::new(Duration::ZERO, Duration::ZERO, "");
        tracker.track_request(Protocol::Hls, Some("198.51.100.7".into()));

        // Zero TTL means request-scoped entries never count.
        assert_eq!(tracker.counts().hls, 0);

        let tracker = ViewerTracker::new(Duration::from_secs(60), Duration::ZERO, "");
        tracker.track_request(Protocol::Hls, Some("198.51.100.7".into()));
        assert_eq!(tracker.counts().hls, 1);
    }

    #[test]
    fn client_ip_resolution_order() {
        // ---
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.1, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(
            client_ip(&headers, remote()),
            Some("198.51.100.1".to_string())
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            "forwarded",
            "for=\"[2001:db8::1]:4711\";proto=https".parse().unwrap(),
        );
        assert_eq!(client_ip(&headers, remote()), Some("2001:db8::1".to_string()));

        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, remote()), Some("203.0.113.9".to_string()));
    }

    #[test]
    fn unparseable_forwarding_headers_fall_through() {
        // ---
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        assert_eq!(
            client_ip(&headers, remote()),
            Some("203.0.113.9".to_string())
        );
    }

    #[test]
    fn hashes_are_salted() {
        // ---
        let a = ViewerTracker::new(Duration::ZERO, Duration::ZERO, "salt-a");
        let b = ViewerTracker::new(Duration::ZERO, Duration::ZERO, "salt-b");
        assert_ne!(a.hash_ip("198.51.100.9"), b.hash_ip("198.51.100.9"));
    }
}
