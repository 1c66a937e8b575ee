//! Prometheus metrics (Rust `prometheus` crate).
//!
//! One `MetricsContext` is intended per process. The server owns the registry
//! and exposes it through its own HTTP router (`GET /metrics`), so this module
//! only provides the registry plus typed handles and a text encoder.

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus metrics registry + handles.
///
/// This is a thin, explicit wrapper around the `prometheus` crate so hot-path
/// instrumentation is just counter increments / gauge stores.
#[derive(Clone)]
pub struct MetricsContext {
    // ---
    registry: Registry,

    // Broadcast counters
    pub packets_streamed_total: IntCounter,
    pub bytes_streamed_total: IntCounter,
    pub tracks_played_total: IntCounter,
    pub transcoder_restarts_total: IntCounter,
    pub watchdog_restarts_total: IntCounter,

    // Listener gauges
    pub whep_sessions: IntGauge,
    pub hls_viewers: IntGauge,
    pub icecast_viewers: IntGauge,

    // Timeline + drop gauges (sampled from component drop counters)
    pub cursor_position_seconds: IntGauge,
    pub hls_dropped_writes: IntGauge,
    pub icecast_dropped_writes: IntGauge,
    pub webrtc_dropped_samples: IntGauge,
}

impl MetricsContext {
    // ---
    /// Create a new registry and register the standard metrics.
    ///
    /// `process_name` is applied as a constant label (`process=<name>`).
    pub fn new(process_name: &str) -> Result<Self> {
        // ---
        let registry = Registry::new_custom(
            Some("opuscast".into()),
            Some(prometheus::labels! { "process".to_string() => process_name.to_string() }),
        )?;

        let packets_streamed_total = IntCounter::with_opts(Opts::new(
            "opus_packets_streamed_total",
            "Total Opus packets written to the shared audio track",
        ))?;
        let bytes_streamed_total = IntCounter::with_opts(Opts::new(
            "opus_bytes_streamed_total",
            "Total Opus payload bytes written to the shared audio track",
        ))?;
        let tracks_played_total = IntCounter::with_opts(Opts::new(
            "tracks_played_total",
            "Total catalog tracks the playlist driver has finished",
        ))?;
        let transcoder_restarts_total = IntCounter::with_opts(Opts::new(
            "transcoder_restarts_total",
            "Total encoder subprocess restarts across transports",
        ))?;
        let watchdog_restarts_total = IntCounter::with_opts(Opts::new(
            "watchdog_restarts_total",
            "Total pipeline restarts triggered by the cursor watchdog",
        ))?;

        let whep_sessions = IntGauge::with_opts(Opts::new(
            "whep_sessions",
            "Currently registered WHEP listener sessions",
        ))?;
        let hls_viewers = IntGauge::with_opts(Opts::new(
            "hls_viewers",
            "Distinct HLS viewers within their presence TTL",
        ))?;
        let icecast_viewers = IntGauge::with_opts(Opts::new(
            "icecast_viewers",
            "Distinct Icecast viewers with an active connection",
        ))?;

        let cursor_position_seconds = IntGauge::with_opts(Opts::new(
            "cursor_position_seconds",
            "Shared audio cursor position in whole seconds",
        ))?;
        let hls_dropped_writes = IntGauge::with_opts(Opts::new(
            "hls_dropped_writes",
            "Ogg writes dropped on the HLS encoder pipe so far",
        ))?;
        let icecast_dropped_writes = IntGauge::with_opts(Opts::new(
            "icecast_dropped_writes",
            "Ogg writes dropped on the Icecast encoder pipe so far",
        ))?;
        let webrtc_dropped_samples = IntGauge::with_opts(Opts::new(
            "webrtc_dropped_samples",
            "Audio samples dropped on the WebRTC write queue so far",
        ))?;

        // Register all metrics
        registry.register(Box::new(packets_streamed_total.clone()))?;
        registry.register(Box::new(bytes_streamed_total.clone()))?;
        registry.register(Box::new(tracks_played_total.clone()))?;
        registry.register(Box::new(transcoder_restarts_total.clone()))?;
        registry.register(Box::new(watchdog_restarts_total.clone()))?;
        registry.register(Box::new(whep_sessions.clone()))?;
        registry.register(Box::new(hls_viewers.clone()))?;
        registry.register(Box::new(icecast_viewers.clone()))?;
        registry.register(Box::new(cursor_position_seconds.clone()))?;
        registry.register(Box::new(hls_dropped_writes.clone()))?;
        registry.register(Box::new(icecast_dropped_writes.clone()))?;
        registry.register(Box::new(webrtc_dropped_samples.clone()))?;

        Ok(Self {
            registry,
            packets_streamed_total,
            bytes_streamed_total,
            tracks_played_total,
            transcoder_restarts_total,
            watchdog_restarts_total,
            whep_sessions,
            hls_viewers,
            icecast_viewers,
            cursor_position_seconds,
            hls_dropped_writes,
            icecast_dropped_writes,
            webrtc_dropped_samples,
        })
    }

    /// Gather metric families from this registry.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        // ---
        self.registry.gather()
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        // ---
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
