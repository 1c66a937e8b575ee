//! Environment-derived server configuration.
//!
//! All tunables come from the process environment, optionally seeded from a
//! `.env.production` file next to the working directory or the executable.
//! Parsing happens once at startup into a plain struct; nothing else in
//! the server reads environment variables at runtime.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

pub const DEFAULT_ENV_FILE: &str = ".env.production";
pub const DEFAULT_STATION_NAME: &str = "Opuscast";
pub const DEFAULT_CURSOR_STALL: Duration = Duration::from_secs(10);

/// How NAT-rewritten ICE candidates are advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatCandidateType {
    Host,
    Srflx,
}

#[derive(Debug, Clone)]
pub struct Config {
    // HTTP surface
    pub http_address: String,
    pub ssl_key: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub enable_http_redirect: bool,
    pub https_redirect_port: u16,
    pub disable_frontend: bool,
    pub frontend_dir: PathBuf,

    // Media + transcoding
    pub media_dir: PathBuf,
    pub hls_output_dir: PathBuf,
    pub hls_segment_cache_control: Option<String>,
    pub ffmpeg_bin: String,
    pub ffmpeg_loglevel_hls: String,
    pub station_name: String,

    // Playback resume policy
    pub resume_timestamp: Option<Duration>,
    pub random_timestamp: Option<Duration>,

    // WebRTC transport shaping
    pub stun_servers: Vec<String>,
    pub nat_1to1_ips: Vec<String>,
    pub include_public_ip_in_nat_1to1: bool,
    pub nat_ice_candidate_type: NatCandidateType,
    pub udp_mux_port: Option<u16>,
    pub tcp_mux_address: Option<String>,
    pub tcp_mux_force: bool,
    pub interface_filter: Option<String>,
    pub network_types: Vec<String>,
    pub include_loopback_candidate: bool,
    pub append_candidate: Option<String>,

    // Supervision + viewers
    pub cursor_stall_timeout: Duration,
    pub viewer_ttl_hls: Duration,
    pub viewer_ttl_icecast: Duration,
    pub viewer_hash_salt: String,

    // Diagnostics
    pub disable_status: bool,
    pub debug_print_offer: bool,
    pub debug_print_answer: bool,
}

impl Config {
    // ---
    /// Reads every recognized variable from the environment.
    pub fn from_env() -> Result<Self> {
        let station_name = var("STATION_NAME")
            .or_else(|| var("STREAM_NAME"))
            .unwrap_or_else(|| DEFAULT_STATION_NAME.to_string());

        let https_redirect_port = match var("HTTPS_REDIRECT_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("HTTPS_REDIRECT_PORT {raw:?} is not a port"))?,
            None => 80,
        };

        let udp_mux_port = var("UDP_MUX_PORT_WHEP")
            .or_else(|| var("UDP_MUX_PORT"))
            .map(|raw| {
                raw.parse::<u16>()
                    .with_context(|| format!("UDP mux port {raw:?} is not a port"))
            })
            .transpose()?;

        let nat_ice_candidate_type = match var("NAT_ICE_CANDIDATE_TYPE").as_deref() {
            Some("srflx") => NatCandidateType::Srflx,
            _ => NatCandidateType::Host,
        };

        Ok(Self {
            http_address: var("HTTP_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            ssl_key: var("SSL_KEY").map(PathBuf::from),
            ssl_cert: var("SSL_CERT").map(PathBuf::from),
            enable_http_redirect: flag("ENABLE_HTTP_REDIRECT")
                || env::var_os("HTTPS_REDIRECT_PORT").is_some(),
            https_redirect_port,
            disable_frontend: flag("DISABLE_FRONTEND"),
            frontend_dir: PathBuf::from("./web/build"),

            media_dir: var("MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("media")),
            hls_output_dir: var("HLS_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("hls")),
            hls_segment_cache_control: var("HLS_SEGMENT_CACHE_CONTROL"),
            ffmpeg_bin: var("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
            ffmpeg_loglevel_hls: var("FFMPEG_LOGLEVEL_HLS")
                .unwrap_or_else(|| "warning".to_string()),
            station_name,

            resume_timestamp: duration_var("RESUME_TIMESTAMP"),
            random_timestamp: duration_var("RANDOM_TIMESTAMP"),

            stun_servers: list_var("STUN_SERVERS"),
            nat_1to1_ips: list_var("NAT_1_TO_1_IP"),
            include_public_ip_in_nat_1to1: flag("INCLUDE_PUBLIC_IP_IN_NAT_1_TO_1_IP"),
            nat_ice_candidate_type,
            udp_mux_port,
            tcp_mux_address: var("TCP_MUX_ADDRESS"),
            tcp_mux_force: flag("TCP_MUX_FORCE"),
            interface_filter: var("INTERFACE_FILTER"),
            network_types: list_var("NETWORK_TYPES"),
            include_loopback_candidate: flag("INCLUDE_LOOPBACK_CANDIDATE"),
            append_candidate: var("APPEND_CANDIDATE"),

            cursor_stall_timeout: duration_var("CURSOR_STALL_TIMEOUT")
                .unwrap_or(DEFAULT_CURSOR_STALL),
            viewer_ttl_hls: duration_var("VIEWER_TTL_HLS")
                .unwrap_or(crate::viewers::DEFAULT_HLS_TTL),
            viewer_ttl_icecast: duration_var("VIEWER_TTL_ICECAST")
                .unwrap_or(crate::viewers::DEFAULT_ICECAST_TTL),
            viewer_hash_salt: var("VIEWER_HASH_SALT").unwrap_or_default(),

            disable_status: flag("DISABLE_STATUS"),
            debug_print_offer: flag("DEBUG_PRINT_OFFER"),
            debug_print_answer: flag("DEBUG_PRINT_ANSWER"),
        })
    }

    /// Listen address with a Go-style bare `:port` made bindable.
    pub fn bind_address(&self) -> String {
        if self.http_address.starts_with(':') {
            format!("0.0.0.0{}", self.http_address)
        } else {
            self.http_address.clone()
        }
    }

    pub fn tls_pair(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.ssl_cert, &self.ssl_key) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }
}

/// Loads the env file, trying the working directory first and the
/// executable's directory second. A missing file in both places is fine —
/// everything can come from the real environment.
pub fn load_env_file(name: &str) -> Result<()> {
    if dotenvy::from_filename(name).is_ok() {
        return Ok(());
    }

    let exe = env::current_exe().context("locate executable")?;
    if let Some(dir) = exe.parent() {
        let candidate = dir.join(name);
        if candidate.exists() {
            dotenvy::from_path(&candidate)
                .with_context(|| format!("load {}", candidate.display()))?;
            return Ok(());
        }
    }

    warn!("no {name} found; using process environment only");
    Ok(())
}

fn var(name: &str) -> Option<String> {
    let value = env::var(name).ok()?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Presence-style booleans: any non-empty value enables.
fn flag(name: &str) -> bool {
    var(name).is_some()
}

fn list_var(name: &str) -> Vec<String> {
    var(name)
        .map(|raw| {
            raw.split('|')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn duration_var(name: &str) -> Option<Duration> {
    let raw = var(name)?;
    match parse_flexible_duration(&raw) {
        Some(d) => Some(d),
        None => {
            warn!("ignoring unparseable duration {name}={raw:?}");
            None
        }
    }
}

/// Parses `90s` / `1m30s` / `250ms` / `2h`-style strings, or a bare number
/// of (possibly fractional) seconds. Zero and negative values collapse to
/// zero; garbage yields `None`.
pub fn parse_flexible_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    // Bare numbers are seconds.
    if let Ok(secs) = raw.parse::<f64>() {
        if !secs.is_finite() || secs <= 0.0 {
            return Some(Duration::ZERO);
        }
        return Some(Duration::from_secs_f64(secs));
    }

    // Otherwise a sequence of <number><unit> terms.
    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return None;
        }
        let value: f64 = rest[..digits_end].parse().ok()?;
        rest = &rest[digits_end..];

        let (unit_len, unit_nanos) = if rest.starts_with("ms") {
            (2, 1_000_000.0)
        } else if rest.starts_with("us") {
            (2, 1_000.0)
        } else if rest.starts_with("µs") {
            ("µs".len(), 1_000.0)
        } else if rest.starts_with("ns") {
            (2, 1.0)
        } else if rest.starts_with('s') {
            (1, 1_000_000_000.0)
        } else if rest.starts_with('m') {
            (1, 60.0 * 1_000_000_000.0)
        } else if rest.starts_with('h') {
            (1, 3600.0 * 1_000_000_000.0)
        } else {
            return None;
        };

        total += Duration::from_nanos((value * unit_nanos) as u64);
        rest = &rest[unit_len..];
    }

    Some(total)
}
