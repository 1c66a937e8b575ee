//! WebRTC egress: the shared audio track and its negotiation machinery.
//!
//! One Opus track is shared by every WHEP listener; the playlist driver's
//! sample writer is its only producer. The `API` object (media engine,
//! interceptors, setting engine) is built once at startup from the
//! environment-shaped transport options.

mod sample_writer;
mod whep;

pub use sample_writer::{SampleWriter, SAMPLE_QUEUE_SLOTS};
pub use whep::negotiate;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::{Config, NatCandidateType};

pub const OPUS_PAYLOAD_TYPE: u8 = 111;
pub const OPUS_CLOCK_RATE: u32 = 48_000;
pub const OPUS_CHANNELS: u16 = 2;
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1;maxaveragebitrate=192000";

/// Per-stream broadcast state shared across the HTTP and playlist layers.
pub struct StreamState {
    // ---
    pub first_seen_epoch: u64,

    /// Single shared Opus track for all listeners.
    pub audio_track: Arc<TrackLocalStaticSample>,

    whep_sessions: Mutex<HashSet<String>>,
    now_playing: RwLock<NowPlaying>,
}

struct NowPlaying {
    title: String,
    artists: Vec<String>,
}

impl StreamState {
    // ---
    pub fn new() -> Arc<Self> {
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: OPUS_CHANNELS,
                ..Default::default()
            },
            "audio".to_owned(),
            "opuscast".to_owned(),
        ));

        Arc::new(Self {
            first_seen_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            audio_track,
            whep_sessions: Mutex::new(HashSet::new()),
            // Defaults so /api/status is never blank or null.
            now_playing: RwLock::new(NowPlaying {
                title: "-".to_string(),
                artists: Vec::new(),
            }),
        })
    }

    /// Updates the shared metadata used by the status endpoint.
    pub fn publish_now_playing(&self, title: &str, artists: &[String]) {
        let mut np = self.now_playing.write().expect("now playing poisoned");
        np.title = if title.trim().is_empty() {
            "-".to_string()
        } else {
            title.to_string()
        };
        np.artists = artists.to_vec();
    }

    pub fn now_playing(&self) -> (String, Vec<String>) {
        let np = self.now_playing.read().expect("now playing poisoned");
        (np.title.clone(), np.artists.clone())
    }

    pub fn add_session(&self, session_id: &str) {
        self.whep_sessions
            .lock()
            .expect("sessions poisoned")
            .insert(session_id.to_string());
    }

    pub fn remove_session(&self, session_id: &str) {
        self.whep_sessions
            .lock()
            .expect("sessions poisoned")
            .remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.whep_sessions.lock().expect("sessions poisoned").len()
    }
}

/// Builds the process-wide WebRTC `API` from the transport config.
pub async fn build_api(cfg: &Config) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    populate_media_engine(&mut media_engine)?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .context("register webrtc interceptors")?;

    let setting_engine = create_setting_engine(cfg).await?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

/// Registers only Opus (48 kHz, stereo).
fn populate_media_engine(media_engine: &mut MediaEngine) -> Result<()> {
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: OPUS_CLOCK_RATE,
                    channels: OPUS_CHANNELS,
                    sdp_fmtp_line: OPUS_FMTP.to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: OPUS_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .context("register opus codec")
}

async fn create_setting_engine(cfg: &Config) -> Result<SettingEngine> {
    let mut engine = SettingEngine::default();

    let mut network_types = parse_network_types(&cfg.network_types);
    if network_types.is_empty() {
        network_types = vec![NetworkType::Udp4, NetworkType::Udp6];
    }

    let mut nat_ips = Vec::new();
    if cfg.include_public_ip_in_nat_1to1 {
        let ip = fetch_public_ip()
            .await
            .context("resolve public IP for NAT 1:1 rewriting")?;
        nat_ips.push(ip);
    }
    nat_ips.extend(cfg.nat_1to1_ips.iter().cloned());

    if !nat_ips.is_empty() {
        let candidate_type = match cfg.nat_ice_candidate_type {
            NatCandidateType::Host => RTCIceCandidateType::Host,
            NatCandidateType::Srflx => RTCIceCandidateType::Srflx,
        };
        engine.set_nat_1to1_ips(nat_ips, candidate_type);
    }

    if let Some(filter) = cfg.interface_filter.clone() {
        engine.set_interface_filter(Box::new(move |iface: &str| iface == filter));
    }

    if let Some(port) = cfg.udp_mux_port {
        let socket = tokio::net::UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("bind UDP mux port {port}"))?;
        let udp_mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
        engine.set_udp_network(UDPNetwork::Muxed(udp_mux));
    }

    if cfg.tcp_mux_address.is_some() || cfg.tcp_mux_force {
        // The underlying stack has no ICE-TCP mux; half-wiring it would
        // only produce dead candidates.
        warn!("TCP_MUX_ADDRESS/TCP_MUX_FORCE are not supported; ignoring");
    }

    engine.set_include_loopback_candidate(cfg.include_loopback_candidate);
    engine.set_network_types(network_types);

    Ok(engine)
}

fn parse_network_types(raw: &[String]) -> Vec<NetworkType> {
    let mut out = Vec::new();
    for name in raw {
        match name.to_ascii_lowercase().as_str() {
            "udp4" => out.push(NetworkType::Udp4),
            "udp6" => out.push(NetworkType::Udp6),
            "tcp4" => out.push(NetworkType::Tcp4),
            "tcp6" => out.push(NetworkType::Tcp6),
            other => warn!("ignoring unknown network type {other:?}"),
        }
    }
    out
}

#[derive(Deserialize)]
struct IpApiResponse {
    query: String,
}

/// Asks an external service for the server's public address. Startup-only.
async fn fetch_public_ip() -> Result<String> {
    let response: IpApiResponse = reqwest::get("http://ip-api.com/json/")
        .await
        .context("query ip-api.com")?
        .json()
        .await
        .context("decode ip-api.com response")?;

    if response.query.is_empty() {
        anyhow::bail!("ip-api.com returned an empty address");
    }
    Ok(response.query)
}

/// Splices an operator-supplied candidate line ahead of end-of-candidates.
pub fn append_candidate(answer: String, extra: Option<&str>) -> String {
    let Some(extra) = extra else {
        return answer;
    };
    match answer.find("a=end-of-candidates") {
        Some(idx) => {
            let mut out = String::with_capacity(answer.len() + extra.len());
            out.push_str(&answer[..idx]);
            out.push_str(extra);
            out.push_str(&answer[idx..]);
            out
        }
        None => answer,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn now_playing_defaults_are_never_blank() {
        // ---
        let state = StreamState::new();
        let (title, artists) = state.now_playing();
        assert_eq!(title, "-");
        assert!(artists.is_empty());

        state.publish_now_playing("   ", &[]);
        assert_eq!(state.now_playing().0, "-");

        state.publish_now_playing("Song", &["a".to_string()]);
        assert_eq!(state.now_playing(), ("Song".to_string(), vec!["a".to_string()]));
    }

    #[test]
    fn session_registry_counts_distinct_ids() {
        // ---
        let state = StreamState::new();
        state.add_session("a");
        state.add_session("b");
        state.add_session("a");
        assert_eq!(state.session_count(), 2);

        state.remove_session("a");
        state.remove_session("a");
        assert_eq!(state.session_count(), 1);
    }

    #[test]
    fn candidate_is_spliced_before_end_marker() {
        // ---
        let answer = "v=0\r\na=candidate:1 1 udp 1 10.0.0.1 5000 typ host\r\na=end-of-candidates\r\n";
        let extra = "a=candidate:2 1 udp 1 203.0.113.1 5000 typ srflx\r\n";

        let spliced = append_candidate(answer.to_string(), Some(extra));
        let end = spliced.find("a=end-of-candidates").unwrap();
        let added = spliced.find("typ srflx").unwrap();
        assert!(added < end);

        // No marker, no change.
        let unchanged = append_candidate("v=0\r\n".to_string(), Some(extra));
        assert_eq!(unchanged, "v=0\r\n");

        // No extra candidate, no change.
        assert_eq!(append_candidate(answer.to_string(), None), answer);
    }

    #[test]
    fn network_type_parsing_skips_unknowns() {
        // ---
        let parsed = parse_network_types(&[
            "udp4".to_string(),
            "bogus".to_string(),
            "TCP6".to_string(),
        ]);
        assert_eq!(parsed, vec![NetworkType::Udp4, NetworkType::Tcp6]);
    }
}
