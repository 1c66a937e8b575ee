//! WHEP negotiation: one SDP exchange attaches a listener to the shared
//! audio track.
//!
//! The peer connection lives for as long as ICE keeps it alive; a state
//!-change hook tears it down and unregisters the session when the listener
//! goes away. The session id is only registered once the full exchange has
//! succeeded, so a malformed offer leaves no trace.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;
use uuid::Uuid;
use webrtc::api::API;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use super::{append_candidate, StreamState};
use crate::config::Config;
use opuscast_common::MetricsContext;

/// Performs the WHEP offer/answer exchange. Returns the answer SDP and the
/// registered session id.
pub async fn negotiate(
    api: &API,
    state: &Arc<StreamState>,
    cfg: &Config,
    metrics: &Arc<MetricsContext>,
    offer: String,
) -> Result<(String, String)> {
    if cfg.debug_print_offer {
        println!("{offer}");
    }

    let session_id = Uuid::new_v4().to_string();

    let mut rtc_config = RTCConfiguration::default();
    for stun in &cfg.stun_servers {
        rtc_config.ice_servers.push(RTCIceServer {
            urls: vec![format!("stun:{stun}")],
            ..Default::default()
        });
    }

    let pc = Arc::new(
        api.new_peer_connection(rtc_config)
            .await
            .context("create peer connection")?,
    );

    install_disconnect_hook(&pc, state, metrics, &session_id);

    let answer = match exchange(&pc, state, offer).await {
        Ok(answer) => answer,
        Err(e) => {
            let _ = pc.close().await;
            return Err(e);
        }
    };

    let answer = append_candidate(answer, cfg.append_candidate.as_deref());
    if cfg.debug_print_answer {
        println!("{answer}");
    }

    state.add_session(&session_id);
    metrics.whep_sessions.set(state.session_count() as i64);
    debug!("whep session {session_id} attached");

    Ok((answer, session_id))
}

/// Closes the peer and unregisters the session when ICE fails or closes.
fn install_disconnect_hook(
    pc: &Arc<RTCPeerConnection>,
    state: &Arc<StreamState>,
    metrics: &Arc<MetricsContext>,
    session_id: &str,
) {
    let pc_weak = Arc::downgrade(pc);
    let state = Arc::clone(state);
    let metrics = Arc::clone(metrics);
    let session_id = session_id.to_string();

    pc.on_ice_connection_state_change(Box::new(move |conn_state: RTCIceConnectionState| {
        let pc_weak = pc_weak.clone();
        let state = Arc::clone(&state);
        let metrics = Arc::clone(&metrics);
        let session_id = session_id.clone();

        Box::pin(async move {
            if conn_state == RTCIceConnectionState::Failed
                || conn_state == RTCIceConnectionState::Closed
            {
                if let Some(pc) = pc_weak.upgrade() {
                    let _ = pc.close().await;
                }
                state.remove_session(&session_id);
                metrics.whep_sessions.set(state.session_count() as i64);
                debug!("whep session {session_id} detached");
            }
        })
    }));
}

/// The fallible middle of the exchange, separated so the caller can close
/// the peer connection on any error.
async fn exchange(
    pc: &Arc<RTCPeerConnection>,
    state: &Arc<StreamState>,
    offer: String,
) -> Result<String> {
    let rtp_sender = pc
        .add_track(Arc::clone(&state.audio_track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .context("attach shared audio track")?;

    // Drain incoming RTCP so the interceptors keep processing reports.
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
    });

    let offer = RTCSessionDescription::offer(offer).context("parse SDP offer")?;
    pc.set_remote_description(offer)
        .await
        .context("apply SDP offer")?;

    let answer = pc.create_answer(None).await.context("create SDP answer")?;

    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .context("apply SDP answer")?;
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .context("local description missing after gathering")?;

    Ok(local.sdp)
}
