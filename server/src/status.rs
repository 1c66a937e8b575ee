//! Status endpoint payloads.

use serde::Serialize;

use crate::engine::Engine;

/// Public status of the (single) audio stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub stream_key: String,
    pub first_seen_epoch: u64,
    pub listener_count: usize,
    pub now_playing: String,
    pub artists: Vec<String>,
    pub cursor_ms: u64,
}

/// Builds the one-element status array served by `/api/status`.
pub fn stream_statuses(engine: &Engine) -> Vec<StreamStatus> {
    let (mut title, artists) = engine.stream.now_playing();
    if title.trim().is_empty() {
        title = "-".to_string();
    }

    vec![StreamStatus {
        stream_key: "default".to_string(),
        first_seen_epoch: engine.stream.first_seen_epoch,
        listener_count: engine.stream.session_count(),
        now_playing: title,
        artists,
        cursor_ms: engine.cursor.position().as_millis() as u64,
    }]
}
