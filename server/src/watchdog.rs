//! Cursor-stall watchdog.
//!
//! The cursor only moves when the playlist driver is writing packets, so a
//! frozen cursor means the whole pipeline is wedged — a hung file read, a
//! stuck encoder pipe, a lost driver thread. The watchdog samples the
//! cursor and, after a full stall interval without movement, restarts the
//! driver and both transcoders. Restarts are rate-limited to one per stall
//! interval so a slow recovery is not interrupted by another kick.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::engine::Engine;

/// Starts the watchdog task. A zero `stall` disables it entirely.
pub fn spawn(engine: Arc<Engine>, stall: Duration) -> Option<tokio::task::JoinHandle<()>> {
    if stall.is_zero() {
        info!("cursor watchdog disabled");
        return None;
    }

    let check_every = (stall / 2).max(Duration::from_secs(1));

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_position = engine.cursor.position();
        let mut last_change = Instant::now();
        let mut last_restart = Instant::now();

        loop {
            ticker.tick().await;

            let position = engine.cursor.position();
            if position != last_position {
                last_position = position;
                last_change = Instant::now();
                continue;
            }

            let stalled_for = last_change.elapsed();
            if stalled_for < stall || last_restart.elapsed() < stall {
                continue;
            }

            warn!(
                "cursor stalled for {stalled_for:?} at {position:?} \
                 (hls drops: {}, icecast drops: {}, webrtc drops: {}); restarting pipeline",
                engine.hls.drop_count(),
                engine.icecast.drop_count(),
                engine.sample_writer.drop_count(),
            );

            engine.restart_pipeline();
            engine.metrics.watchdog_restarts_total.inc();
            last_restart = Instant::now();
        }
    }))
}
