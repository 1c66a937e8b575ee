//! Bounded queue between the playlist driver and the shared audio track.
//!
//! The driver thread must keep real-time pacing no matter what the RTP
//! side is doing, so pushes never block: a full queue drops the sample and
//! counts it. A drain task owns the only `write_sample` call site.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Queue depth between driver and track.
pub const SAMPLE_QUEUE_SLOTS: usize = 256;

struct QueuedSample {
    data: Bytes,
    duration: Duration,
}

/// Non-blocking producer handle for the shared audio track.
pub struct SampleWriter {
    // ---
    tx: mpsc::Sender<QueuedSample>,
    drops: AtomicU64,
    full_logged: AtomicBool,
    shutdown: CancellationToken,
}

impl SampleWriter {
    // ---
    /// Spawns the drain task writing into `track`.
    pub fn start(track: Arc<TrackLocalStaticSample>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(SAMPLE_QUEUE_SLOTS);
        let shutdown = CancellationToken::new();

        tokio::spawn(drain(track, rx, shutdown.clone()));

        Arc::new(Self {
            tx,
            drops: AtomicU64::new(0),
            full_logged: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Enqueues one sample; drops and counts when the queue is full.
    pub fn push(&self, data: Bytes, duration: Duration) {
        if self.shutdown.is_cancelled() {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self
            .tx
            .try_send(QueuedSample { data, duration })
            .is_err()
        {
            self.drops.fetch_add(1, Ordering::Relaxed);
            if !self.full_logged.swap(true, Ordering::Relaxed) {
                warn!("webrtc sample queue full; dropping audio");
            }
        }
    }

    /// Samples dropped since start. Never decreases.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Stops the drain task; repeated calls are no-ops.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn drain(
    track: Arc<TrackLocalStaticSample>,
    mut rx: mpsc::Receiver<QueuedSample>,
    shutdown: CancellationToken,
) {
    let mut error_logged = false;

    loop {
        let sample = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = rx.recv() => match received {
                Some(sample) => sample,
                None => return,
            },
        };

        let result = track
            .write_sample(&Sample {
                data: sample.data,
                duration: sample.duration,
                ..Default::default()
            })
            .await;

        if let Err(e) = result {
            // A closed pipe just means no listener is bound yet.
            if !matches!(e, webrtc::Error::ErrClosedPipe) && !error_logged {
                error_logged = true;
                warn!("audio track write failed, further errors muted: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn unbound_track() -> Arc<TrackLocalStaticSample> {
        // ---
        use webrtc::api::media_engine::MIME_TYPE_OPUS;
        use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "test".to_owned(),
        ))
    }

    #[tokio::test]
    async fn push_never_blocks_and_counts_overflow() {
        // ---
        let writer = SampleWriter::start(unbound_track());

        // Saturate far past the queue depth; the driver-side call must
        // return immediately every time.
        for _ in 0..(SAMPLE_QUEUE_SLOTS * 4) {
            writer.push(Bytes::from_static(&[0u8; 16]), Duration::from_millis(20));
        }

        // Unbound tracks accept writes, so the drain may keep up; only the
        // monotonicity of the counter is guaranteed here.
        let first = writer.drop_count();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(writer.drop_count() >= first);

        writer.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_after() {
        // ---
        let writer = SampleWriter::start(unbound_track());
        writer.close();
        writer.close();

        let before = writer.drop_count();
        writer.push(Bytes::from_static(b"x"), Duration::from_millis(20));
        assert_eq!(writer.drop_count(), before + 1);
    }
}
