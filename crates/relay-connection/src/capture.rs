//! Frame sources and the self-pacing capture loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use nestcast_protocol::channel::ChannelName;
use nestcast_protocol::constants::WS_ERR_CODE_FORBIDDEN;
use nestcast_protocol::frame::FrameLimits;

use crate::link::{LinkError, RelayLink};
use crate::types::SessionEvent;

/// One capture straight off a source, not yet validated.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub payload: Vec<u8>,
    pub media_type: String,
}

/// Errors from a frame source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("capture failed: {0}")]
    Capture(String),

    #[error("source has no more frames")]
    Exhausted,
}

/// Boxed future returned by [`FrameSource`] implementations.
pub type CaptureFuture<'a> = Pin<Box<dyn Future<Output = Result<CapturedFrame, SourceError>> + Send + 'a>>;

/// Produces frames on demand.
///
/// The pace loop calls `capture` at most once at a time, and only after the
/// previous frame was acked. Sources never need their own rate limiting.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> CaptureFuture<'_>;
}

/// Default synthetic frame size.
const SYNTHETIC_FRAME_BYTES: usize = 16 * 1024;

/// Generates JPEG-shaped test frames with a running counter.
///
/// Useful for soak tests and for running a camera without real capture
/// hardware. Frames share the JPEG SOI/EOI markers so they pass media type
/// sniffing, but the body is a deterministic byte pattern.
pub struct SyntheticSource {
    frame_size: usize,
    counter: AtomicU64,
}

impl SyntheticSource {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            counter: AtomicU64::new(0),
        }
    }

    fn next_frame(&self) -> CapturedFrame {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let size = self.frame_size.max(16);
        let mut payload = Vec::with_capacity(size);
        // SOI + APP0 marker, then a counter so every frame differs.
        payload.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
        payload.extend_from_slice(&seq.to_be_bytes());
        while payload.len() < size - 2 {
            payload.push((seq as usize + payload.len()) as u8);
        }
        // EOI
        payload.extend_from_slice(&[0xFF, 0xD9]);
        CapturedFrame {
            payload,
            media_type: "image/jpeg".into(),
        }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new(SYNTHETIC_FRAME_BYTES)
    }
}

impl FrameSource for SyntheticSource {
    fn capture(&self) -> CaptureFuture<'_> {
        Box::pin(async move { Ok(self.next_frame()) })
    }
}

/// Capture-validate-publish loop for producer sessions.
///
/// Self-pacing: at most one frame is in flight, and consecutive captures
/// are at least `interval` apart. A slow relay therefore throttles the
/// producer instead of building a queue.
pub(crate) async fn pace_loop(
    link: Arc<RelayLink>,
    source: Arc<dyn FrameSource>,
    channel: ChannelName,
    limits: FrameLimits,
    interval: Duration,
    events_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let captured = tokio::select! {
            _ = cancel.cancelled() => break,
            c = source.capture() => c,
        };

        let captured = match captured {
            Ok(c) => c,
            Err(SourceError::Exhausted) => {
                debug!("frame source exhausted");
                break;
            }
            Err(SourceError::Capture(reason)) => {
                warn!(%reason, "frame capture failed");
                if pace(&cancel, interval).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let timestamp = chrono::Utc::now().timestamp_millis();
        let frame = match limits.validate(captured.payload, &captured.media_type, timestamp) {
            Ok(frame) => frame,
            Err(rejected) => {
                let reason = rejected.to_string();
                warn!(%reason, "dropping frame before send");
                let _ = events_tx.try_send(SessionEvent::FrameRejected { reason });
                if pace(&cancel, interval).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let published = tokio::select! {
            _ = cancel.cancelled() => break,
            r = link.publish(channel.as_str(), frame) => r,
        };

        match published {
            Ok(ack) => trace!(delivered = ack.delivered, "frame accepted"),
            Err(LinkError::Relay { code, message }) if code == WS_ERR_CODE_FORBIDDEN => {
                // Membership is gone on the relay side. Drop the link so the
                // session reconnects and rejoins.
                warn!(%message, "relay dropped our membership, forcing rejoin");
                link.close().await;
                break;
            }
            Err(LinkError::Relay { code, message }) => {
                warn!(code, %message, "relay refused frame");
                let _ = events_tx.try_send(SessionEvent::FrameRejected { reason: message });
            }
            Err(LinkError::Timeout) => {
                warn!("frame ack timed out");
            }
            Err(LinkError::Closed) => break,
            Err(e) => {
                warn!(error = %e, "frame publish failed");
                break;
            }
        }

        if pace(&cancel, interval).await.is_err() {
            break;
        }
    }
}

/// Sleeps out the capture interval. Errors when cancelled.
async fn pace(cancel: &CancellationToken, interval: Duration) -> Result<(), ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}
