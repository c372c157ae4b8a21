//! Public types for relay sessions.

use std::time::Duration;

use nestcast_protocol::channel::ChannelName;
use nestcast_protocol::frame::{Frame, FrameLimits};

/// Connection state of a relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected and not trying to be.
    Disconnected,
    /// Link and join handshake in progress.
    Connecting,
    /// Joined the channel, frames can flow.
    Connected,
    /// Link lost, waiting out the backoff before the next attempt.
    Reconnecting { attempt: u32 },
    /// Gave up: admission denied or retries exhausted. Terminal until the
    /// session is started again.
    Failed,
}

/// Events emitted by a relay session.
///
/// Lifecycle events arrive in state-machine order. Frame events are
/// best-effort: a consumer that stops draining loses frames, never
/// lifecycle ordering.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Joined the channel.
    Connected,
    /// Link lost or session stopped.
    Disconnected { reason: String },
    /// Waiting to retry.
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// The session gave up.
    Failed,
    /// A frame arrived from the channel.
    FrameReceived(Frame),
    /// An outgoing or incoming frame failed validation or was refused.
    FrameRejected { reason: String },
}

/// Deterministic exponential backoff for reconnect attempts.
///
/// Attempt `n` (1-based) waits `base_delay * 2^(n-1)`, capped at
/// `max_delay`. No jitter: a given attempt number always produces the
/// same delay, which keeps recovery timing predictable and testable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Retries before the session gives up. Zero means fail on the first
    /// lost connection.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    /// Delay for a given attempt number (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = 2u32.saturating_pow(exp);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Everything a session needs to reach and use one channel.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay WebSocket URL, e.g. `ws://127.0.0.1:3001`.
    pub url: String,
    pub channel: ChannelName,
    /// Local validation limits. Producers check frames before sending so
    /// oversized captures never hit the wire.
    pub limits: FrameLimits,
    /// Floor between consecutive captures. The pace loop also waits for
    /// each frame's ack, so the effective rate can be lower.
    pub min_capture_interval: Duration,
    pub retry: RetryPolicy,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>, channel: ChannelName) -> Self {
        Self {
            url: url.into(),
            channel,
            limits: FrameLimits::default(),
            min_capture_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}
