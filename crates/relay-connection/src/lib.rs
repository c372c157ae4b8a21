//! Client side of the nestcast relay.
//!
//! Provides the WebSocket link, the session state machine with automatic
//! reconnection, and frame sources with the self-pacing capture loop.

pub mod capture;
pub mod link;
pub(crate) mod pumps;
pub mod session;
pub mod types;

// Re-export primary types for convenience.
pub use capture::{CaptureFuture, CapturedFrame, FrameSource, SourceError, SyntheticSource};
pub use link::{LinkError, RelayLink};
pub use session::{RelaySession, SessionError};
pub use types::{RetryPolicy, SessionConfig, SessionEvent, SessionState};
