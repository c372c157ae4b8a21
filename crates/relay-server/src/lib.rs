//! WebSocket relay server for nestcast.
//!
//! Accepts producer and consumer connections, admits them into named
//! channels through a pluggable auth gate, and fans frames out to every
//! other member of the channel.

mod connection;
mod hub;
mod server;

// Re-export primary types for convenience.
pub use hub::{AdmissionError, PublishError, RelayHub};
pub use server::{RelayServer, ServerConfig};

/// Per-connection send buffer capacity (messages).
///
/// Kept small on purpose: when a consumer stops draining its socket, the
/// buffer saturates and further frames for it are dropped instead of being
/// queued without bound. Control replies wait for space, frames do not.
pub const SEND_BUFFER_SIZE: usize = 8;

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
