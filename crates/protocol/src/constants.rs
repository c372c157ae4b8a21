use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Current wire protocol version.
///
/// Bump this when making breaking changes to message semantics. The relay
/// reports its version in the `welcome` payload so clients can refuse to
/// talk to a relay they no longer understand.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest peer protocol version this build still accepts.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Result of a protocol version compatibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolCompatibility {
    /// Versions are compatible.
    Compatible,
    /// Peer version is not supported.
    Incompatible { peer_version: u32, reason: String },
}

/// Checks whether we can talk to a peer running `peer_version`.
///
/// Peers newer than us remain compatible: unknown message types fall into
/// [`MessageType::Unknown`] and are answered with a wire error instead of
/// breaking the connection.
pub fn check_protocol_compatibility(peer_version: u32) -> ProtocolCompatibility {
    if peer_version < MIN_PROTOCOL_VERSION {
        return ProtocolCompatibility::Incompatible {
            peer_version,
            reason: format!(
                "peer protocol v{} is older than the oldest supported v{}",
                peer_version, MIN_PROTOCOL_VERSION
            ),
        };
    }
    ProtocolCompatibility::Compatible
}

// --- WebSocket tuning -------------------------------------------------------

/// Maximum size of a single websocket message.
///
/// Sized so the largest allowed frame still fits after base64 inflation
/// plus envelope overhead.
pub const WS_MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Interval between client pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(25);

/// How long either side waits for traffic before declaring the peer dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How long a request waits for its reply before timing out.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// --- Frame limits -----------------------------------------------------------

/// Default upper bound for a single frame payload, in bytes.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Frame media types accepted when no explicit allow-list is configured.
pub const DEFAULT_ALLOWED_FRAME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];

// --- Wire error codes -------------------------------------------------------

pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_UNAUTHORIZED: i32 = 401;
pub const WS_ERR_CODE_FORBIDDEN: i32 = 403;
pub const WS_ERR_CODE_PAYLOAD_TOO_LARGE: i32 = 413;
pub const WS_ERR_CODE_UNSUPPORTED_MEDIA: i32 = 415;
pub const WS_ERR_CODE_UNPROCESSABLE: i32 = 422;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;

/// Message types exchanged between relay and clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Relay greets a freshly accepted connection.
    #[serde(rename = "welcome")]
    Welcome,

    /// Client asks to become a member of a channel.
    #[serde(rename = "join")]
    Join,

    /// Relay confirms channel membership.
    #[serde(rename = "join_ack")]
    JoinAck,

    /// A camera frame, client to relay or relay to members.
    #[serde(rename = "frame")]
    Frame,

    /// Relay acknowledges an accepted frame.
    #[serde(rename = "frame_ack")]
    FrameAck,

    /// Client drops its membership of a channel.
    #[serde(rename = "leave")]
    Leave,

    /// Error reply carrying a [`WsError`](crate::WsError).
    #[serde(rename = "error")]
    Error,

    /// Catch-all for message types this build does not know.
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serializes_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageType::JoinAck).unwrap(),
            "\"join_ack\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::Frame).unwrap(),
            "\"frame\""
        );
    }

    #[test]
    fn unknown_message_type_round_trips_to_unknown() {
        let parsed: MessageType = serde_json::from_str("\"telepathy\"").unwrap();
        assert_eq!(parsed, MessageType::Unknown);
    }

    #[test]
    fn same_version_is_compatible() {
        assert_eq!(
            check_protocol_compatibility(PROTOCOL_VERSION),
            ProtocolCompatibility::Compatible
        );
    }

    #[test]
    fn newer_peer_is_compatible() {
        assert_eq!(
            check_protocol_compatibility(PROTOCOL_VERSION + 5),
            ProtocolCompatibility::Compatible
        );
    }

    #[test]
    fn ancient_peer_is_rejected() {
        match check_protocol_compatibility(0) {
            ProtocolCompatibility::Incompatible { peer_version, .. } => {
                assert_eq!(peer_version, 0);
            }
            other => panic!("expected incompatible, got {:?}", other),
        }
    }

    #[test]
    fn max_message_fits_a_base64_inflated_frame() {
        // base64 inflates by 4/3; leave headroom for the envelope.
        assert!(WS_MAX_MESSAGE_SIZE > DEFAULT_MAX_FRAME_BYTES * 4 / 3 + 4096);
    }
}
