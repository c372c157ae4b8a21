use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameLimits, FrameRejected};

// ---------------------------------------------------------------------------
// Connection payloads
// ---------------------------------------------------------------------------

/// Sent by the relay as the first message on a fresh connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub connection_id: String,
    /// Idle window after which the relay drops the connection. Clients must
    /// produce traffic (pings count) faster than this.
    pub heartbeat_timeout_ms: u64,
    /// Protocol version spoken by the relay (0 = legacy/pre-versioning).
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub protocol_version: u32,
}

/// Asks the relay for membership of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub channel: String,
    pub grant: GrantPayload,
}

/// Authorization material accompanying a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantPayload {
    /// `key:signature` pair produced by the app backend.
    pub auth: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity: String,
}

/// Confirms channel membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAck {
    pub channel: String,
    /// Member count after the join, the joiner included.
    pub members: usize,
}

/// Drops membership of a channel. Fire-and-forget, the relay does not reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub channel: String,
}

// ---------------------------------------------------------------------------
// Frame payloads
// ---------------------------------------------------------------------------

/// A camera frame in flight, producer to relay or relay to members.
///
/// The `payload` field is base64-encoded in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    pub channel: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Media type claimed by the producer, checked against the allow-list
    /// before the bytes become a [`Frame`].
    pub declared_type: String,
    /// Producer capture time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl FramePayload {
    /// Builds the wire payload for a frame that already passed validation.
    pub fn from_frame(channel: impl Into<String>, frame: Frame) -> Self {
        let (payload, media_type, timestamp) = frame.into_parts();
        Self {
            channel: channel.into(),
            payload,
            declared_type: media_type,
            timestamp,
        }
    }

    /// Validates the carried bytes and produces a [`Frame`].
    pub fn into_frame(self, limits: &FrameLimits) -> Result<Frame, FrameRejected> {
        limits.validate(self.payload, &self.declared_type, self.timestamp)
    }
}

/// Acknowledges an accepted frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameAck {
    /// Members the frame was handed to, the sender excluded.
    pub delivered: usize,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// Serde adapter storing byte fields as standard base64 strings in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_payload_base64_roundtrip() {
        let payload = FramePayload {
            channel: "lab-cam".into(),
            payload: vec![0x48, 0x65, 0x6c, 0x6c, 0x6f],
            declared_type: "image/jpeg".into(),
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&payload).unwrap();
        // "Hello" = "SGVsbG8="
        assert!(json.contains("SGVsbG8="));
        assert!(json.contains("\"declaredType\":\"image/jpeg\""));
        let parsed: FramePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn welcome_includes_protocol_version() {
        let welcome = Welcome {
            connection_id: "c-1".into(),
            heartbeat_timeout_ms: 60_000,
            protocol_version: 1,
        };
        let json = serde_json::to_string(&welcome).unwrap();
        assert!(json.contains("\"heartbeatTimeoutMs\":60000"));
        assert!(json.contains("\"protocolVersion\":1"));
    }

    #[test]
    fn welcome_legacy_json_defaults_to_zero() {
        let json = r#"{"connectionId":"c-1","heartbeatTimeoutMs":60000}"#;
        let welcome: Welcome = serde_json::from_str(json).unwrap();
        assert_eq!(welcome.protocol_version, 0);
    }

    #[test]
    fn grant_omits_empty_identity() {
        let join = JoinRequest {
            channel: "lab-cam".into(),
            grant: GrantPayload {
                auth: "abcd1234:deadbeef".into(),
                identity: String::new(),
            },
        };
        let json = serde_json::to_string(&join).unwrap();
        assert!(!json.contains("identity"));
        let parsed: JoinRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.grant.identity, "");
    }

    #[test]
    fn into_frame_applies_limits() {
        let limits = FrameLimits::new(4, ["image/jpeg".to_string()]);
        let payload = FramePayload {
            channel: "lab-cam".into(),
            payload: vec![0u8; 5],
            declared_type: "image/jpeg".into(),
            timestamp: 0,
        };
        assert_eq!(
            payload.into_frame(&limits),
            Err(FrameRejected::TooLarge { size: 5, max: 4 })
        );
    }

    #[test]
    fn from_frame_preserves_bytes_and_type() {
        let limits = FrameLimits::default();
        let frame = limits.validate(vec![1, 2, 3], "IMAGE/PNG", 42).unwrap();
        let payload = FramePayload::from_frame("lab-cam", frame);
        assert_eq!(payload.payload, vec![1, 2, 3]);
        assert_eq!(payload.declared_type, "image/png");
        assert_eq!(payload.timestamp, 42);
        assert_eq!(payload.channel, "lab-cam");
    }
}
