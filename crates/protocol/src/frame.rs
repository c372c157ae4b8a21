use thiserror::Error;

use crate::constants::{
    DEFAULT_ALLOWED_FRAME_TYPES, DEFAULT_MAX_FRAME_BYTES, WS_ERR_CODE_PAYLOAD_TOO_LARGE,
    WS_ERR_CODE_UNPROCESSABLE, WS_ERR_CODE_UNSUPPORTED_MEDIA,
};

/// Reasons a frame fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameRejected {
    #[error("frame payload is empty")]
    EmptyPayload,
    #[error("frame is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("frame type {0:?} is not allowed")]
    UnsupportedType(String),
}

impl FrameRejected {
    /// Wire error code reported to the sender.
    pub fn wire_code(&self) -> i32 {
        match self {
            FrameRejected::EmptyPayload => WS_ERR_CODE_UNPROCESSABLE,
            FrameRejected::TooLarge { .. } => WS_ERR_CODE_PAYLOAD_TOO_LARGE,
            FrameRejected::UnsupportedType(_) => WS_ERR_CODE_UNSUPPORTED_MEDIA,
        }
    }
}

/// A validated camera frame.
///
/// Instances only exist for payloads that passed [`FrameLimits`] checks, so
/// downstream code never re-validates. The media type is stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
    media_type: String,
    timestamp_ms: i64,
}

impl Frame {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Capture time in milliseconds since the Unix epoch, as reported by the
    /// producer. Informational only, never used for ordering.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn into_parts(self) -> (Vec<u8>, String, i64) {
        (self.payload, self.media_type, self.timestamp_ms)
    }
}

/// Frame acceptance rules.
///
/// Checks run in a fixed order: empty payload, size, media type. Media type
/// comparison is ASCII case-insensitive.
#[derive(Debug, Clone)]
pub struct FrameLimits {
    max_frame_bytes: usize,
    allowed_types: Vec<String>,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            allowed_types: DEFAULT_ALLOWED_FRAME_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

impl FrameLimits {
    pub fn new(max_frame_bytes: usize, allowed_types: impl IntoIterator<Item = String>) -> Self {
        Self {
            max_frame_bytes,
            allowed_types: allowed_types
                .into_iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn allowed_types(&self) -> &[String] {
        &self.allowed_types
    }

    /// Checks a raw payload against the limits without building a [`Frame`].
    ///
    /// The relay uses this on ingest where the payload is only borrowed.
    pub fn check(&self, payload: &[u8], declared_type: &str) -> Result<(), FrameRejected> {
        if payload.is_empty() {
            return Err(FrameRejected::EmptyPayload);
        }
        if payload.len() > self.max_frame_bytes {
            return Err(FrameRejected::TooLarge {
                size: payload.len(),
                max: self.max_frame_bytes,
            });
        }
        let lowered = declared_type.to_ascii_lowercase();
        if !self.allowed_types.iter().any(|t| *t == lowered) {
            return Err(FrameRejected::UnsupportedType(declared_type.to_owned()));
        }
        Ok(())
    }

    /// Validates and takes ownership of a payload, producing a [`Frame`].
    pub fn validate(
        &self,
        payload: Vec<u8>,
        declared_type: &str,
        timestamp_ms: i64,
    ) -> Result<Frame, FrameRejected> {
        self.check(&payload, declared_type)?;
        Ok(Frame {
            payload,
            media_type: declared_type.to_ascii_lowercase(),
            timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_accept_a_jpeg() {
        let limits = FrameLimits::default();
        let frame = limits.validate(vec![0xFF, 0xD8, 0xFF], "image/jpeg", 1000).unwrap();
        assert_eq!(frame.payload(), &[0xFF, 0xD8, 0xFF]);
        assert_eq!(frame.media_type(), "image/jpeg");
        assert_eq!(frame.timestamp_ms(), 1000);
    }

    #[test]
    fn empty_payload_is_rejected_first() {
        let limits = FrameLimits::default();
        // Empty wins over the also-bad media type.
        assert_eq!(
            limits.check(&[], "text/html"),
            Err(FrameRejected::EmptyPayload)
        );
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let limits = FrameLimits::new(4, ["image/jpeg".to_string()]);
        assert_eq!(
            limits.check(&[0u8; 5], "image/jpeg"),
            Err(FrameRejected::TooLarge { size: 5, max: 4 })
        );
        assert!(limits.check(&[0u8; 4], "image/jpeg").is_ok());
    }

    #[test]
    fn unlisted_type_is_rejected() {
        let limits = FrameLimits::default();
        assert_eq!(
            limits.check(&[1], "video/mp4"),
            Err(FrameRejected::UnsupportedType("video/mp4".into()))
        );
    }

    #[test]
    fn media_type_match_ignores_case() {
        let limits = FrameLimits::default();
        let frame = limits.validate(vec![1], "IMAGE/JPEG", 0).unwrap();
        assert_eq!(frame.media_type(), "image/jpeg");
    }

    #[test]
    fn wire_codes_match_rejection_kind() {
        assert_eq!(FrameRejected::EmptyPayload.wire_code(), 422);
        assert_eq!(FrameRejected::TooLarge { size: 2, max: 1 }.wire_code(), 413);
        assert_eq!(FrameRejected::UnsupportedType("x".into()).wire_code(), 415);
    }
}
