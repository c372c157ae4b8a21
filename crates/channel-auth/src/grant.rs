//! Keyed channel grants.
//!
//! A grant is the string `key:signature`, where the signature is a keyed
//! SHA-256 over the connection id, the channel name and an optional identity.
//! Whoever holds the secret can mint grants; the relay only ever sees the
//! public key half and the signature.

use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use nestcast_protocol::messages::GrantPayload;

/// Public key length in bytes (produces 16 hex characters).
const KEY_BYTES: usize = 8;

/// Secret length in bytes (produces 48 hex characters).
const SECRET_BYTES: usize = 24;

/// Reasons a grant fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("grant is not a key:signature pair")]
    MalformedGrant,
    #[error("grant key is not known to this relay")]
    UnknownKey,
    #[error("grant signature does not match")]
    BadSignature,
    #[error("authorization denied: {0}")]
    Denied(String),
}

/// A key pair for minting and verifying channel grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantKey {
    key: String,
    secret: String,
}

impl GrantKey {
    /// Generates a fresh key pair from the thread CSPRNG.
    pub fn generate() -> Self {
        Self {
            key: random_hex(KEY_BYTES),
            secret: random_hex(SECRET_BYTES),
        }
    }

    /// Builds a key pair from stored configuration values.
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
        }
    }

    /// The public half, safe to log and to embed in grants.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The secret half, for persisting to configuration. Never log it.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Mints the `key:signature` auth string for one connection and channel.
    ///
    /// Pass an empty `identity` for anonymous members. The signature binds
    /// the identity when present, so it cannot be swapped in transit.
    pub fn sign(&self, connection_id: &str, channel: &str, identity: &str) -> String {
        format!(
            "{}:{}",
            self.key,
            self.signature(connection_id, channel, identity)
        )
    }

    /// Checks a received grant for this connection and channel.
    pub fn verify(
        &self,
        connection_id: &str,
        channel: &str,
        grant: &GrantPayload,
    ) -> Result<(), AuthError> {
        let (key, signature) = grant.auth.split_once(':').ok_or(AuthError::MalformedGrant)?;
        if key.is_empty() || signature.is_empty() {
            return Err(AuthError::MalformedGrant);
        }
        if key != self.key {
            return Err(AuthError::UnknownKey);
        }
        let expected = self.signature(connection_id, channel, &grant.identity);
        if !constant_time_eq(signature, &expected) {
            return Err(AuthError::BadSignature);
        }
        Ok(())
    }

    fn signature(&self, connection_id: &str, channel: &str, identity: &str) -> String {
        let mut to_sign = format!("{connection_id}:{channel}");
        if !identity.is_empty() {
            to_sign.push(':');
            to_sign.push_str(identity);
        }
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(to_sign.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// Compares two strings without short-circuiting on the first mismatch.
fn constant_time_eq(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}
