//! Admission seams: the relay-side gate and the client-side authorizer.

use std::future::Future;
use std::pin::Pin;

use nestcast_protocol::ChannelName;
use nestcast_protocol::messages::GrantPayload;

use crate::grant::{AuthError, GrantKey};

/// Boxed future returned by [`Authorizer`] implementations.
pub type AuthFuture<'a> =
    Pin<Box<dyn Future<Output = Result<GrantPayload, AuthError>> + Send + 'a>>;

/// Client-side grant provider.
///
/// Consulted once per join attempt, after the connection is up and the relay
/// has assigned a connection id. Real deployments call their app backend
/// here; the backend decides and signs.
pub trait Authorizer: Send + Sync {
    fn authorize<'a>(&'a self, connection_id: &'a str, channel: &'a ChannelName) -> AuthFuture<'a>;
}

/// Relay-side admission check.
///
/// Any error denies the join. Implementations must fail closed: when in
/// doubt, return an error.
pub trait ChannelAuthGate: Send + Sync {
    fn verify(
        &self,
        connection_id: &str,
        channel: &ChannelName,
        grant: &GrantPayload,
    ) -> Result<(), AuthError>;
}

/// Gate backed by a single static key pair.
pub struct KeyGate {
    key: GrantKey,
}

impl KeyGate {
    pub fn new(key: GrantKey) -> Self {
        Self { key }
    }
}

impl ChannelAuthGate for KeyGate {
    fn verify(
        &self,
        connection_id: &str,
        channel: &ChannelName,
        grant: &GrantPayload,
    ) -> Result<(), AuthError> {
        self.key.verify(connection_id, channel.as_str(), grant)
    }
}

/// Authorizer that signs grants locally with the shared key.
///
/// Stands in for an app backend in single-operator deployments and tests,
/// where producer and relay are run by the same party.
pub struct LocalAuthorizer {
    key: GrantKey,
    identity: String,
}

impl LocalAuthorizer {
    pub fn new(key: GrantKey) -> Self {
        Self {
            key,
            identity: String::new(),
        }
    }

    pub fn with_identity(key: GrantKey, identity: impl Into<String>) -> Self {
        Self {
            key,
            identity: identity.into(),
        }
    }
}

impl Authorizer for LocalAuthorizer {
    fn authorize<'a>(&'a self, connection_id: &'a str, channel: &'a ChannelName) -> AuthFuture<'a> {
        Box::pin(async move {
            Ok(GrantPayload {
                auth: self.key.sign(connection_id, channel.as_str(), &self.identity),
                identity: self.identity.clone(),
            })
        })
    }
}
