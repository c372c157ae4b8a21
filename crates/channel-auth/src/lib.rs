//! Channel admission for the nestcast relay.
//!
//! Clients obtain a grant from an [`Authorizer`] and present it when joining
//! a channel; the relay checks it through a [`ChannelAuthGate`]. The built-in
//! [`GrantKey`] scheme signs grants with a shared secret, so the relay never
//! needs to reach the app backend on the join path.

pub mod gate;
pub mod grant;

// Re-export primary types for convenience.
pub use gate::{AuthFuture, Authorizer, ChannelAuthGate, KeyGate, LocalAuthorizer};
pub use grant::{AuthError, GrantKey};
