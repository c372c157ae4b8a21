//! WebSocket pump tasks shared by the relay link.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
