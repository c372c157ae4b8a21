pub mod channel;
pub mod constants;
pub mod envelope;
pub mod frame;
pub mod messages;

// Re-export primary types for convenience.
pub use channel::{CHANNEL_NAME_MAX_LEN, ChannelName, ChannelNameError};
pub use constants::{MessageType, ProtocolCompatibility, check_protocol_compatibility};
pub use envelope::{Message, WsError};
pub use frame::{Frame, FrameLimits, FrameRejected};
