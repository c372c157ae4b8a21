//! Channel registry and frame fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, trace};

use nestcast_channel_auth::ChannelAuthGate;
use nestcast_protocol::channel::{ChannelName, ChannelNameError};
use nestcast_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_FORBIDDEN, WS_ERR_CODE_INTERNAL,
    WS_ERR_CODE_UNAUTHORIZED,
};
use nestcast_protocol::envelope::Message;
use nestcast_protocol::frame::{FrameLimits, FrameRejected};
use nestcast_protocol::messages::{FramePayload, GrantPayload};

/// Why a join request was refused.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("bad channel name: {0}")]
    BadChannelName(#[from] ChannelNameError),

    /// The auth gate did not accept the grant. The detailed cause stays in
    /// the server log; the client only learns that it was not let in.
    #[error("unauthorized")]
    Unauthorized,
}

impl AdmissionError {
    pub fn wire_code(&self) -> i32 {
        match self {
            AdmissionError::BadChannelName(_) => WS_ERR_CODE_BAD_REQUEST,
            AdmissionError::Unauthorized => WS_ERR_CODE_UNAUTHORIZED,
        }
    }
}

/// Why a frame was not relayed.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("not a member of the channel")]
    NotMember,

    #[error(transparent)]
    Rejected(#[from] FrameRejected),

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PublishError {
    pub fn wire_code(&self) -> i32 {
        match self {
            PublishError::NotMember => WS_ERR_CODE_FORBIDDEN,
            PublishError::Rejected(r) => r.wire_code(),
            PublishError::Encode(_) => WS_ERR_CODE_INTERNAL,
        }
    }
}

type ChannelMembers = HashMap<String, mpsc::Sender<WsMessage>>;

/// Shared channel state: who is in which channel, and how to reach them.
///
/// Lock order is always the outer channel map before an inner member map.
pub struct RelayHub {
    limits: FrameLimits,
    gate: Arc<dyn ChannelAuthGate>,
    channels: RwLock<HashMap<ChannelName, Arc<Mutex<ChannelMembers>>>>,
}

impl RelayHub {
    pub fn new(limits: FrameLimits, gate: Arc<dyn ChannelAuthGate>) -> Self {
        Self {
            limits,
            gate,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Frame validation rules applied to everything relayed through this hub.
    pub fn limits(&self) -> &FrameLimits {
        &self.limits
    }

    /// Admits a connection into a channel.
    ///
    /// The channel name is validated before the grant so that a malformed
    /// request is reported as such rather than as an auth failure. Returns
    /// the parsed channel name and the member count including the joiner.
    pub async fn join(
        &self,
        connection_id: &str,
        channel: &str,
        grant: &GrantPayload,
        out: mpsc::Sender<WsMessage>,
    ) -> Result<(ChannelName, usize), AdmissionError> {
        let channel: ChannelName = channel.parse()?;
        if let Err(e) = self.gate.verify(connection_id, &channel, grant) {
            debug!(%channel, connection = %connection_id, reason = %e, "join denied");
            return Err(AdmissionError::Unauthorized);
        }

        let mut channels = self.channels.write().await;
        let members = channels.entry(channel.clone()).or_default();
        let mut members = members.lock().await;
        members.insert(connection_id.to_string(), out);
        let count = members.len();
        debug!(%channel, connection = %connection_id, members = count, "joined channel");
        Ok((channel, count))
    }

    /// Relays a frame to every channel member except the sender.
    ///
    /// Returns the number of members the frame was handed to. A member whose
    /// send buffer is full still counts as delivered-to; the frame is simply
    /// dropped for it. Members whose connection is gone are pruned.
    pub async fn publish(
        &self,
        connection_id: &str,
        frame: &FramePayload,
    ) -> Result<usize, PublishError> {
        let channel: ChannelName = frame
            .channel
            .parse()
            .map_err(|_| PublishError::NotMember)?;

        let members = {
            let channels = self.channels.read().await;
            channels.get(&channel).cloned()
        };
        let members = members.ok_or(PublishError::NotMember)?;

        let mut members = members.lock().await;
        if !members.contains_key(connection_id) {
            return Err(PublishError::NotMember);
        }

        self.limits.check(&frame.payload, &frame.declared_type)?;

        // Serialize once; every recipient gets a cheap handle to the same text.
        let msg = Message::new(
            uuid::Uuid::new_v4().to_string(),
            MessageType::Frame,
            Some(frame),
        )?;
        let text = WsMessage::Text(serde_json::to_string(&msg)?.into());

        let mut delivered = 0usize;
        let mut dead = Vec::new();
        for (id, out) in members.iter() {
            if id == connection_id {
                continue;
            }
            match out.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(%channel, member = %id, "send buffer full, dropping frame");
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id.clone()),
            }
        }
        for id in &dead {
            members.remove(id);
            debug!(%channel, connection = %id, "pruned closed member");
        }
        let emptied = members.is_empty();
        drop(members);
        if emptied {
            self.remove_if_empty(&channel).await;
        }
        Ok(delivered)
    }

    /// Removes a connection from a channel. Unknown channels and repeated
    /// leaves are ignored.
    pub async fn leave(&self, connection_id: &str, channel: &str) {
        let Ok(channel) = channel.parse::<ChannelName>() else {
            return;
        };
        let members = {
            let channels = self.channels.read().await;
            channels.get(&channel).cloned()
        };
        let Some(members) = members else {
            return;
        };
        if members.lock().await.remove(connection_id).is_some() {
            debug!(%channel, connection = %connection_id, "left channel");
        }
        self.remove_if_empty(&channel).await;
    }

    /// Removes a connection from every channel it joined. Called when the
    /// connection goes away for any reason.
    pub async fn remove_connection(&self, connection_id: &str, joined: &[ChannelName]) {
        for channel in joined {
            let members = {
                let channels = self.channels.read().await;
                channels.get(channel).cloned()
            };
            let Some(members) = members else {
                continue;
            };
            members.lock().await.remove(connection_id);
            self.remove_if_empty(channel).await;
        }
    }

    pub async fn member_count(&self, channel: &ChannelName) -> usize {
        let members = {
            let channels = self.channels.read().await;
            channels.get(channel).cloned()
        };
        match members {
            Some(members) => members.lock().await.len(),
            None => 0,
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Drops the channel entry once the last member is gone. Re-checks under
    /// the write lock because a join may have slipped in between.
    async fn remove_if_empty(&self, channel: &ChannelName) {
        let mut channels = self.channels.write().await;
        if let Some(members) = channels.get(channel) {
            if members.lock().await.is_empty() {
                channels.remove(channel);
                debug!(%channel, "channel removed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
