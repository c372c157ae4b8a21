//! WebSocket link to the relay.
//!
//! Implements the request-response pattern with UUID correlation,
//! ping/pong keepalive, and a push channel for relayed frames.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use nestcast_protocol::channel::ChannelName;
use nestcast_protocol::constants::{
    MessageType, ProtocolCompatibility, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT,
    check_protocol_compatibility,
};
use nestcast_protocol::envelope::Message;
use nestcast_protocol::frame::Frame;
use nestcast_protocol::messages::{
    FrameAck, FramePayload, GrantPayload, JoinAck, JoinRequest, LeaveRequest, Welcome,
};

/// Errors from the relay link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("relay error {code}: {message}")]
    Relay { code: i32, message: String },
}

/// WebSocket link to a single relay.
///
/// The link is transport only: it correlates requests with replies and hands
/// unsolicited messages to the push channel. Session logic (joining, pacing,
/// reconnecting) lives above it.
pub struct RelayLink {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    push_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    /// Cancelled when the link dies, whichever pump notices first.
    closed: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    _ping_handle: tokio::task::JoinHandle<()>,
}

impl RelayLink {
    /// Connects to a relay and waits for its `welcome`.
    pub async fn connect(url: &str) -> Result<(Self, Welcome), LinkError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let (push_tx, push_rx) = mpsc::channel::<Message>(64);
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let write_handle = {
            let closed = closed.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, closed))
        };

        let read_handle = {
            let pending = pending.clone();
            let write_tx = write_tx.clone();
            let closed = closed.clone();
            tokio::spawn(crate::pumps::read::read_pump(
                read, pending, push_tx, write_tx, closed,
            ))
        };

        let ping_handle = {
            let write_tx = write_tx.clone();
            let closed = closed.clone();
            tokio::spawn(crate::pumps::ping::ping_pump(write_tx, closed))
        };

        // Build the link before the handshake so any early return drops it
        // and tears the pumps down.
        let link = Self {
            write_tx,
            pending,
            push_rx: Mutex::new(Some(push_rx)),
            closed,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
        };

        let welcome = link.await_welcome().await?;
        Ok((link, welcome))
    }

    /// Waits for the relay's first push, which must be a `welcome`.
    async fn await_welcome(&self) -> Result<Welcome, LinkError> {
        let msg = {
            let mut guard = self.push_rx.lock().await;
            let rx = guard
                .as_mut()
                .ok_or_else(|| LinkError::Handshake("push channel already taken".into()))?;
            tokio::time::timeout(WS_REQUEST_TIMEOUT, rx.recv())
                .await
                .map_err(|_| LinkError::Timeout)?
                .ok_or(LinkError::Closed)?
        };

        if msg.msg_type != MessageType::Welcome {
            return Err(LinkError::Handshake(format!(
                "expected welcome, got {:?}",
                msg.msg_type
            )));
        }
        let welcome: Welcome = msg
            .parse_payload()?
            .ok_or_else(|| LinkError::Handshake("welcome without payload".into()))?;

        if let ProtocolCompatibility::Incompatible { reason, .. } =
            check_protocol_compatibility(welcome.protocol_version)
        {
            return Err(LinkError::Handshake(reason));
        }
        Ok(welcome)
    }

    /// Sends a request and waits for the response.
    pub async fn send_request<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, LinkError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| LinkError::Closed)?;

        let result = tokio::time::timeout(WS_REQUEST_TIMEOUT, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if let Some(err) = &resp.error {
                    return Err(LinkError::Relay {
                        code: err.code,
                        message: err.message.clone(),
                    });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => Err(LinkError::Timeout),
        }
    }

    /// Joins a channel with the given grant.
    pub async fn join(
        &self,
        channel: &ChannelName,
        grant: &GrantPayload,
    ) -> Result<JoinAck, LinkError> {
        let req = JoinRequest {
            channel: channel.to_string(),
            grant: grant.clone(),
        };
        let resp = self.send_request(MessageType::Join, Some(&req)).await?;
        let ack: Option<JoinAck> = resp.parse_payload()?;
        ack.ok_or_else(|| LinkError::Handshake("join_ack without payload".into()))
    }

    /// Publishes one validated frame and waits for the relay's ack.
    pub async fn publish(&self, channel: &str, frame: Frame) -> Result<FrameAck, LinkError> {
        let payload = FramePayload::from_frame(channel, frame);
        let resp = self.send_request(MessageType::Frame, Some(&payload)).await?;
        let ack: Option<FrameAck> = resp.parse_payload()?;
        ack.ok_or_else(|| LinkError::Handshake("frame_ack without payload".into()))
    }

    /// Announces departure from a channel. Fire-and-forget.
    pub async fn leave(&self, channel: &str) -> Result<(), LinkError> {
        let req = LeaveRequest {
            channel: channel.into(),
        };
        let msg = Message::new(uuid::Uuid::new_v4().to_string(), MessageType::Leave, Some(&req))?;
        let json = serde_json::to_string(&msg)?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Takes the push receiver. Returns `None` after the first call.
    pub async fn take_pushes(&self) -> Option<mpsc::Receiver<Message>> {
        self.push_rx.lock().await.take()
    }

    /// Token cancelled when the link dies.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        self.closed.cancel();
        let _ = self
            .write_tx
            .send(tungstenite::Message::Close(None))
            .await;
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.closed.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
    }
}
