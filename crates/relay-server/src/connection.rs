//! Per-client connection handling: read loop, write pump, heartbeat.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use nestcast_protocol::channel::ChannelName;
use nestcast_protocol::constants::{
    MessageType, PROTOCOL_VERSION, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED,
    WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_REQUEST_TIMEOUT,
};
use nestcast_protocol::envelope::Message;
use nestcast_protocol::messages::{
    FrameAck, FramePayload, JoinAck, JoinRequest, LeaveRequest, Welcome,
};

use crate::SEND_BUFFER_SIZE;
use crate::hub::RelayHub;

/// Runs one client connection to completion.
///
/// Owns the read side of the socket; a write pump task drains the outbound
/// buffer and sends WS pings. Channel membership acquired here is swept from
/// the hub on every exit path.
pub(crate) async fn run_connection<S>(
    ws_stream: S,
    peer_addr: SocketAddr,
    hub: Arc<RelayHub>,
    heartbeat_timeout: Duration,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let (out_tx, out_rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let (ws_sink, mut ws_read) = ws_stream.split();

    let write_cancel = cancel.clone();
    let write_handle = tokio::spawn(write_pump(ws_sink, out_rx, write_cancel));

    let mut conn = ClientConn {
        id: uuid::Uuid::new_v4().to_string(),
        hub,
        out_tx,
        joined: Vec::new(),
    };
    info!(%peer_addr, connection = %conn.id, "client connected");

    // Greet before reading anything; a client that cannot take the welcome
    // within the request window is not worth keeping.
    let welcome = Welcome {
        connection_id: conn.id.clone(),
        heartbeat_timeout_ms: heartbeat_timeout.as_millis() as u64,
        protocol_version: PROTOCOL_VERSION,
    };
    let greeted = match Message::new(
        uuid::Uuid::new_v4().to_string(),
        MessageType::Welcome,
        Some(&welcome),
    ) {
        Ok(msg) => conn.deliver(msg).await,
        Err(e) => {
            warn!(error = %e, "welcome encode failed");
            false
        }
    };

    if greeted {
        // Any inbound traffic counts as a heartbeat, frames included.
        let heartbeat = tokio::time::sleep(heartbeat_timeout);
        tokio::pin!(heartbeat);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                () = &mut heartbeat => {
                    warn!(connection = %conn.id, "heartbeat timeout, closing connection");
                    break;
                }

                frame = ws_read.next() => {
                    match frame {
                        Some(Ok(ws_msg)) => {
                            heartbeat
                                .as_mut()
                                .reset(tokio::time::Instant::now() + heartbeat_timeout);
                            if !conn.handle_ws_message(ws_msg).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(connection = %conn.id, "read error: {e}");
                            break;
                        }
                        None => break, // Stream ended.
                    }
                }
            }
        }
    }

    conn.hub.remove_connection(&conn.id, &conn.joined).await;
    info!(connection = %conn.id, "client disconnected");

    // Dropping the last outbound sender lets the write pump flush and close.
    drop(conn);
    let _ = write_handle.await;
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            debug!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    debug!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// State for one admitted client.
struct ClientConn {
    id: String,
    hub: Arc<RelayHub>,
    out_tx: mpsc::Sender<WsMessage>,
    joined: Vec<ChannelName>,
}

impl ClientConn {
    /// Sends a control message, waiting out short-lived backpressure.
    ///
    /// The outbound buffer is shared with frame fan-out. Frames may be
    /// dropped when it is full; replies may not, so this waits for space up
    /// to the request window. Returns `false` when the connection is dead.
    async fn deliver(&self, msg: Message) -> bool {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                warn!(connection = %self.id, error = %e, "reply encode failed");
                return false;
            }
        };
        let sent =
            tokio::time::timeout(WS_REQUEST_TIMEOUT, self.out_tx.send(WsMessage::Text(json.into())))
                .await;
        match sent {
            Ok(Ok(())) => true,
            _ => {
                warn!(connection = %self.id, "outbound stalled, dropping connection");
                false
            }
        }
    }

    async fn reply_error(&self, req: &Message, code: i32, message: &str) -> bool {
        self.deliver(req.reply_error(code, message)).await
    }

    /// Returns `false` when the connection should be torn down.
    async fn handle_ws_message(&mut self, ws_msg: WsMessage) -> bool {
        match ws_msg {
            WsMessage::Text(text) => {
                if text.len() > WS_MAX_MESSAGE_SIZE {
                    warn!(
                        connection = %self.id,
                        "message exceeds max size ({} > {})",
                        text.len(),
                        WS_MAX_MESSAGE_SIZE
                    );
                    return true;
                }
                self.dispatch_text(&text).await
            }
            WsMessage::Ping(data) => {
                let _ = self.out_tx.try_send(WsMessage::Pong(data));
                true
            }
            WsMessage::Pong(_) => true,
            WsMessage::Close(_) => {
                debug!(connection = %self.id, "received close frame");
                false
            }
            WsMessage::Binary(_) => {
                trace!(connection = %self.id, "binary frame ignored");
                true
            }
            WsMessage::Frame(_) => true, // Raw frames ignored.
        }
    }

    async fn dispatch_text(&mut self, text: &str) -> bool {
        let msg: Message = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(connection = %self.id, "invalid message JSON: {e}");
                return true;
            }
        };

        match msg.msg_type {
            MessageType::Join => self.on_join(msg).await,
            MessageType::Frame => self.on_frame(msg).await,
            MessageType::Leave => {
                self.on_leave(msg).await;
                true
            }
            _ => {
                warn!(connection = %self.id, msg_type = ?msg.msg_type, "unhandled message type");
                self.reply_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "unknown message type")
                    .await
            }
        }
    }

    async fn on_join(&mut self, msg: Message) -> bool {
        let req: JoinRequest = match msg.parse_payload() {
            Ok(Some(req)) => req,
            Ok(None) | Err(_) => {
                return self
                    .reply_error(&msg, WS_ERR_CODE_BAD_REQUEST, "join needs a payload")
                    .await;
            }
        };

        match self
            .hub
            .join(&self.id, &req.channel, &req.grant, self.out_tx.clone())
            .await
        {
            Ok((channel, members)) => {
                let ack = JoinAck {
                    channel: channel.to_string(),
                    members,
                };
                if !self.joined.contains(&channel) {
                    self.joined.push(channel);
                }
                match msg.reply(MessageType::JoinAck, Some(&ack)) {
                    Ok(reply) => self.deliver(reply).await,
                    Err(e) => {
                        warn!(connection = %self.id, error = %e, "join_ack encode failed");
                        false
                    }
                }
            }
            Err(e) => self.reply_error(&msg, e.wire_code(), &e.to_string()).await,
        }
    }

    async fn on_frame(&mut self, msg: Message) -> bool {
        let frame: FramePayload = match msg.parse_payload() {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => {
                return self
                    .reply_error(&msg, WS_ERR_CODE_BAD_REQUEST, "frame needs a payload")
                    .await;
            }
        };

        match self.hub.publish(&self.id, &frame).await {
            Ok(delivered) => {
                trace!(connection = %self.id, channel = %frame.channel, delivered, "frame relayed");
                match msg.reply(MessageType::FrameAck, Some(&FrameAck { delivered })) {
                    Ok(reply) => self.deliver(reply).await,
                    Err(e) => {
                        warn!(connection = %self.id, error = %e, "frame_ack encode failed");
                        false
                    }
                }
            }
            Err(e) => {
                debug!(connection = %self.id, channel = %frame.channel, reason = %e, "frame refused");
                self.reply_error(&msg, e.wire_code(), &e.to_string()).await
            }
        }
    }

    // Leave is fire-and-forget; malformed requests are dropped quietly.
    async fn on_leave(&mut self, msg: Message) {
        let Ok(Some(req)) = msg.parse_payload::<LeaveRequest>() else {
            return;
        };
        self.hub.leave(&self.id, &req.channel).await;
        if let Ok(channel) = req.channel.parse::<ChannelName>() {
            self.joined.retain(|joined| *joined != channel);
        }
    }
}
