//! Relay WebSocket server.
//!
//! Listens on a TCP port, upgrades connections to WebSocket, and runs one
//! connection task per client against the shared [`RelayHub`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use nestcast_channel_auth::ChannelAuthGate;
use nestcast_protocol::constants::{
    DEFAULT_ALLOWED_FRAME_TYPES, DEFAULT_MAX_FRAME_BYTES, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT,
};
use nestcast_protocol::frame::FrameLimits;

use crate::ServerError;
use crate::connection::run_connection;
use crate::hub::RelayHub;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Largest accepted frame payload in bytes.
    pub max_frame_bytes: usize,
    /// Media types the relay will carry.
    pub allowed_frame_types: Vec<String>,
    /// A client silent for longer than this is disconnected.
    pub heartbeat_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            allowed_frame_types: DEFAULT_ALLOWED_FRAME_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            heartbeat_timeout: WS_PONG_WAIT,
        }
    }
}

impl ServerConfig {
    /// Frame validation rules derived from this configuration.
    pub fn limits(&self) -> FrameLimits {
        FrameLimits::new(self.max_frame_bytes, self.allowed_frame_types.iter().cloned())
    }
}

/// The relay WebSocket server.
///
/// Accepts any number of client connections and relays frames between the
/// members of each channel.
pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<RelayHub>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RelayServer {
    /// Creates a new server admitting clients through the given gate.
    pub fn new(config: ServerConfig, gate: Arc<dyn ChannelAuthGate>) -> Arc<Self> {
        let hub = Arc::new(RelayHub::new(config.limits(), gate));
        Arc::new(Self {
            config,
            hub,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the shared channel hub.
    pub fn hub(&self) -> Arc<RelayHub> {
        Arc::clone(&self.hub)
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Gracefully shuts down the server and every client connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    ///
    /// Binds to the configured port and accepts WebSocket connections.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("relay server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades a TCP connection to WebSocket and runs it to completion.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        run_connection(
            ws_stream,
            peer_addr,
            self.hub(),
            self.config.heartbeat_timeout,
            self.cancel.clone(),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    use nestcast_channel_auth::{GrantKey, KeyGate};
    use nestcast_protocol::constants::{MessageType, PROTOCOL_VERSION};
    use nestcast_protocol::envelope::Message;
    use nestcast_protocol::messages::{
        FrameAck, FramePayload, GrantPayload, JoinAck, JoinRequest, Welcome,
    };

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server(config: ServerConfig) -> (Arc<RelayServer>, JoinHandle<()>, GrantKey) {
        let key = GrantKey::generate();
        let server = RelayServer::new(config, Arc::new(KeyGate::new(key.clone())));
        let server2 = Arc::clone(&server);

        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        // Wait for the server to bind.
        tokio::time::sleep(Duration::from_millis(50)).await;
        (server, handle, key)
    }

    async fn connect(server: &RelayServer) -> WsClient {
        let url = format!("ws://127.0.0.1:{}", server.port().await);
        let (ws, _) = connect_async(&url).await.unwrap();
        ws
    }

    async fn recv_msg(ws: &mut WsClient) -> Message {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .expect("read failed");
            match frame {
                WsMessage::Text(text) => {
                    return serde_json::from_str(text.as_str()).expect("valid envelope");
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn send_msg(ws: &mut WsClient, msg: &Message) {
        let json = serde_json::to_string(msg).unwrap();
        ws.send(WsMessage::Text(json.into())).await.unwrap();
    }

    /// Reads the welcome and returns the assigned connection id.
    async fn read_welcome(ws: &mut WsClient) -> String {
        let msg = recv_msg(ws).await;
        assert_eq!(msg.msg_type, MessageType::Welcome);
        let welcome: Welcome = msg.parse_payload().unwrap().unwrap();
        welcome.connection_id
    }

    async fn join_channel(ws: &mut WsClient, key: &GrantKey, conn_id: &str, channel: &str) -> Message {
        let req = JoinRequest {
            channel: channel.into(),
            grant: GrantPayload {
                auth: key.sign(conn_id, channel, ""),
                identity: String::new(),
            },
        };
        let msg = Message::new("join-1", MessageType::Join, Some(&req)).unwrap();
        send_msg(ws, &msg).await;
        recv_msg(ws).await
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle, _key) = start_server(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;

        let port = server.port().await;
        assert!(port > 0, "should have bound to a dynamic port");

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn server_welcomes_new_connections() {
        let (server, handle, _key) = start_server(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;

        let mut ws = connect(&server).await;
        let msg = recv_msg(&mut ws).await;
        assert_eq!(msg.msg_type, MessageType::Welcome);
        let welcome: Welcome = msg.parse_payload().unwrap().unwrap();
        assert!(!welcome.connection_id.is_empty());
        assert_eq!(welcome.heartbeat_timeout_ms, WS_PONG_WAIT.as_millis() as u64);
        assert_eq!(welcome.protocol_version, PROTOCOL_VERSION);

        drop(ws);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn join_then_relay_between_two_clients() {
        let (server, handle, key) = start_server(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;

        let mut producer = connect(&server).await;
        let mut viewer = connect(&server).await;
        let producer_id = read_welcome(&mut producer).await;
        let viewer_id = read_welcome(&mut viewer).await;

        let ack = join_channel(&mut producer, &key, &producer_id, "living-room").await;
        assert_eq!(ack.msg_type, MessageType::JoinAck);
        let ack: JoinAck = ack.parse_payload().unwrap().unwrap();
        assert_eq!(ack.members, 1);

        let ack = join_channel(&mut viewer, &key, &viewer_id, "living-room").await;
        let ack: JoinAck = ack.parse_payload().unwrap().unwrap();
        assert_eq!(ack.members, 2);

        let frame = FramePayload {
            channel: "living-room".into(),
            payload: b"\xff\xd8jpeg bytes\xff\xd9".to_vec(),
            declared_type: "image/jpeg".into(),
            timestamp: 123,
        };
        let msg = Message::new("frame-1", MessageType::Frame, Some(&frame)).unwrap();
        send_msg(&mut producer, &msg).await;

        // The producer gets an ack, the viewer gets the frame.
        let reply = recv_msg(&mut producer).await;
        assert_eq!(reply.msg_type, MessageType::FrameAck);
        assert_eq!(reply.id, "frame-1");
        let ack: FrameAck = reply.parse_payload().unwrap().unwrap();
        assert_eq!(ack.delivered, 1);

        let pushed = recv_msg(&mut viewer).await;
        assert_eq!(pushed.msg_type, MessageType::Frame);
        let got: FramePayload = pushed.parse_payload().unwrap().unwrap();
        assert_eq!(got.payload, frame.payload);
        assert_eq!(got.declared_type, "image/jpeg");

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn join_with_foreign_grant_is_unauthorized() {
        let (server, handle, _key) = start_server(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;

        let mut ws = connect(&server).await;
        let conn_id = read_welcome(&mut ws).await;

        // Signed with a key the server has never seen.
        let foreign = GrantKey::generate();
        let reply = join_channel(&mut ws, &foreign, &conn_id, "living-room").await;
        assert_eq!(reply.msg_type, MessageType::Error);
        let err = reply.error.expect("error body");
        assert_eq!(err.code, 401);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn join_with_bad_channel_name_is_rejected() {
        let (server, handle, key) = start_server(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;

        let mut ws = connect(&server).await;
        let conn_id = read_welcome(&mut ws).await;

        let reply = join_channel(&mut ws, &key, &conn_id, "no spaces allowed").await;
        assert_eq!(reply.msg_type, MessageType::Error);
        let err = reply.error.expect("error body");
        assert_eq!(err.code, 400);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_message_type_gets_not_implemented() {
        let (server, handle, _key) = start_server(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;

        let mut ws = connect(&server).await;
        read_welcome(&mut ws).await;

        let json = serde_json::json!({ "id": "x-1", "type": "bogus" });
        ws.send(WsMessage::Text(json.to_string().into())).await.unwrap();

        let reply = recv_msg(&mut ws).await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.id, "x-1");
        let err = reply.error.expect("error body");
        assert_eq!(err.code, 501);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn silent_clients_are_dropped() {
        let (server, handle, _key) = start_server(ServerConfig {
            port: 0,
            heartbeat_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        })
        .await;

        let mut ws = connect(&server).await;
        read_welcome(&mut ws).await;

        // Stay silent and wait for the server to hang up.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let frame = tokio::time::timeout_at(deadline, ws.next())
                .await
                .expect("server should have closed the connection");
            match frame {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_disconnects_clients() {
        let (server, handle, _key) = start_server(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;

        let mut ws = connect(&server).await;
        read_welcome(&mut ws).await;

        server.shutdown();
        handle.await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let frame = tokio::time::timeout_at(deadline, ws.next())
                .await
                .expect("connection should end after shutdown");
            match frame {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    }
}
