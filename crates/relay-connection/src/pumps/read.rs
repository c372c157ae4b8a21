//! WebSocket read pump — dispatches incoming messages.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use nestcast_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use nestcast_protocol::envelope::Message;

/// Reads messages from the WebSocket and dispatches them.
///
/// Uses a pong deadline to detect dead connections: if nothing arrives
/// within [`WS_PONG_WAIT`] the connection is considered dead and the loop
/// exits. On any exit the pump cancels `closed` and drops all pending
/// request waiters so callers fail fast instead of running into their
/// request timeout.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    push_tx: mpsc::Sender<Message>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    closed: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    // ANY incoming message resets the deadline, not just pongs. The relay's
    // frame traffic keeps a busy connection alive without pings.
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, connection dead");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &pending, &push_tx).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {} // Binary — ignore
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Wake every in-flight request with a closed error.
    pending.lock().await.clear();
    closed.cancel();
}

/// Handles a text message from the WebSocket.
async fn handle_text_message(
    text: &str,
    pending: &Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>,
    push_tx: &mpsc::Sender<Message>,
) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    // Route response to pending request.
    let mut map = pending.lock().await;
    if let Some(tx) = map.remove(&msg.id) {
        let _ = tx.send(msg);
        return;
    }
    drop(map);

    // Unsolicited message: frame fan-out, welcome, server-side notices.
    // Pushes are expendable, a stalled consumer loses frames rather than
    // backing the socket up.
    if let Err(e) = push_tx.try_send(msg) {
        warn!("push channel full, dropping message: {e}");
    }
}
