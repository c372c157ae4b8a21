//! WebSocket ping pump — periodic keepalive pings.

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use nestcast_protocol::constants::WS_PING_PERIOD;

/// Sends periodic pings to keep the connection alive.
///
/// The matching deadline lives in the read pump: [`WS_PONG_WAIT`] covers
/// more than two ping periods, so one lost pong is survivable.
///
/// [`WS_PONG_WAIT`]: nestcast_protocol::constants::WS_PONG_WAIT
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    closed: CancellationToken,
) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = interval.tick() => {
                let ping = tungstenite::Message::Ping(vec![].into());
                if write_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
