//! Relay session state machine.
//!
//! A session owns one channel membership on one relay and drives it through
//! connect, join, reconnect with backoff, and teardown. Producer sessions
//! additionally run the capture pace loop while connected.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nestcast_channel_auth::Authorizer;
use nestcast_protocol::constants::MessageType;
use nestcast_protocol::envelope::Message;
use nestcast_protocol::messages::FramePayload;

use crate::capture::{FrameSource, pace_loop};
use crate::link::{LinkError, RelayLink};
use crate::types::{SessionConfig, SessionEvent, SessionState};

/// Capacity of the session event channel. Lifecycle events are rare; the
/// rest is frame traffic the consumer is expected to drain.
const EVENT_BUFFER_SIZE: usize = 64;

/// Errors from session control calls.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session already running")]
    AlreadyRunning,
}

struct Running {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// A client's membership of one relay channel.
///
/// Create with [`RelaySession::new`] for a consumer or
/// [`RelaySession::with_source`] for a producer, take the event receiver,
/// then [`start`](RelaySession::start). The session reconnects on its own
/// until the retry budget runs out or admission is denied.
pub struct RelaySession {
    config: SessionConfig,
    authorizer: Arc<dyn Authorizer>,
    source: Option<Arc<dyn FrameSource>>,
    state: Arc<RwLock<SessionState>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    running: Mutex<Option<Running>>,
}

impl RelaySession {
    /// Creates a consumer session: receives frames, publishes none.
    pub fn new(config: SessionConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        Self::build(config, authorizer, None)
    }

    /// Creates a producer session that publishes frames from `source`.
    pub fn with_source(
        config: SessionConfig,
        authorizer: Arc<dyn Authorizer>,
        source: Arc<dyn FrameSource>,
    ) -> Self {
        Self::build(config, authorizer, Some(source))
    }

    fn build(
        config: SessionConfig,
        authorizer: Arc<dyn Authorizer>,
        source: Option<Arc<dyn FrameSource>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        Self {
            config,
            authorizer,
            source,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            running: Mutex::new(None),
        }
    }

    /// Current connection state.
    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    /// Takes the event receiver. Returns `None` after the first call.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Starts the session loop.
    ///
    /// Fails if the loop is already running. A session whose loop has ended,
    /// in [`SessionState::Failed`] or after [`stop`](Self::stop), can be
    /// started again.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        let mut running = self.running.lock().await;
        if let Some(prev) = running.take() {
            if !prev.handle.is_finished() {
                // A loop that reached Failed is committed to returning;
                // wait out its last few instructions instead of refusing.
                if self.state().await == SessionState::Failed {
                    let _ = prev.handle.await;
                } else {
                    *running = Some(prev);
                    return Err(SessionError::AlreadyRunning);
                }
            }
        }

        self.set_state(SessionState::Connecting).await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(session_loop(self.clone(), cancel.clone()));
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Stops the session and waits for the loop to wind down.
    pub async fn stop(&self) {
        let taken = self.running.lock().await.take();
        if let Some(Running { cancel, handle }) = taken {
            cancel.cancel();
            let _ = handle.await;
        }

        let prev = self.state().await;
        if prev != SessionState::Disconnected {
            self.set_state(SessionState::Disconnected).await;
            if prev != SessionState::Failed {
                self.emit(SessionEvent::Disconnected {
                    reason: "stopped".into(),
                });
            }
        }
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    /// Emits without blocking. A consumer that stops draining loses events
    /// rather than wedging the session loop.
    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!("session event dropped: {e}");
        }
    }

    /// Handles an unsolicited message while connected.
    fn handle_push(&self, msg: Message) {
        match msg.msg_type {
            MessageType::Frame => {
                let payload: FramePayload = match msg.parse_payload() {
                    Ok(Some(p)) => p,
                    Ok(None) => {
                        warn!("frame push without payload");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "undecodable frame push");
                        return;
                    }
                };
                if payload.channel != self.config.channel.as_str() {
                    warn!(channel = %payload.channel, "frame for a channel we did not join");
                    return;
                }
                match payload.into_frame(&self.config.limits) {
                    Ok(frame) => self.emit(SessionEvent::FrameReceived(frame)),
                    Err(rejected) => self.emit(SessionEvent::FrameRejected {
                        reason: rejected.to_string(),
                    }),
                }
            }
            // A duplicate welcome is harmless; the connect path consumed
            // the real one.
            MessageType::Welcome => {}
            other => debug!(msg_type = ?other, "ignoring push"),
        }
    }
}

/// How one connection attempt (or connected stretch) ended.
enum RunEnd {
    /// Cancelled from outside.
    Stopped,
    /// Was connected, then lost the link.
    Lost { reason: String },
    /// Never got connected this attempt.
    ConnectFailed { reason: String },
    /// The relay or the authorizer said no. Retrying will not help.
    Denied { reason: String },
}

async fn session_loop(session: Arc<RelaySession>, cancel: CancellationToken) {
    let max_attempts = session.config.retry.max_attempts;
    // 0 means the initial connect; retries start at 1.
    let mut attempt: u32 = 0;

    loop {
        match establish_and_run(&session, &cancel).await {
            RunEnd::Stopped => return,
            RunEnd::Denied { reason } => {
                warn!(%reason, "session denied");
                session.set_state(SessionState::Failed).await;
                session.emit(SessionEvent::Disconnected {
                    reason: reason.clone(),
                });
                session.emit(SessionEvent::Failed);
                return;
            }
            RunEnd::Lost { reason } => {
                info!(%reason, "relay link lost");
                session.emit(SessionEvent::Disconnected { reason });
                attempt = 1;
            }
            RunEnd::ConnectFailed { reason } => {
                warn!(%reason, attempt, "connect failed");
                if attempt == 0 {
                    session.emit(SessionEvent::Disconnected { reason });
                }
                attempt = attempt.saturating_add(1);
            }
        }

        if attempt > max_attempts {
            warn!(max_attempts, "retry budget exhausted");
            session.set_state(SessionState::Failed).await;
            session.emit(SessionEvent::Failed);
            return;
        }

        session
            .set_state(SessionState::Reconnecting { attempt })
            .await;
        session.emit(SessionEvent::Reconnecting {
            attempt,
            max_attempts,
        });

        let delay = session.config.retry.delay_for_attempt(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Connects, authorizes, joins, then runs the connected phase.
async fn establish_and_run(session: &Arc<RelaySession>, cancel: &CancellationToken) -> RunEnd {
    let connect = tokio::select! {
        _ = cancel.cancelled() => return RunEnd::Stopped,
        c = RelayLink::connect(&session.config.url) => c,
    };
    let (link, welcome) = match connect {
        Ok(pair) => pair,
        // Handshake problems are protocol mismatches, not weather.
        Err(LinkError::Handshake(reason)) => return RunEnd::Denied { reason },
        Err(e) => {
            return RunEnd::ConnectFailed {
                reason: e.to_string(),
            };
        }
    };
    let link = Arc::new(link);
    debug!(connection_id = %welcome.connection_id, "relay link up");

    let grant = match session
        .authorizer
        .authorize(&welcome.connection_id, &session.config.channel)
        .await
    {
        Ok(grant) => grant,
        Err(e) => {
            return RunEnd::Denied {
                reason: e.to_string(),
            };
        }
    };

    let join = tokio::select! {
        _ = cancel.cancelled() => return RunEnd::Stopped,
        j = link.join(&session.config.channel, &grant) => j,
    };
    let ack = match join {
        Ok(ack) => ack,
        Err(LinkError::Relay { code, message }) => {
            warn!(code, "join refused");
            return RunEnd::Denied { reason: message };
        }
        Err(e) => {
            return RunEnd::ConnectFailed {
                reason: e.to_string(),
            };
        }
    };

    info!(channel = %session.config.channel, members = ack.members, "joined channel");
    session.set_state(SessionState::Connected).await;
    session.emit(SessionEvent::Connected);

    connected_phase(session, cancel, link).await
}

/// Pumps pushes (and the pace loop, for producers) until something ends.
async fn connected_phase(
    session: &Arc<RelaySession>,
    cancel: &CancellationToken,
    link: Arc<RelayLink>,
) -> RunEnd {
    let mut pushes = match link.take_pushes().await {
        Some(rx) => rx,
        None => {
            return RunEnd::Lost {
                reason: "push channel unavailable".into(),
            };
        }
    };

    let pace = session.source.as_ref().map(|source| {
        let pace_cancel = cancel.child_token();
        let handle = tokio::spawn(pace_loop(
            link.clone(),
            source.clone(),
            session.config.channel.clone(),
            session.config.limits.clone(),
            session.config.min_capture_interval,
            session.events_tx.clone(),
            pace_cancel.clone(),
        ));
        (pace_cancel, handle)
    });

    let link_closed = link.closed();
    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break RunEnd::Stopped,
            _ = link_closed.cancelled() => break RunEnd::Lost { reason: "connection closed".into() },
            push = pushes.recv() => match push {
                Some(msg) => session.handle_push(msg),
                None => break RunEnd::Lost { reason: "connection closed".into() },
            },
        }
    };

    if let Some((pace_cancel, handle)) = pace {
        pace_cancel.cancel();
        let _ = handle.await;
    }

    if matches!(end, RunEnd::Stopped) {
        let _ = link.leave(session.config.channel.as_str()).await;
    }
    link.close().await;
    end
}
