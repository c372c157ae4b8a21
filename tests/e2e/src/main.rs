fn main() {
    println!("Run `cargo test -p relay-e2e` to execute end-to-end relay tests.");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use nestcast_channel_auth::{Authorizer, GrantKey, KeyGate, LocalAuthorizer};
    use nestcast_protocol::channel::ChannelName;
    use nestcast_protocol::constants::MessageType;
    use nestcast_protocol::frame::FrameLimits;
    use nestcast_relay_connection::{
        RelayLink, RelaySession, RetryPolicy, SessionConfig, SessionEvent, SessionState,
        SyntheticSource,
    };
    use nestcast_relay_server::{RelayServer, ServerConfig};

    /// Starts a relay on a dynamic port and returns its signing key and URL.
    async fn start_relay(
        config: ServerConfig,
    ) -> (Arc<RelayServer>, JoinHandle<()>, GrantKey, String) {
        let key = GrantKey::generate();
        let server = RelayServer::new(config, Arc::new(KeyGate::new(key.clone())));
        let server2 = Arc::clone(&server);

        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        // Wait for the server to bind.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let url = format!("ws://127.0.0.1:{}", server.port().await);
        (server, handle, key, url)
    }

    fn channel(name: &str) -> ChannelName {
        name.parse().unwrap()
    }

    /// Waits for the next event matching `pred`, discarding everything else.
    async fn wait_for<F>(
        events: &mut mpsc::Receiver<SessionEvent>,
        what: &str,
        mut pred: F,
    ) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
                .unwrap_or_else(|| panic!("event channel closed waiting for {what}"));
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn frames_flow_from_producer_to_every_viewer() {
        let (server, handle, key, url) = start_relay(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;
        let auth = Arc::new(LocalAuthorizer::new(key.clone()));

        let mut viewers = Vec::new();
        for _ in 0..2 {
            let session = Arc::new(RelaySession::new(
                SessionConfig::new(&url, channel("garden-cam")),
                auth.clone(),
            ));
            let events = session.take_events().await.unwrap();
            session.start().await.unwrap();
            viewers.push((session, events));
        }

        let mut config = SessionConfig::new(&url, channel("garden-cam"));
        config.min_capture_interval = Duration::from_millis(20);
        let producer = Arc::new(RelaySession::with_source(
            config,
            auth.clone(),
            Arc::new(SyntheticSource::new(16 * 1024)),
        ));
        let mut producer_events = producer.take_events().await.unwrap();
        producer.start().await.unwrap();

        wait_for(&mut producer_events, "producer connect", |e| {
            matches!(e, SessionEvent::Connected)
        })
        .await;

        for (_, events) in viewers.iter_mut() {
            let event = wait_for(events, "a relayed frame", |e| {
                matches!(e, SessionEvent::FrameReceived(_))
            })
            .await;
            let SessionEvent::FrameReceived(frame) = event else {
                unreachable!()
            };
            assert_eq!(frame.media_type(), "image/jpeg");
            assert!(frame.payload().starts_with(&[0xFF, 0xD8]));
        }

        // The producer must never hear its own frames back.
        producer.stop().await;
        while let Ok(event) = producer_events.try_recv() {
            assert!(
                !matches!(event, SessionEvent::FrameReceived(_)),
                "producer heard its own frame"
            );
        }

        for (session, _) in &viewers {
            session.stop().await;
        }
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn denied_session_fails_without_retrying() {
        let (server, handle, _key, url) = start_relay(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;

        // Grants signed with a key the relay has never seen.
        let foreign = Arc::new(LocalAuthorizer::new(GrantKey::generate()));
        let session = Arc::new(RelaySession::new(
            SessionConfig::new(&url, channel("garden-cam")),
            foreign,
        ));
        let mut events = session.take_events().await.unwrap();
        session.start().await.unwrap();

        wait_for(&mut events, "failure", |e| matches!(e, SessionEvent::Failed)).await;
        assert_eq!(session.state().await, SessionState::Failed);

        // A refused grant is terminal; no reconnect attempts may follow.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, SessionEvent::Reconnecting { .. }),
                "denied session tried to reconnect"
            );
        }

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn viewer_reconnects_after_relay_restart() {
        let (server, handle, key, url) = start_relay(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;
        let port = server.port().await;
        let auth = Arc::new(LocalAuthorizer::new(key.clone()));

        let mut config = SessionConfig::new(&url, channel("garden-cam"));
        config.retry = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 20,
        };
        let session = Arc::new(RelaySession::new(config, auth));
        let mut events = session.take_events().await.unwrap();
        session.start().await.unwrap();
        wait_for(&mut events, "first connect", |e| {
            matches!(e, SessionEvent::Connected)
        })
        .await;

        // Take the relay down; the session enters its retry schedule.
        server.shutdown();
        handle.await.unwrap();
        wait_for(&mut events, "a reconnect attempt", |e| {
            matches!(e, SessionEvent::Reconnecting { .. })
        })
        .await;

        // Bring a new relay up on the same port with the same key.
        let server = RelayServer::new(
            ServerConfig {
                port,
                ..ServerConfig::default()
            },
            Arc::new(KeyGate::new(key.clone())),
        );
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        wait_for(&mut events, "reconnect", |e| {
            matches!(e, SessionEvent::Connected)
        })
        .await;
        assert_eq!(session.state().await, SessionState::Connected);

        session.stop().await;
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn relay_reports_rejected_frames_to_the_producer() {
        // The relay only takes tiny frames; the producer's own limits are lax,
        // so rejection happens on the relay side and travels back as an error.
        let (server, handle, key, url) = start_relay(ServerConfig {
            port: 0,
            max_frame_bytes: 64,
            ..ServerConfig::default()
        })
        .await;
        let auth = Arc::new(LocalAuthorizer::new(key.clone()));

        let mut config = SessionConfig::new(&url, channel("garden-cam"));
        config.min_capture_interval = Duration::from_millis(20);
        let producer = Arc::new(RelaySession::with_source(
            config,
            auth,
            Arc::new(SyntheticSource::new(4 * 1024)),
        ));
        let mut events = producer.take_events().await.unwrap();
        producer.start().await.unwrap();

        let event = wait_for(&mut events, "a frame rejection", |e| {
            matches!(e, SessionEvent::FrameRejected { .. })
        })
        .await;
        let SessionEvent::FrameRejected { reason } = event else {
            unreachable!()
        };
        assert!(!reason.is_empty());

        producer.stop().await;
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn departed_members_stop_receiving() {
        let (server, handle, key, url) = start_relay(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;
        let lobby = channel("garden-cam");
        let auth = LocalAuthorizer::new(key.clone());

        let (producer, producer_welcome) = RelayLink::connect(&url).await.unwrap();
        let (viewer, viewer_welcome) = RelayLink::connect(&url).await.unwrap();

        let grant = auth
            .authorize(&producer_welcome.connection_id, &lobby)
            .await
            .unwrap();
        let ack = producer.join(&lobby, &grant).await.unwrap();
        assert_eq!(ack.members, 1);

        let grant = auth
            .authorize(&viewer_welcome.connection_id, &lobby)
            .await
            .unwrap();
        let ack = viewer.join(&lobby, &grant).await.unwrap();
        assert_eq!(ack.members, 2);

        let shot = || {
            FrameLimits::default()
                .validate(b"\xff\xd8shot\xff\xd9".to_vec(), "image/jpeg", 0)
                .unwrap()
        };
        let ack = producer.publish("garden-cam", shot()).await.unwrap();
        assert_eq!(ack.delivered, 1);

        let mut pushes = viewer.take_pushes().await.unwrap();
        let pushed = tokio::time::timeout(Duration::from_secs(2), pushes.recv())
            .await
            .expect("timed out waiting for the pushed frame")
            .expect("push channel closed");
        assert_eq!(pushed.msg_type, MessageType::Frame);

        viewer.leave("garden-cam").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ack = producer.publish("garden-cam", shot()).await.unwrap();
        assert_eq!(ack.delivered, 0, "a departed member still counted as delivered");

        producer.close().await;
        viewer.close().await;
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn producer_paces_itself() {
        let (server, handle, key, url) = start_relay(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        })
        .await;
        let auth = Arc::new(LocalAuthorizer::new(key.clone()));

        let viewer = Arc::new(RelaySession::new(
            SessionConfig::new(&url, channel("garden-cam")),
            auth.clone(),
        ));
        let mut viewer_events = viewer.take_events().await.unwrap();
        viewer.start().await.unwrap();
        wait_for(&mut viewer_events, "viewer connect", |e| {
            matches!(e, SessionEvent::Connected)
        })
        .await;

        let mut config = SessionConfig::new(&url, channel("garden-cam"));
        config.min_capture_interval = Duration::from_millis(100);
        let producer = Arc::new(RelaySession::with_source(
            config,
            auth,
            Arc::new(SyntheticSource::new(1024)),
        ));
        let mut producer_events = producer.take_events().await.unwrap();
        producer.start().await.unwrap();
        wait_for(&mut producer_events, "producer connect", |e| {
            matches!(e, SessionEvent::Connected)
        })
        .await;

        // Count frames over a fixed window; 100 ms spacing caps the rate.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(550);
        let mut received = 0usize;
        loop {
            match tokio::time::timeout_at(deadline, viewer_events.recv()).await {
                Ok(Some(SessionEvent::FrameReceived(_))) => received += 1,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        assert!(received >= 1, "expected at least one frame");
        assert!(received <= 8, "pacing should cap the frame rate, got {received}");

        producer.stop().await;
        viewer.stop().await;
        server.shutdown();
        handle.await.unwrap();
    }
}
