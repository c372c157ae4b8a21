//! NestCast monitor.
//!
//! Joins a relay channel as a consumer and reports every frame that
//! arrives. Pass a config file path as the first argument to override the
//! default location.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use nestcast_relay_connection::{RelaySession, SessionEvent};

use config::MonitorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nestcast=debug")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = MonitorConfig::load(config_path)?;
    let authorizer = Arc::new(config.authorizer()?);

    let session = Arc::new(RelaySession::new(config.session_config()?, authorizer));
    let mut events = session
        .take_events()
        .await
        .context("event stream already taken")?;
    session.start().await?;
    tracing::info!(url = %config.url, channel = %config.channel, "monitor started");

    let mut printer = tokio::spawn(async move {
        let mut frames: u64 = 0;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Connected => tracing::info!("connected, watching for frames"),
                SessionEvent::Disconnected { reason } => {
                    tracing::warn!(%reason, "disconnected");
                }
                SessionEvent::Reconnecting {
                    attempt,
                    max_attempts,
                } => tracing::info!(attempt, max_attempts, "reconnecting"),
                SessionEvent::Failed => {
                    tracing::error!("session failed, giving up");
                    break;
                }
                SessionEvent::FrameRejected { reason } => {
                    tracing::warn!(%reason, "frame rejected");
                }
                SessionEvent::FrameReceived(frame) => {
                    frames += 1;
                    tracing::info!(
                        frames,
                        bytes = frame.payload().len(),
                        media = %frame.media_type(),
                        "frame"
                    );
                }
            }
        }
    });

    tokio::select! {
        _ = &mut printer => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
    }

    session.stop().await;
    printer.abort();
    Ok(())
}
