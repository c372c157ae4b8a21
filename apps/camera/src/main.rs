//! NestCast camera.
//!
//! Publishes synthetic frames to a relay channel and reports session
//! events. Pass a config file path as the first argument to override the
//! default location.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use nestcast_relay_connection::{RelaySession, SessionEvent, SyntheticSource};

use config::CameraConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nestcast=debug")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = CameraConfig::load(config_path)?;
    let authorizer = Arc::new(config.authorizer()?);
    let source = Arc::new(SyntheticSource::new(config.frame_bytes));

    let session = Arc::new(RelaySession::with_source(
        config.session_config()?,
        authorizer,
        source,
    ));
    let mut events = session
        .take_events()
        .await
        .context("event stream already taken")?;
    session.start().await?;
    tracing::info!(url = %config.url, channel = %config.channel, "camera started");

    let mut printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Connected => tracing::info!("connected, publishing frames"),
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
                    // Another producer on the same channel; not our business.
                    tracing::debug!(bytes = frame.payload().len(), "frame received");
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
