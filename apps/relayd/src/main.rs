//! NestCast relay daemon.
//!
//! Runs a [`RelayServer`] with a single-key admission gate. Pass a config
//! file path as the first argument to override the default location.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use nestcast_channel_auth::KeyGate;
use nestcast_relay_server::RelayServer;

use config::RelaydConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nestcast=debug")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = RelaydConfig::load(config_path)?;
    let key = config.ensure_grant_key()?;

    let server = RelayServer::new(config.server_config(), Arc::new(KeyGate::new(key)));

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            server.shutdown();
        }
    }

    Ok(())
}
