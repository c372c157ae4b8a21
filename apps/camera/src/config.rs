//! Camera configuration.
//!
//! Reads JSON from `~/.config/nestcast-camera/config.json`. The grant key
//! and secret must match the ones in the relayd config.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use nestcast_channel_auth::{GrantKey, LocalAuthorizer};
use nestcast_protocol::channel::ChannelName;
use nestcast_relay_connection::{RetryPolicy, SessionConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantKeyFile {
    key: String,
    secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryFile {
    #[serde(default)]
    base_delay_ms: u64,
    #[serde(default)]
    max_delay_ms: u64,
    #[serde(default)]
    max_attempts: u32,
}

/// On-disk config format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    url: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    grant_key: Option<GrantKeyFile>,
    #[serde(default)]
    min_capture_interval_ms: u64,
    #[serde(default)]
    frame_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryFile>,
}

/// Camera configuration.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub url: String,
    pub channel: String,
    pub identity: String,
    pub grant_key: Option<GrantKey>,
    pub min_capture_interval_ms: u64,
    pub frame_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3001".into(),
            channel: "demo".into(),
            identity: String::new(),
            grant_key: None,
            min_capture_interval_ms: 100,
            frame_bytes: 16 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl CameraConfig {
    /// Loads configuration from `path`, or from the default location.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let file_path = match path {
            Some(path) => path,
            None => config_file_path()?,
        };
        let mut config = CameraConfig::default();

        if file_path.exists() {
            let content = std::fs::read_to_string(&file_path)?;
            if let Ok(file) = serde_json::from_str::<ConfigFile>(&content) {
                if !file.url.is_empty() {
                    config.url = file.url;
                }
                if !file.channel.is_empty() {
                    config.channel = file.channel;
                }
                config.identity = file.identity;
                config.grant_key = file.grant_key.map(|k| GrantKey::new(k.key, k.secret));
                if file.min_capture_interval_ms != 0 {
                    config.min_capture_interval_ms = file.min_capture_interval_ms;
                }
                if file.frame_bytes != 0 {
                    config.frame_bytes = file.frame_bytes;
                }
                if let Some(retry) = file.retry {
                    if retry.base_delay_ms != 0 {
                        config.retry.base_delay = Duration::from_millis(retry.base_delay_ms);
                    }
                    if retry.max_delay_ms != 0 {
                        config.retry.max_delay = Duration::from_millis(retry.max_delay_ms);
                    }
                    if retry.max_attempts != 0 {
                        config.retry.max_attempts = retry.max_attempts;
                    }
                }
            } else {
                tracing::warn!(
                    path = %file_path.display(),
                    "failed to parse camera config, using defaults"
                );
            }
        }

        Ok(config)
    }

    /// Session configuration derived from this config.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let channel: ChannelName = self
            .channel
            .parse()
            .with_context(|| format!("bad channel name {:?}", self.channel))?;
        let mut config = SessionConfig::new(&self.url, channel);
        config.min_capture_interval = Duration::from_millis(self.min_capture_interval_ms);
        config.retry = self.retry.clone();
        Ok(config)
    }

    /// Builds the grant authorizer from the configured key.
    pub fn authorizer(&self) -> anyhow::Result<LocalAuthorizer> {
        let key = self.grant_key.clone().context(
            "no grant key configured; copy key and secret from the relayd config",
        )?;
        Ok(if self.identity.is_empty() {
            LocalAuthorizer::new(key)
        } else {
            LocalAuthorizer::with_identity(key, self.identity.clone())
        })
    }
}

fn config_file_path() -> anyhow::Result<PathBuf> {
    let config_dir = config_base_dir()?;
    Ok(config_dir.join("nestcast-camera").join("config.json"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home).join(".config"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp"))
    }
}
