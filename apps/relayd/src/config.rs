//! Relay daemon configuration.
//!
//! Reads/writes JSON at `~/.config/nestcast-relayd/config.json`. The grant
//! key pair is generated and persisted on first run; camera and monitor
//! configs reference the same key and secret.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use nestcast_channel_auth::GrantKey;
use nestcast_relay_server::ServerConfig;

/// Stored grant key pair (same shape as in camera/monitor configs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantKeyFile {
    key: String,
    secret: String,
}

/// On-disk config format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    port: u16,
    #[serde(default)]
    max_frame_bytes: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    allowed_frame_types: Vec<String>,
    #[serde(default)]
    heartbeat_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    grant_key: Option<GrantKeyFile>,
}

/// Relay daemon configuration.
#[derive(Debug, Clone)]
pub struct RelaydConfig {
    pub port: u16,
    pub max_frame_bytes: usize,
    pub allowed_frame_types: Vec<String>,
    pub heartbeat_timeout_ms: u64,
    pub grant_key: Option<GrantKey>,
    file_path: PathBuf,
}

impl Default for RelaydConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            port: server.port,
            max_frame_bytes: server.max_frame_bytes,
            allowed_frame_types: server.allowed_frame_types,
            heartbeat_timeout_ms: server.heartbeat_timeout.as_millis() as u64,
            grant_key: None,
            file_path: config_file_path().unwrap_or_else(|_| PathBuf::from("/tmp/config.json")),
        }
    }
}

impl RelaydConfig {
    /// Loads configuration from `path`, or from the default location.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let file_path = match path {
            Some(path) => path,
            None => config_file_path()?,
        };
        let mut config = RelaydConfig {
            file_path: file_path.clone(),
            ..Default::default()
        };

        if file_path.exists() {
            let content = std::fs::read_to_string(&file_path)?;
            if let Ok(file) = serde_json::from_str::<ConfigFile>(&content) {
                if file.port != 0 {
                    config.port = file.port;
                }
                if file.max_frame_bytes != 0 {
                    config.max_frame_bytes = file.max_frame_bytes;
                }
                if !file.allowed_frame_types.is_empty() {
                    config.allowed_frame_types = file.allowed_frame_types;
                }
                if file.heartbeat_timeout_ms != 0 {
                    config.heartbeat_timeout_ms = file.heartbeat_timeout_ms;
                }
                config.grant_key = file.grant_key.map(|k| GrantKey::new(k.key, k.secret));
            } else {
                tracing::warn!(
                    path = %file_path.display(),
                    "failed to parse relayd config, using defaults"
                );
            }
        }

        Ok(config)
    }

    /// Saves configuration to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = ConfigFile {
            port: self.port,
            max_frame_bytes: self.max_frame_bytes,
            allowed_frame_types: self.allowed_frame_types.clone(),
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            grant_key: self.grant_key.as_ref().map(|k| GrantKeyFile {
                key: k.key().to_string(),
                secret: k.secret().to_string(),
            }),
        };

        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.file_path, &json)?;
        set_permissions_0600(&self.file_path);

        tracing::debug!("relayd configuration saved");
        Ok(())
    }

    /// Server configuration derived from this config.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            max_frame_bytes: self.max_frame_bytes,
            allowed_frame_types: self.allowed_frame_types.clone(),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
        }
    }

    /// Returns the grant key, generating and persisting one on first run.
    pub fn ensure_grant_key(&mut self) -> anyhow::Result<GrantKey> {
        if let Some(key) = &self.grant_key {
            return Ok(key.clone());
        }

        let key = GrantKey::generate();
        self.grant_key = Some(key.clone());
        self.save()?;
        tracing::info!(
            key = %key.key(),
            path = %self.file_path.display(),
            "generated grant key, secret stored alongside it"
        );
        Ok(key)
    }
}

fn set_permissions_0600(path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

fn config_file_path() -> anyhow::Result<PathBuf> {
    let config_dir = config_base_dir()?;
    Ok(config_dir.join("nestcast-relayd").join("config.json"))
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
