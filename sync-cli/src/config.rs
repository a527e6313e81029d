//! Configuration management for huddle-sync.

use anyhow::{Context, Result};
use huddle_sync_client::SyncConfig;
use huddle_sync_types::UserId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the configured token.
pub const TOKEN_ENV: &str = "HUDDLE_TOKEN";

/// Config file name inside the platform config directory.
const CONFIG_FILE: &str = "config.toml";

/// CLI configuration, loaded from TOML.
#[derive(Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// REST base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Event channel URL.
    #[serde(default = "default_socket_url")]
    pub socket_url: String,

    /// Bearer token. `HUDDLE_TOKEN` takes precedence.
    #[serde(default)]
    pub token: String,

    /// Id of the signed-in user.
    pub user_id: String,

    /// Typing indicator expiry in seconds.
    #[serde(default = "default_typing_timeout_secs")]
    pub typing_timeout_secs: u64,

    /// Re-fetch and re-join after a reconnect.
    #[serde(default)]
    pub rejoin_on_reconnect: bool,
}

fn default_api_url() -> String {
    "http://localhost:3000/api".to_string()
}

fn default_socket_url() -> String {
    "ws://localhost:3000/socket".to_string()
}

fn default_typing_timeout_secs() -> u64 {
    3
}

impl CliConfig {
    /// Load configuration from `path`, or from the platform config
    /// directory when no path is given.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };
        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::parse(&contents)?;
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            config.token = token;
        }
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Invalid configuration")
    }

    /// Build the engine configuration.
    pub fn to_sync_config(&self) -> Result<SyncConfig> {
        anyhow::ensure!(
            !self.token.is_empty(),
            "No token configured. Set 'token' in the config file or {TOKEN_ENV}."
        );
        Ok(SyncConfig::new(
            self.api_url.clone(),
            self.socket_url.clone(),
            self.token.clone(),
            UserId::new(self.user_id.clone()),
        )
        .with_typing_timeout(Duration::from_secs(self.typing_timeout_secs))
        .with_rejoin_on_reconnect(self.rejoin_on_reconnect))
    }
}

impl std::fmt::Debug for CliConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliConfig")
            .field("api_url", &self.api_url)
            .field("socket_url", &self.socket_url)
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("typing_timeout_secs", &self.typing_timeout_secs)
            .field("rejoin_on_reconnect", &self.rejoin_on_reconnect)
            .finish()
    }
}

/// Default config file location.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("chat", "huddle", "huddle-sync")
        .context("Could not determine home directory")?;
    Ok(dirs.config_dir().join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = CliConfig::parse(r#"user_id = "u1""#).unwrap();

        assert_eq!(config.api_url, "http://localhost:3000/api");
        assert_eq!(config.socket_url, "ws://localhost:3000/socket");
        assert_eq!(config.typing_timeout_secs, 3);
        assert!(config.token.is_empty());
        assert!(!config.rejoin_on_reconnect);
    }

    #[test]
    fn missing_user_id_is_an_error() {
        assert!(CliConfig::parse(r#"token = "t""#).is_err());
    }

    #[test]
    fn sync_config_requires_token() {
        let config = CliConfig::parse(r#"user_id = "u1""#).unwrap();
        assert!(config.to_sync_config().is_err());
    }

    #[test]
    fn sync_config_carries_settings() {
        let config = CliConfig::parse(
            r#"
            api_url = "https://chat.test/api"
            socket_url = "wss://chat.test/socket"
            token = "secret"
            user_id = "u1"
            typing_timeout_secs = 5
            rejoin_on_reconnect = true
            "#,
        )
        .unwrap();

        let sync = config.to_sync_config().unwrap();
        assert_eq!(sync.api_url, "https://chat.test/api");
        assert_eq!(sync.local_user, UserId::new("u1"));
        assert_eq!(sync.typing_timeout, Duration::from_secs(5));
        assert!(sync.rejoin_on_reconnect);
    }

    #[test]
    fn debug_redacts_token() {
        let config = CliConfig::parse("user_id = \"u1\"\ntoken = \"hunter2\"").unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "user_id = \"u7\"\nsocket_url = \"ws://x\"")
            .await
            .unwrap();

        let config = CliConfig::load(Some(&path)).await.unwrap();

        assert_eq!(config.user_id, "u7");
        assert_eq!(config.socket_url, "ws://x");
    }

    #[tokio::test]
    async fn load_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = CliConfig::load(Some(&dir.path().join("absent.toml"))).await;
        assert!(result.is_err());
    }
}
