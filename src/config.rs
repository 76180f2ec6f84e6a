// ── Gisma Link: Client Configuration ───────────────────────────────────────
//
// `ClientConfig` is read from `<config_dir>/gisma/config.toml` when present,
// then `GISMA_SERVER_URL` / `GISMA_WS_PATH` override the file. Every field has
// a default, so an absent or partial file is fine.
//
//   server_url = "https://chat.example.com"
//   stall_timeout_ms = 800

use crate::atoms::constants::*;
use crate::atoms::error::{LinkError, LinkResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_SERVER_URL: &str = "GISMA_SERVER_URL";
pub const ENV_WS_PATH: &str = "GISMA_WS_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub ws_path: String,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub heartbeat_incoming_ms: u64,
    pub heartbeat_outgoing_ms: u64,
    pub stall_timeout_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_url: DEFAULT_SERVER_URL.to_string(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            reconnect_delay_ms: RECONNECT_BASE_DELAY_MS,
            max_reconnect_delay_ms: MAX_RECONNECT_DELAY_MS,
            heartbeat_incoming_ms: HEARTBEAT_INCOMING_MS,
            heartbeat_outgoing_ms: HEARTBEAT_OUTGOING_MS,
            stall_timeout_ms: STALL_TIMEOUT_MS,
            stop_grace_ms: STOP_GRACE_MS,
        }
    }
}

impl ClientConfig {
    /// Default location: `<config_dir>/gisma/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("gisma").join("config.toml"))
    }

    /// File (if any) at the default path, then environment overrides.
    pub fn load() -> LinkResult<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> LinkResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| LinkError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> LinkResult<Self> {
        let config: ClientConfig = toml::from_str(content)
            .map_err(|e| LinkError::Config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GISMA_*` overrides through `lookup` (normally `std::env::var`).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SERVER_URL).filter(|v| !v.trim().is_empty()) {
            self.server_url = url.trim().to_string();
        }
        if let Some(path) = lookup(ENV_WS_PATH).filter(|v| !v.trim().is_empty()) {
            self.ws_path = path.trim().to_string();
        }
    }

    pub fn validate(&self) -> LinkResult<()> {
        let url = url::Url::parse(&self.server_url)
            .map_err(|e| LinkError::Config(format!("server_url '{}': {}", self.server_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LinkError::Config(format!(
                "server_url must be http(s)://, got '{}'",
                self.server_url
            )));
        }
        if !self.ws_path.starts_with('/') {
            return Err(LinkError::Config(format!("ws_path must start with '/', got '{}'", self.ws_path)));
        }
        if self.connect_timeout_ms == 0 {
            return Err(LinkError::Config("connect_timeout_ms must be > 0".into()));
        }
        if self.reconnect_delay_ms == 0 || self.max_reconnect_delay_ms < self.reconnect_delay_ms {
            return Err(LinkError::Config(
                "reconnect_delay_ms must be > 0 and <= max_reconnect_delay_ms".into(),
            ));
        }
        if self.stall_timeout_ms == 0 {
            return Err(LinkError::Config("stall_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Heart-beat request as `(outgoing, incoming)` milliseconds.
    pub fn heartbeat(&self) -> (u64, u64) {
        (self.heartbeat_outgoing_ms, self.heartbeat_incoming_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_server_contract() {
        let c = ClientConfig::default();
        assert_eq!(c.server_url, "http://localhost:8080");
        assert_eq!(c.ws_path, "/ws/websocket");
        assert_eq!(c.heartbeat(), (4000, 4000));
        assert_eq!(c.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(c.max_reconnect_delay(), Duration::from_secs(30));
        assert_eq!(c.stall_timeout(), Duration::from_millis(500));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = ClientConfig::from_toml("server_url = \"https://chat.example.com\"\nstall_timeout_ms = 800\n")
            .unwrap();
        assert_eq!(c.server_url, "https://chat.example.com");
        assert_eq!(c.stall_timeout_ms, 800);
        assert_eq!(c.connect_timeout_ms, 10_000);
    }

    #[test]
    fn env_overrides_win_over_file() {
        let env: HashMap<&str, &str> =
            [(ENV_SERVER_URL, " https://prod.example.com "), (ENV_WS_PATH, "/socket")].into_iter().collect();
        let mut c = ClientConfig::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.server_url, "https://prod.example.com");
        assert_eq!(c.ws_path, "/socket");
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut c = ClientConfig::default();
        c.apply_overrides(|_| Some("   ".to_string()));
        assert_eq!(c, ClientConfig::default());
    }

    #[test]
    fn invalid_values_are_config_errors() {
        assert!(matches!(ClientConfig::from_toml("server_url = \"ftp://x\""), Err(LinkError::Config(_))));
        assert!(matches!(ClientConfig::from_toml("ws_path = \"ws\""), Err(LinkError::Config(_))));
        assert!(matches!(ClientConfig::from_toml("stall_timeout_ms = 0"), Err(LinkError::Config(_))));
        assert!(matches!(
            ClientConfig::from_toml("reconnect_delay_ms = 5000\nmax_reconnect_delay_ms = 1000"),
            Err(LinkError::Config(_))
        ));
        assert!(matches!(ClientConfig::from_toml("server_url = 3"), Err(LinkError::Config(_))));
    }
}
