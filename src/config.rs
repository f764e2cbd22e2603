//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `TETHER_TOKEN`, `TETHER_LISTEN`,
//!    `TETHER_DEVICE_ID`, `TETHER_URL`, `TETHER_BASE_URL`
//! 2. **Config file**: path via `--config <path>`, or `tether.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [controller]
//! listen = "0.0.0.0:8000"
//! bridge_timeout_secs = 5          # unmatched bridge lifetime
//! call_timeout_secs = 10           # request/callback round trips
//! heartbeat_timeout_secs = 90      # evict silent agents
//!
//! [agent]
//! url = "ws://controller:8000/api/device/register"
//! base_url = "http://controller:8000"
//! device_id = "agent-0001"
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! heartbeat_interval_secs = 30
//!
//! [auth]
//! token = "shared-secret"
//!
//! [archive]
//! queue_capacity = 64
//! workers = 4
//! chunk_size = 32768
//!
//! [terminal]
//! idle_timeout_secs = 300
//! sweep_interval_secs = 30
//! # shell = "/bin/bash"            # default: zsh > bash > sh
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "tether.toml";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Controller (HTTP + registration socket) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Socket address to bind (default `0.0.0.0:8000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds an unmatched bridge stays open before the waiting request
    /// fails with 504 (default 5).
    #[serde(default = "default_bridge_timeout")]
    pub bridge_timeout_secs: u64,
    /// Seconds to wait for an agent callback on request/reply actions
    /// (default 10).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Seconds without a heartbeat before an agent is evicted (default 90).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
}

/// Agent (outbound client) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Registration WebSocket URL on the controller.
    #[serde(default = "default_agent_url")]
    pub url: String,
    /// Base HTTP URL used for bridge exchanges (`/api/bridge/*`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Identifier this agent registers under. Override with `TETHER_DEVICE_ID`.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// Initial reconnect backoff in seconds (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect backoff in seconds (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Seconds between heartbeat pings (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// Shared secret between agents, operators and the controller.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_token")]
    pub token: String,
}

/// Archive upload pipeline tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Bounded job queue capacity (default 64).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Worker tasks draining the queue (default 4).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Read size when copying a file into the archive (default 32 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Terminal multiplexer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Sessions idle longer than this are closed by the sweep (default 300).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds between idle sweeps (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Shell override. When unset the first of zsh, bash, sh that exists wins.
    #[serde(default)]
    pub shell: Option<String>,
    /// Initial PTY rows (default 24).
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Initial PTY columns (default 80).
    #[serde(default = "default_cols")]
    pub cols: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_bridge_timeout() -> u64 {
    5
}
fn default_call_timeout() -> u64 {
    10
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_agent_url() -> String {
    "ws://127.0.0.1:8000/api/device/register".to_string()
}
fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_device_id() -> String {
    "tether-agent-0001".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_token() -> String {
    "change-me".to_string()
}
fn default_queue_capacity() -> usize {
    64
}
fn default_workers() -> usize {
    4
}
fn default_chunk_size() -> usize {
    32 * 1024
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bridge_timeout_secs: default_bridge_timeout(),
            call_timeout_secs: default_call_timeout(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: default_agent_url(),
            base_url: default_base_url(),
            device_id: default_device_id(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            shell: None,
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ControllerConfig {
    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl TerminalConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `tether.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(token) = var("TETHER_TOKEN") {
            self.auth.token = token;
        }
        if let Some(listen) = var("TETHER_LISTEN") {
            self.controller.listen = listen;
        }
        if let Some(id) = var("TETHER_DEVICE_ID") {
            self.agent.device_id = id;
        }
        if let Some(url) = var("TETHER_URL") {
            self.agent.url = url;
        }
        if let Some(url) = var("TETHER_BASE_URL") {
            self.agent.base_url = url;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.controller.bridge_timeout(), Duration::from_secs(5));
        assert_eq!(c.archive.queue_capacity, 64);
        assert_eq!(c.archive.chunk_size, 32768);
        assert_eq!(c.terminal.idle_timeout(), Duration::from_secs(300));
        assert_eq!(c.terminal.sweep_interval(), Duration::from_secs(30));
        assert!(c.terminal.shell.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let c = Config::parse(
            "inline",
            "[archive]\nworkers = 2\n\n[terminal]\nshell = \"/bin/cat\"\n",
        )
        .unwrap();
        assert_eq!(c.archive.workers, 2);
        assert_eq!(c.archive.queue_capacity, 64);
        assert_eq!(c.terminal.shell.as_deref(), Some("/bin/cat"));
        assert_eq!(c.controller.listen, "0.0.0.0:8000");
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = Config::parse("bad.toml", "[archive\n").unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        c.apply_env(|k| match k {
            "TETHER_TOKEN" => Some("s3cret".into()),
            "TETHER_DEVICE_ID" => Some("box-7".into()),
            _ => None,
        });
        assert_eq!(c.auth.token, "s3cret");
        assert_eq!(c.agent.device_id, "box-7");
        assert_eq!(c.controller.listen, "0.0.0.0:8000");
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(matches!(
            Config::load(Some("/nonexistent/tether.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
