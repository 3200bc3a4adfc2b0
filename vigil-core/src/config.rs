//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/vigil/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/vigil/` (~/.config/vigil/)
//! - Data (session store): `$XDG_DATA_HOME/vigil/` (~/.local/share/vigil/)
//! - State/Logs: `$XDG_STATE_HOME/vigil/` (~/.local/state/vigil/)

use crate::error::{Error, Result};
use crate::types::AgentType;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Monitor policy knobs (correlation window, timeouts, intervals)
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Agent transcript root overrides
    #[serde(default)]
    pub agents: AgentOverrides,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults
    /// when no config file exists.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Path to the config file
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("vigil/config.toml")
    }

    /// Root of the session store
    pub fn store_root() -> PathBuf {
        xdg_data_home().join("vigil/sessions")
    }

    /// Directory for log files
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("vigil")
    }

    /// Path to the current log file
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("vigil.log")
    }

    /// Transcript root for an agent, honoring config overrides.
    pub fn transcript_root(&self, agent: AgentType) -> Option<PathBuf> {
        let override_path = match agent {
            AgentType::ClaudeCode => self.agents.claude_code_path.clone(),
            AgentType::Codex => self.agents.codex_path.clone(),
        };
        override_path.or_else(|| agent.default_transcript_root())
    }
}

/// Monitor policy constants.
///
/// The exact values are tuning knobs, not contracts; every one of them can be
/// overridden in the `[monitor]` section of config.toml.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Backward tolerance when matching transcript mtimes against launch
    /// time, in seconds (absorbs clock/IO skew)
    #[serde(default = "default_epsilon_secs")]
    pub epsilon_secs: u64,

    /// How long to wait for a transcript to appear before giving up
    /// on correlation, in seconds
    #[serde(default = "default_delta_secs")]
    pub delta_secs: u64,

    /// Quiet period after which a running session is considered over,
    /// in seconds
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_secs: u64,

    /// Interval between transcript re-reads when no watch event arrives,
    /// in milliseconds
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// Polling interval for `tail`, in seconds
    #[serde(default = "default_tail_poll_secs")]
    pub tail_poll_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            epsilon_secs: default_epsilon_secs(),
            delta_secs: default_delta_secs(),
            inactivity_secs: default_inactivity_secs(),
            poll_ms: default_poll_ms(),
            tail_poll_secs: default_tail_poll_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn epsilon(&self) -> Duration {
        Duration::from_secs(self.epsilon_secs)
    }

    pub fn delta(&self) -> Duration {
        Duration::from_secs(self.delta_secs)
    }

    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn tail_poll(&self) -> Duration {
        Duration::from_secs(self.tail_poll_secs)
    }
}

fn default_epsilon_secs() -> u64 {
    1
}

fn default_delta_secs() -> u64 {
    30
}

fn default_inactivity_secs() -> u64 {
    600
}

fn default_poll_ms() -> u64 {
    500
}

fn default_tail_poll_secs() -> u64 {
    3
}

/// Override paths for agent transcript roots
#[derive(Debug, Deserialize, Default)]
pub struct AgentOverrides {
    /// Override transcript root for Claude Code
    pub claude_code_path: Option<PathBuf>,
    /// Override transcript root for Codex
    pub codex_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.monitor.epsilon_secs, 1);
        assert_eq!(config.monitor.delta_secs, 30);
        assert_eq!(config.monitor.inactivity_secs, 600);
        assert_eq!(config.monitor.tail_poll_secs, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [monitor]
            delta_secs = 60

            [agents]
            claude_code_path = "/tmp/claude"
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.delta_secs, 60);
        // Untouched keys keep their defaults
        assert_eq!(config.monitor.epsilon_secs, 1);
        assert_eq!(
            config.transcript_root(crate::types::AgentType::ClaudeCode),
            Some(PathBuf::from("/tmp/claude"))
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load_from(&PathBuf::from("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.monitor.poll_ms, 500);
    }
}
