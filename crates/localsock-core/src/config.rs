use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default `SO_RCVTIMEO`-style receive timeout for client sockets, in milliseconds.
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 10_000;
/// Default `SO_SNDTIMEO`-style send timeout for client sockets, in milliseconds.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 10_000;
/// Default client socket deadline. 0 disables the deadline.
pub const DEFAULT_DEADLINE_MS: u64 = 0;
/// Default pending-connection queue length for the server socket.
pub const DEFAULT_BACKLOG: u32 = 50;

/// Defaults applied to a [`RunConfig`](crate::RunConfig) for every tunable the
/// caller leaves unset.
///
/// Loaded from `~/.config/localsock/config.toml` when present:
///
/// ```toml
/// receive_timeout_ms = 5000
/// backlog = 16
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketDefaults {
    /// Per-call receive timeout in milliseconds (0 = wait forever)
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
    /// Per-call send timeout in milliseconds (0 = wait forever)
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    /// Absolute connection lifetime in milliseconds (0 = no deadline)
    #[serde(default = "default_deadline")]
    pub deadline_ms: u64,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for SocketDefaults {
    fn default() -> Self {
        Self {
            receive_timeout_ms: default_receive_timeout(),
            send_timeout_ms: default_send_timeout(),
            deadline_ms: default_deadline(),
            backlog: default_backlog(),
        }
    }
}

fn default_receive_timeout() -> u64 {
    DEFAULT_RECEIVE_TIMEOUT_MS
}

fn default_send_timeout() -> u64 {
    DEFAULT_SEND_TIMEOUT_MS
}

fn default_deadline() -> u64 {
    DEFAULT_DEADLINE_MS
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

impl SocketDefaults {
    /// Load defaults from the user config file, or the published defaults if it does not exist
    pub fn load() -> crate::Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load defaults from a specific TOML file
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse defaults from TOML text, filling missing keys with the published defaults
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let defaults: Self =
            toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))?;
        defaults.validate()?;
        Ok(defaults)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.backlog == 0 {
            return Err(crate::Error::Config(
                "backlog must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the configuration file path
    /// Always uses ~/.config/localsock/config.toml on all platforms
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("localsock")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_published_defaults() {
        let defaults = SocketDefaults::default();
        assert_eq!(defaults.receive_timeout_ms, 10_000);
        assert_eq!(defaults.send_timeout_ms, 10_000);
        assert_eq!(defaults.deadline_ms, 0);
        assert_eq!(defaults.backlog, 50);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let defaults = SocketDefaults::from_toml_str("backlog = 8\ndeadline_ms = 2000\n").unwrap();
        assert_eq!(defaults.backlog, 8);
        assert_eq!(defaults.deadline_ms, 2000);
        assert_eq!(defaults.receive_timeout_ms, DEFAULT_RECEIVE_TIMEOUT_MS);
        assert_eq!(defaults.send_timeout_ms, DEFAULT_SEND_TIMEOUT_MS);
    }

    #[test]
    fn test_zero_backlog_rejected() {
        let err = SocketDefaults::from_toml_str("backlog = 0").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "send_timeout_ms = 250\n").unwrap();

        let defaults = SocketDefaults::load_from(&path).unwrap();
        assert_eq!(defaults.send_timeout_ms, 250);
        assert_eq!(defaults.backlog, DEFAULT_BACKLOG);
    }
}
