use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What to do with a host whose key has never been seen.
///
/// A key that *differs* from a stored record always goes to the challenge
/// handler, whatever the policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Refuse unknown hosts without asking (unattended reconnection).
    Strict,
    /// Trust unknown hosts for this connection only, without asking or saving.
    AcceptOnce,
    /// Ask the challenge handler.
    #[default]
    AskUser,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Connection settings stored in settings.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// 0 disables keepalive
    #[serde(default)]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_true")]
    pub keepalive_reply: bool,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// Unset means a trust prompt waits until someone answers it.
    #[serde(default)]
    pub decision_timeout_secs: Option<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            keepalive_interval_secs: 0,
            keepalive_reply: true,
            host_key_policy: HostKeyPolicy::default(),
            decision_timeout_secs: None,
        }
    }
}

impl SessionSettings {
    /// Load from the default settings file, creating it if it does not exist
    pub fn load() -> Result<Self, ConfigError> {
        let path = default_path()?;
        if !path.exists() {
            let settings = Self::default();
            settings.save()?;
            return Ok(settings);
        }
        Self::load_from(&path)
    }

    /// Load from an explicit path; missing fields fall back to defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save to the default settings file
    pub fn save(&self) -> Result<(), ConfigError> {
        super::paths::ensure_config_dir().map_err(ConfigError::CreateDir)?;
        self.save_to(&default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        super::write_atomic(path, &content).map_err(|e| ConfigError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Bound on connect, auth and exec; `None` when set to 0
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }

    /// Idle-read timeout; `None` when set to 0
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }

    /// Keepalive interval; `None` when set to 0
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn decision_timeout(&self) -> Option<Duration> {
        self.decision_timeout_secs.map(Duration::from_secs)
    }
}

fn default_path() -> Result<PathBuf, ConfigError> {
    super::paths::settings_file().ok_or_else(|| ConfigError::ReadFile {
        path: PathBuf::from("settings.toml"),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine settings file path",
        ),
    })
}
