use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create config directory: {0}")]
    CreateDir(std::io::Error),
}

/// SSH session errors
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Host key rejected for {host}:{port}: {reason}")]
    HostKeyRejected {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Malformed host key info: {0:?}")]
    MalformedHostKeyInfo(String),

    #[error("Connection handle is not available")]
    HandleUnavailable,

    #[error("Session is not connected")]
    NotConnected,

    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Port forward failed: {0}")]
    Forward(String),

    #[error("russh error: {0}")]
    Russh(String),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Russh(err.to_string())
    }
}

impl SshError {
    /// True for failures of the trust decision rather than of the network.
    pub fn is_host_key_rejection(&self) -> bool {
        matches!(self, SshError::HostKeyRejected { .. })
    }
}
