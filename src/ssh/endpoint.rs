use std::fmt;
use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

/// Where to connect and as whom.
///
/// `(hostname, port, username)` is the session identity used for reuse;
/// host key trust only looks at `(hostname, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub username: String,
}

impl Endpoint {
    pub fn new(hostname: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            username: username.into(),
        }
    }

    pub fn matches(&self, host: &str, port: u16, username: &str) -> bool {
        self.port == port && self.hostname == host && self.username == username
    }

    /// Parse `user@host[:port]`; port defaults to 22. IPv6 hosts use `[addr]:port`.
    pub fn parse(target: &str) -> Option<Self> {
        let (username, rest) = target.split_once('@')?;
        if username.is_empty() || rest.is_empty() {
            return None;
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']')?;
            match after.strip_prefix(':') {
                Some(port) => (host, port.parse().ok()?),
                None if after.is_empty() => (host, 22),
                None => return None,
            }
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().ok()?),
                None => (rest, 22),
            }
        };

        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port, username))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// Authentication material for one connection attempt
pub enum Credentials {
    Password(SecretString),
    PrivateKey {
        key_path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        let password: String = password.into();
        Credentials::Password(SecretString::new(password.into()))
    }

    pub fn private_key(key_path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        Credentials::PrivateKey {
            key_path: key_path.into(),
            passphrase: passphrase.map(|p| SecretString::new(p.into())),
        }
    }

    /// Method name used in audit logs
    pub fn method_name(&self) -> &'static str {
        match self {
            Credentials::Password(_) => "password",
            Credentials::PrivateKey { .. } => "publickey",
        }
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        match self {
            Credentials::Password(password) => {
                Credentials::Password(SecretString::new(password.expose_secret().to_string().into()))
            }
            Credentials::PrivateKey {
                key_path,
                passphrase,
            } => Credentials::PrivateKey {
                key_path: key_path.clone(),
                passphrase: passphrase
                    .as_ref()
                    .map(|p| SecretString::new(p.expose_secret().to_string().into())),
            },
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.debug_tuple("Password").field(&"[REDACTED]").finish(),
            Credentials::PrivateKey {
                key_path,
                passphrase,
            } => f
                .debug_struct("PrivateKey")
                .field("key_path", key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "[REDACTED]"))
                .finish(),
        }
    }
}
