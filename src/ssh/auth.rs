use std::path::Path;
use std::sync::Arc;

use russh::keys::{HashAlg, PrivateKeyWithHashAlg};
use secrecy::{ExposeSecret, SecretString};

use crate::config::paths;
use crate::error::SshError;

/// Load a private key for public key authentication.
///
/// `~/` in the path is expanded. RSA keys sign with SHA-512; other key types
/// use their native algorithm.
pub fn load_private_key(
    path: &Path,
    passphrase: Option<&SecretString>,
) -> Result<PrivateKeyWithHashAlg, SshError> {
    let path = paths::expand_tilde(&path.to_string_lossy());

    let content = std::fs::read_to_string(&path).map_err(|e| {
        SshError::KeyFile(format!("Cannot read key file {}: {}", path.display(), e))
    })?;

    let first_line = content.lines().next().unwrap_or("");
    if first_line.starts_with("ssh-") || first_line.starts_with("ecdsa-") {
        return Err(SshError::KeyFile(format!(
            "File {} contains a PUBLIC key, not a private key",
            path.display()
        )));
    }
    if !first_line.starts_with("-----BEGIN") {
        return Err(SshError::KeyFile(format!(
            "File {} does not appear to be a valid SSH private key",
            path.display()
        )));
    }

    let passphrase = passphrase.map(|p| p.expose_secret());
    let key = russh::keys::load_secret_key(&path, passphrase).map_err(|e| {
        let normalized = e.to_string().to_lowercase();
        let is_passphrase_error = normalized.contains("encrypted")
            || normalized.contains("passphrase")
            || normalized.contains("cryptographic");
        match (is_passphrase_error, passphrase.is_some()) {
            (true, true) => {
                SshError::KeyFile(format!("Wrong passphrase for key {}", path.display()))
            }
            (true, false) => {
                SshError::KeyFile(format!("Key {} requires a passphrase", path.display()))
            }
            _ => SshError::KeyFile(format!("Failed to load key {}: {}", path.display(), e)),
        }
    })?;

    let hash_alg = if key.algorithm().is_rsa() {
        Some(HashAlg::Sha512)
    } else {
        None
    };
    Ok(PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
}
