use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use russh::client::Handler;
use russh::keys::{HashAlg, PublicKey};

use crate::error::SshError;

/// Server key captured during the handshake, read back by the verifier
pub type CapturedKey = Arc<Mutex<Option<PublicKey>>>;

/// `"<algorithm>|<SHA256 fingerprint>"` for a server key
pub fn key_info_string(key: &PublicKey) -> String {
    format!(
        "{}|{}",
        key.algorithm().as_str(),
        key.fingerprint(HashAlg::Sha256)
    )
}

/// SSH client handler that records the server key.
///
/// Trust is decided after the handshake and before authentication by the
/// host key verifier, so the handshake itself accepts any key.
pub struct ClientHandler {
    host: String,
    port: u16,
    server_key: CapturedKey,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, server_key: CapturedKey) -> Self {
        Self {
            host,
            port,
            server_key,
        }
    }
}

impl Handler for ClientHandler {
    type Error = SshError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        tracing::debug!(
            "Server key for {}:{}: {}",
            self.host,
            self.port,
            key_info_string(server_public_key)
        );
        *self.server_key.lock() = Some(server_public_key.clone());
        async { Ok(true) }
    }
}
