//! The connection primitives the session core is built on.
//!
//! A [`Transport`] owns the wire protocol. The core only sees opaque handles:
//! it connects, reads the host key the server presented during the
//! handshake, authenticates, and moves bytes.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;

use crate::config::SessionSettings;
use crate::error::SshError;

use super::handle::{HandleId, SessionHandle};

/// Per-connection timeouts applied right after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimeouts {
    /// Bound on opening a channel (exec, shell, forward); `None` waits forever
    pub session_timeout: Option<Duration>,
    /// How long `read` waits before reporting an idle tick; `None` waits forever
    pub read_timeout: Option<Duration>,
    /// Interval between keepalive requests; `None` sends none
    pub keepalive_interval: Option<Duration>,
    /// Ask the server to answer each keepalive
    pub keepalive_reply: bool,
}

impl TransportTimeouts {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            session_timeout: settings.connect_timeout(),
            read_timeout: settings.read_timeout(),
            keepalive_interval: settings.keepalive_interval(),
            keepalive_reply: settings.keepalive_reply,
        }
    }
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

/// Run `step`, failing with [`SshError::Timeout`] if `limit` passes first.
/// No limit means no deadline.
pub(crate) async fn within<T>(
    limit: Option<Duration>,
    step: impl Future<Output = Result<T, SshError>>,
    what: impl FnOnce() -> String,
) -> Result<T, SshError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, step)
            .await
            .map_err(|_| SshError::Timeout(format!("{} took longer than {:?}", what(), limit)))?,
        None => step.await,
    }
}

/// A local listening port tunnelled to `target_host:target_port` through
/// the SSH connection. Port 0 binds an ephemeral port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalForward {
    pub local_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl LocalForward {
    pub fn new(local_port: u16, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            local_port,
            target_host: target_host.into(),
            target_port,
        }
    }
}

impl std::fmt::Display for LocalForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}:{}", self.local_port, self.target_host, self.target_port)
    }
}

/// Blocking-style SSH primitives exposed as futures.
///
/// Every method except [`connect`](Transport::connect) and
/// [`disconnect`](Transport::disconnect) addresses an existing connection by
/// [`HandleId`]; unknown or closed ids fail with [`SshError::HandleUnavailable`].
pub trait Transport: Send + Sync + 'static {
    /// Open TCP and complete the protocol handshake. No authentication.
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<SessionHandle, SshError>> + Send;

    fn configure(
        &self,
        handle: HandleId,
        timeouts: TransportTimeouts,
    ) -> impl Future<Output = Result<(), SshError>> + Send;

    /// Raw `"<key_type>|<fingerprint>"` of the key presented in the handshake.
    fn host_key_info(&self, handle: HandleId)
    -> impl Future<Output = Result<String, SshError>> + Send;

    fn auth_password(
        &self,
        handle: HandleId,
        username: &str,
        password: &SecretString,
    ) -> impl Future<Output = Result<(), SshError>> + Send;

    fn auth_key(
        &self,
        handle: HandleId,
        username: &str,
        key_path: &Path,
        passphrase: Option<&SecretString>,
    ) -> impl Future<Output = Result<(), SshError>> + Send;

    /// Run one command on a fresh channel and collect its stdout.
    fn exec(
        &self,
        handle: HandleId,
        command: &str,
    ) -> impl Future<Output = Result<String, SshError>> + Send;

    /// Open (or replace) the interactive PTY shell of this connection.
    fn open_shell(
        &self,
        handle: HandleId,
        cols: u16,
        rows: u16,
    ) -> impl Future<Output = Result<(), SshError>> + Send;

    fn write(
        &self,
        handle: HandleId,
        data: &[u8],
    ) -> impl Future<Output = Result<(), SshError>> + Send;

    /// Next chunk of shell output.
    ///
    /// `Ok(None)` means the remote side closed the shell. An empty chunk means
    /// the idle-read timeout elapsed with nothing to read. Cancel-safe.
    fn read(
        &self,
        handle: HandleId,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, SshError>> + Send;

    fn resize(
        &self,
        handle: HandleId,
        cols: u16,
        rows: u16,
    ) -> impl Future<Output = Result<(), SshError>> + Send;

    /// Start forwarding a local port through an authenticated connection and
    /// return the bound port. Requesting a forward that is already running
    /// returns its port without binding again.
    fn forward_local(
        &self,
        handle: HandleId,
        forward: &LocalForward,
    ) -> impl Future<Output = Result<u16, SshError>> + Send;

    /// Stop every forward on this connection; returns how many were running.
    fn stop_forwards(&self, handle: HandleId) -> impl Future<Output = usize> + Send;

    /// Close the connection and stop its forwards. Consuming the handle is
    /// what makes this the owner's call.
    fn disconnect(&self, handle: SessionHandle) -> impl Future<Output = ()> + Send;
}
