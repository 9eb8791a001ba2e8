//! Acquisition strategies for SSH connections.
//!
//! Every path that opens a transport connection runs host key verification
//! before authentication, and closes whatever it opened if a later step fails.

use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionSettings;
use crate::error::SshError;
use crate::security_log;

use super::endpoint::{Credentials, Endpoint};
use super::handle::{HandleId, SessionHandle};
use super::host_key_verification::{ChallengeHandler, HostKeyCheck, parse_host_key_info};
use super::registry::{SessionId, SessionRegistry};
use super::transport::{Transport, TransportTimeouts, within};
use super::verifier::HostKeyVerifier;

/// A connection handed to a consumer
#[derive(Debug)]
#[must_use = "an acquired handle must be released, parked or attached"]
pub struct Acquired {
    pub handle: SessionHandle,
    /// Adopted from the registry's shared slot rather than freshly opened
    pub shared: bool,
    /// Slot the shared handle was taken from
    pub source: Option<SessionId>,
}

impl Acquired {
    fn dedicated(handle: SessionHandle) -> Self {
        Self {
            handle,
            shared: false,
            source: None,
        }
    }
}

pub struct SessionConnector<T: Transport> {
    transport: Arc<T>,
    verifier: Arc<HostKeyVerifier>,
    registry: Arc<SessionRegistry<T>>,
    challenge_handler: Arc<dyn ChallengeHandler>,
    settings: SessionSettings,
}

impl<T: Transport> SessionConnector<T> {
    pub fn new(
        transport: Arc<T>,
        verifier: Arc<HostKeyVerifier>,
        registry: Arc<SessionRegistry<T>>,
        challenge_handler: Arc<dyn ChallengeHandler>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            transport,
            verifier,
            registry,
            challenge_handler,
            settings,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<T>> {
        &self.registry
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Connect and complete the handshake within `timeout` (`None` waits as
    /// long as the transport does), then apply the configured timeouts and
    /// keepalive. Does not authenticate.
    pub async fn connect_only(
        &self,
        endpoint: &Endpoint,
        timeout: Option<Duration>,
    ) -> Result<SessionHandle, SshError> {
        tracing::debug!("Connecting to {}:{}", endpoint.hostname, endpoint.port);

        let connect = self.transport.connect(&endpoint.hostname, endpoint.port);
        let handle = within(timeout, connect, || {
            format!("connecting to {}:{}", endpoint.hostname, endpoint.port)
        })
        .await?;

        let timeouts = TransportTimeouts::from_settings(&self.settings);
        if let Err(e) = self.transport.configure(handle.id(), timeouts).await {
            self.transport.disconnect(handle).await;
            return Err(e);
        }

        tracing::debug!(
            "Connected to {}:{} as {}",
            endpoint.hostname,
            endpoint.port,
            handle.id()
        );
        Ok(handle)
    }

    /// Authenticate an open connection. On failure the handle stays open and
    /// still belongs to the caller.
    pub async fn authenticate(
        &self,
        handle: &SessionHandle,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<(), SshError> {
        let method = credentials.method_name();
        security_log::log_auth_attempt(endpoint, method);

        let attempt = async {
            match credentials {
                Credentials::Password(password) => {
                    self.transport
                        .auth_password(handle.id(), &endpoint.username, password)
                        .await
                }
                Credentials::PrivateKey {
                    key_path,
                    passphrase,
                } => {
                    self.transport
                        .auth_key(handle.id(), &endpoint.username, key_path, passphrase.as_ref())
                        .await
                }
            }
        };

        let result = within(self.settings.connect_timeout(), attempt, || {
            format!("authenticating to {}:{}", endpoint.hostname, endpoint.port)
        })
        .await;

        security_log::log_auth_result(endpoint, method, &result);
        result
    }

    /// Open a dedicated, verified and authenticated connection.
    pub async fn connect_fresh(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<SessionHandle, SshError> {
        let handle = self
            .connect_only(endpoint, self.settings.connect_timeout())
            .await?;

        match self.verify_and_authenticate(&handle, endpoint, credentials).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                tracing::debug!("Closing {} after failed setup: {}", handle.id(), e);
                self.transport.disconnect(handle).await;
                Err(e)
            }
        }
    }

    async fn verify_and_authenticate(
        &self,
        handle: &SessionHandle,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<(), SshError> {
        let raw = self.transport.host_key_info(handle.id()).await?;
        let key = parse_host_key_info(&raw)?;

        let result = self
            .verifier
            .verify(
                handle,
                endpoint,
                self.settings.host_key_policy,
                &key,
                self.challenge_handler.as_ref(),
            )
            .await?;

        if !result.trusted {
            let reason = match result.check {
                HostKeyCheck::Changed => "host key changed and was not accepted",
                HostKeyCheck::Unknown => "unknown host key was not accepted",
                HostKeyCheck::Match => "host key not trusted",
            };
            return Err(SshError::HostKeyRejected {
                host: endpoint.hostname.clone(),
                port: endpoint.port,
                reason: reason.to_string(),
            });
        }

        self.authenticate(handle, endpoint, credentials).await
    }

    /// Get a usable connection for `endpoint`.
    ///
    /// With `prefer_dedicated` a fresh connection is tried first and a parked
    /// shared handle is the fallback; the original error is returned if there
    /// is none. Otherwise the shared handle is tried first and a fresh
    /// connection is the fallback.
    pub async fn acquire(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        prefer_dedicated: bool,
    ) -> Result<Acquired, SshError> {
        if prefer_dedicated {
            return match self.connect_fresh(endpoint, credentials).await {
                Ok(handle) => Ok(Acquired::dedicated(handle)),
                Err(e) => match self.adopt_shared(endpoint) {
                    Some(acquired) => {
                        tracing::debug!(
                            "Dedicated connection to {} failed ({}), using shared connection",
                            endpoint,
                            e
                        );
                        Ok(acquired)
                    }
                    None => Err(e),
                },
            };
        }

        if let Some(acquired) = self.adopt_shared(endpoint) {
            return Ok(acquired);
        }
        let handle = self.connect_fresh(endpoint, credentials).await?;
        Ok(Acquired::dedicated(handle))
    }

    fn adopt_shared(&self, endpoint: &Endpoint) -> Option<Acquired> {
        let (id, handle) = self.registry.take_shared_handle_matching(endpoint)?;
        security_log::log_handle_transfer(endpoint, true);
        self.registry.touch(id);
        Some(Acquired {
            handle,
            shared: true,
            source: Some(id),
        })
    }

    /// Close a handle this caller owns.
    pub async fn release(&self, handle: SessionHandle) {
        tracing::debug!("Closing connection {}", handle.id());
        self.transport.disconnect(handle).await;
    }

    /// Give a live handle to the registry for another consumer to adopt.
    pub async fn park(&self, id: SessionId, handle: SessionHandle) {
        if let Some(info) = self.registry.session(id) {
            security_log::log_handle_transfer(&info.endpoint, false);
        }
        if let Some(displaced) = self.registry.put_shared_handle(id, handle) {
            tracing::debug!("Closing displaced connection {} for {}", displaced.id(), id);
            self.transport.disconnect(displaced).await;
        }
    }

    /// Close the handle parked under `id`. False if nothing was parked there.
    pub async fn close_shared(&self, id: SessionId) -> bool {
        match self.registry.take_shared_handle(id) {
            Some(handle) => {
                self.transport.disconnect(handle).await;
                self.registry.mark_connected(id, false);
                true
            }
            None => false,
        }
    }

    /// Run one command on an acquired connection, bounded by the connect timeout.
    pub async fn exec(&self, handle: HandleId, command: &str) -> Result<String, SshError> {
        within(
            self.settings.connect_timeout(),
            self.transport.exec(handle, command),
            || format!("running command on {handle}"),
        )
        .await
    }
}
