//! Trust-on-first-use host key verification.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::HostKeyPolicy;
use crate::error::SshError;
use crate::security_log;

use super::endpoint::Endpoint;
use super::handle::SessionHandle;
use super::host_key_verification::{
    ChallengeHandler, ChallengeReason, HostKeyCheck, HostKeyInfo, TrustDecision, VerifyChallenge,
    VerifyResult,
};
use super::known_hosts::{HostKeyRecord, HostKeyStore};

/// Decides whether the key a server presented may be trusted.
///
/// The store is only locked for the lookup and the save, never while a
/// challenge is waiting on a human.
pub struct HostKeyVerifier {
    store: Arc<Mutex<HostKeyStore>>,
    decision_timeout: Option<Duration>,
}

impl HostKeyVerifier {
    pub fn new(store: HostKeyStore) -> Self {
        Self::with_shared_store(Arc::new(Mutex::new(store)))
    }

    pub fn with_shared_store(store: Arc<Mutex<HostKeyStore>>) -> Self {
        Self {
            store,
            decision_timeout: None,
        }
    }

    /// Unanswered challenges resolve to Reject after `timeout`.
    pub fn with_decision_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.decision_timeout = timeout;
        self
    }

    pub fn store(&self) -> Arc<Mutex<HostKeyStore>> {
        self.store.clone()
    }

    /// Run the trust state machine for the key reported on `handle`.
    ///
    /// Errors only when the store cannot be read or a `TrustAndSave` cannot be
    /// written. An untrusted key is `Ok` with `trusted == false`; closing the
    /// connection is the caller's job.
    pub async fn verify(
        &self,
        handle: &SessionHandle,
        endpoint: &Endpoint,
        policy: HostKeyPolicy,
        key: &HostKeyInfo,
        handler: &dyn ChallengeHandler,
    ) -> Result<VerifyResult, SshError> {
        let host = endpoint.hostname.as_str();
        let port = endpoint.port;

        let stored = self.lookup(host, port).await?;
        let (check, previous) = match stored {
            Some(record) if record.matches_key(&key.key_type, &key.fingerprint) => {
                tracing::debug!("Host key for {}:{} matches known_hosts", host, port);
                return Ok(VerifyResult {
                    trusted: true,
                    check: HostKeyCheck::Match,
                    saved: false,
                });
            }
            Some(record) => {
                tracing::warn!(
                    "Host key for {}:{} changed on connection {} (was {}, now {})",
                    host,
                    port,
                    handle.id(),
                    record.fingerprint,
                    key.fingerprint
                );
                (HostKeyCheck::Changed, Some(record.fingerprint))
            }
            None => (HostKeyCheck::Unknown, None),
        };

        if check == HostKeyCheck::Unknown {
            match policy {
                HostKeyPolicy::Strict => {
                    security_log::log_host_key_rejected(endpoint, check, "strict policy");
                    return Ok(VerifyResult {
                        trusted: false,
                        check,
                        saved: false,
                    });
                }
                HostKeyPolicy::AcceptOnce => {
                    security_log::log_host_key_trusted(endpoint, &key.fingerprint, check, false);
                    return Ok(VerifyResult {
                        trusted: true,
                        check,
                        saved: false,
                    });
                }
                HostKeyPolicy::AskUser => {}
            }
        }

        let reason = match check {
            HostKeyCheck::Changed => ChallengeReason::Changed,
            _ => ChallengeReason::FirstUse,
        };
        let challenge = VerifyChallenge {
            host: host.to_string(),
            port,
            username: endpoint.username.clone(),
            key_type: key.key_type.clone(),
            fingerprint: key.fingerprint.clone(),
            reason,
            previous_fingerprint: previous,
        };

        match self.ask(handler, challenge).await {
            TrustDecision::TrustAndSave => {
                let record = HostKeyRecord::new(host, port, &key.key_type, &key.fingerprint);
                self.save(record).await?;
                security_log::log_host_key_trusted(endpoint, &key.fingerprint, check, true);
                Ok(VerifyResult {
                    trusted: true,
                    check,
                    saved: true,
                })
            }
            TrustDecision::TrustOnce => {
                security_log::log_host_key_trusted(endpoint, &key.fingerprint, check, false);
                Ok(VerifyResult {
                    trusted: true,
                    check,
                    saved: false,
                })
            }
            TrustDecision::Reject => {
                security_log::log_host_key_rejected(endpoint, check, "declined");
                Ok(VerifyResult {
                    trusted: false,
                    check,
                    saved: false,
                })
            }
        }
    }

    async fn ask(&self, handler: &dyn ChallengeHandler, challenge: VerifyChallenge) -> TrustDecision {
        match self.decision_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, handler.decide(challenge)).await {
                Ok(decision) => decision,
                Err(_) => {
                    tracing::warn!("Host key challenge not answered within {:?}, rejecting", timeout);
                    TrustDecision::Reject
                }
            },
            None => handler.decide(challenge).await,
        }
    }

    async fn lookup(&self, host: &str, port: u16) -> Result<Option<HostKeyRecord>, SshError> {
        let store = self.store.clone();
        let host = host.to_string();
        tokio::task::spawn_blocking(move || {
            let store = store.blocking_lock();
            store.lookup(&host, port)
        })
        .await
        .map_err(|e| SshError::KnownHosts(format!("known_hosts lookup task failed: {e}")))?
    }

    async fn save(&self, record: HostKeyRecord) -> Result<(), SshError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let store = store.blocking_lock();
            store.save(&record)
        })
        .await
        .map_err(|e| SshError::KnownHosts(format!("known_hosts save task failed: {e}")))?
    }
}
