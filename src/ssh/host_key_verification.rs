//! Host key verification types.
//!
//! A verification that needs a human goes through a [`ChallengeHandler`].
//! [`ChannelChallengeHandler`] is the usual one: it forwards each challenge to
//! a UI task over an mpsc channel and parks the verifying task on a oneshot
//! until the UI answers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

use crate::error::SshError;

/// Key type and fingerprint reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyInfo {
    pub key_type: String,
    pub fingerprint: String,
}

/// Split the transport's `"<key_type>|<fingerprint>"` string.
pub fn parse_host_key_info(raw: &str) -> Result<HostKeyInfo, SshError> {
    let malformed = || SshError::MalformedHostKeyInfo(raw.to_string());

    let (key_type, fingerprint) = raw.split_once('|').ok_or_else(malformed)?;
    let key_type = key_type.trim();
    let fingerprint = fingerprint.trim();
    if key_type.is_empty() || fingerprint.is_empty() {
        return Err(malformed());
    }

    Ok(HostKeyInfo {
        key_type: key_type.to_string(),
        fingerprint: fingerprint.to_string(),
    })
}

/// Outcome of comparing a reported key against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyCheck {
    /// Key matches the stored record
    Match,
    /// No record for this host
    Unknown,
    /// Key differs from the stored record (potential MITM)
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeReason {
    FirstUse,
    Changed,
}

/// Everything a human needs to make a trust decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyChallenge {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_type: String,
    pub fingerprint: String,
    pub reason: ChallengeReason,
    /// Stored fingerprint when `reason` is `Changed`
    pub previous_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// Abort the connection
    Reject,
    /// Trust for this connection only
    TrustOnce,
    /// Trust and write the key to known_hosts
    TrustAndSave,
}

/// Result of [`HostKeyVerifier::verify`](super::verifier::HostKeyVerifier::verify)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyResult {
    pub trusted: bool,
    pub check: HostKeyCheck,
    /// The key was written to the store
    pub saved: bool,
}

pub type DecisionFuture<'a> = Pin<Box<dyn Future<Output = TrustDecision> + Send + 'a>>;

/// Answers trust challenges. Awaited on the verifying task; one call, one decision.
pub trait ChallengeHandler: Send + Sync {
    fn decide(&self, challenge: VerifyChallenge) -> DecisionFuture<'_>;
}

/// Handler that gives the same answer every time (scripts, unattended reconnects)
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub TrustDecision);

impl ChallengeHandler for FixedDecision {
    fn decide(&self, _challenge: VerifyChallenge) -> DecisionFuture<'_> {
        let decision = self.0;
        Box::pin(async move { decision })
    }
}

/// A challenge waiting for an answer from the UI
pub struct PendingChallenge {
    pub challenge: VerifyChallenge,
    responder: oneshot::Sender<TrustDecision>,
}

impl PendingChallenge {
    /// Deliver the decision. Returns false if the verifier stopped waiting.
    pub fn respond(self, decision: TrustDecision) -> bool {
        self.responder.send(decision).is_ok()
    }
}

impl fmt::Debug for PendingChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingChallenge")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Forwards challenges to whoever holds the receiving end.
///
/// Dropping a [`PendingChallenge`] without responding, or dropping the
/// receiver, counts as [`TrustDecision::Reject`].
#[derive(Debug, Clone)]
pub struct ChannelChallengeHandler {
    tx: mpsc::Sender<PendingChallenge>,
}

impl ChannelChallengeHandler {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingChallenge>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

impl ChallengeHandler for ChannelChallengeHandler {
    fn decide(&self, challenge: VerifyChallenge) -> DecisionFuture<'_> {
        Box::pin(async move {
            let (responder, response) = oneshot::channel();
            let pending = PendingChallenge {
                challenge,
                responder,
            };

            if self.tx.send(pending).await.is_err() {
                tracing::warn!("No one is listening for host key challenges, rejecting");
                return TrustDecision::Reject;
            }

            match response.await {
                Ok(decision) => decision,
                Err(_) => {
                    tracing::warn!("Host key challenge dropped without an answer, rejecting");
                    TrustDecision::Reject
                }
            }
        })
    }
}
