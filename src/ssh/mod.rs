//! SSH session core
//!
//! Connection acquisition and reuse, host key trust, and interactive shell
//! sessions on top of a pluggable [`Transport`].

pub mod auth;
pub mod client;
pub mod connector;
pub mod endpoint;
pub mod forward;
pub mod handle;
pub mod handler;
pub mod host_key_verification;
pub mod known_hosts;
pub mod registry;
pub mod terminal;
pub mod transport;
pub mod verifier;

pub use client::RusshTransport;
pub use connector::{Acquired, SessionConnector};
pub use endpoint::{Credentials, Endpoint};
pub use handle::{HandleId, SessionHandle};
pub use host_key_verification::{
    ChallengeHandler, ChallengeReason, ChannelChallengeHandler, FixedDecision, HostKeyCheck,
    HostKeyInfo, PendingChallenge, TrustDecision, VerifyChallenge, VerifyResult,
    parse_host_key_info,
};
pub use known_hosts::{HostKeyRecord, HostKeyStore};
pub use registry::{SessionId, SessionInfo, SessionRegistry};
pub use terminal::{ChannelListener, ListenerId, TerminalEvent, TerminalListener, TerminalSession};
pub use transport::{LocalForward, Transport, TransportTimeouts};
pub use verifier::HostKeyVerifier;
