//! Audit events for authentication, host key trust and connection hand-offs.
//!
//! Everything here is emitted with `target: "security"`:
//! ```bash
//! RUST_LOG=security=info orcterm-connect admin@example.com
//! ```

use tracing::{info, warn};

use crate::error::SshError;
use crate::ssh::endpoint::Endpoint;
use crate::ssh::host_key_verification::HostKeyCheck;

pub fn log_auth_attempt(endpoint: &Endpoint, method: &str) {
    info!(
        target: "security",
        event = "auth_attempt",
        endpoint = %endpoint,
        method,
        "SSH authentication attempt"
    );
}

/// Record the outcome of one authentication attempt.
pub fn log_auth_result(endpoint: &Endpoint, method: &str, result: &Result<(), SshError>) {
    match result {
        Ok(()) => info!(
            target: "security",
            event = "auth_success",
            endpoint = %endpoint,
            method,
            "SSH authentication succeeded"
        ),
        Err(e) => warn!(
            target: "security",
            event = "auth_failure",
            endpoint = %endpoint,
            method,
            error = %e,
            "SSH authentication failed"
        ),
    }
}

/// A key that was not already on record is now trusted.
pub fn log_host_key_trusted(endpoint: &Endpoint, fingerprint: &str, check: HostKeyCheck, saved: bool) {
    if check == HostKeyCheck::Changed {
        warn!(
            target: "security",
            event = "host_key_change_accepted",
            host = %endpoint.hostname,
            port = endpoint.port,
            fingerprint,
            saved,
            "Changed host key accepted"
        );
    } else {
        info!(
            target: "security",
            event = "host_key_accepted",
            host = %endpoint.hostname,
            port = endpoint.port,
            fingerprint,
            saved,
            "Host key accepted"
        );
    }
}

pub fn log_host_key_rejected(endpoint: &Endpoint, check: HostKeyCheck, why: &str) {
    warn!(
        target: "security",
        event = "host_key_rejected",
        host = %endpoint.hostname,
        port = endpoint.port,
        check = ?check,
        why,
        "Host key rejected"
    );
}

/// A live connection left one consumer: parked in the registry, or adopted from it.
pub fn log_handle_transfer(endpoint: &Endpoint, adopted: bool) {
    let event = if adopted { "handle_adopted" } else { "handle_parked" };
    info!(
        target: "security",
        event,
        endpoint = %endpoint,
        "SSH connection ownership transferred"
    );
}
