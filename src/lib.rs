//! OrcTerm SSH session core
//!
//! Establishes, verifies, reuses and hands off SSH connections for the
//! client's screens. Exposed as a library for the binary and integration tests.

pub mod config;
pub mod error;
pub mod logging;
pub mod ssh;

pub(crate) mod security_log;
