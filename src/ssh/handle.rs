//! Ownership token for a live transport connection.
//!
//! A [`SessionHandle`] is neither `Clone` nor `Copy`: whoever holds it owns the
//! connection, moving it transfers ownership, and closing it consumes it. I/O
//! goes through the [`HandleId`] borrowed from the owner.

use std::fmt;
use std::num::NonZeroU64;

/// Transport-level identifier of a connection. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(NonZeroU64);

impl HandleId {
    /// `None` for the transport's "no connection" sentinel (0).
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owned connection handle.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a SessionHandle leaks the connection; pass it to Transport::disconnect"]
pub struct SessionHandle {
    id: HandleId,
}

impl SessionHandle {
    /// Only transports mint handles, once per successful connect.
    pub fn from_id(id: HandleId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }
}
