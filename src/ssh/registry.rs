//! Table of logical sessions, their attached terminals, and parked handles.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use super::endpoint::{Credentials, Endpoint};
use super::handle::SessionHandle;
use super::terminal::TerminalSession;
use super::transport::Transport;

/// Caller-chosen identifier of a logical session (one per saved host/tab)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub display_name: String,
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    pub connected: bool,
    pub last_activity: DateTime<Utc>,
}

impl SessionInfo {
    pub fn new(
        id: SessionId,
        display_name: impl Into<String>,
        endpoint: Endpoint,
        credentials: Credentials,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            endpoint,
            credentials,
            connected: false,
            last_activity: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

struct SessionEntry<T: Transport> {
    info: SessionInfo,
    terminal: Option<Arc<TerminalSession<T>>>,
    order: u64,
}

/// Shared by everything that connects; construct once and pass around as `Arc`.
///
/// Entries and shared slots live in sharded maps, so operations on different
/// sessions never contend on one lock. Callbacks are never invoked while a
/// shard lock is held.
///
/// An attached terminal holds the registry through its connector, so a
/// session's entry and its terminal keep each other alive. Call
/// [`remove_session`](Self::remove_session) when a session is closed for good.
pub struct SessionRegistry<T: Transport> {
    sessions: DashMap<SessionId, SessionEntry<T>>,
    shared: DashMap<SessionId, SessionHandle>,
    next_order: AtomicU64,
    revision: watch::Sender<u64>,
}

impl<T: Transport> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> SessionRegistry<T> {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            sessions: DashMap::new(),
            shared: DashMap::new(),
            next_order: AtomicU64::new(0),
            revision,
        }
    }

    /// Create or replace the entry for `info.id`.
    ///
    /// The info is taken as-is. A given terminal replaces the attached one;
    /// `None` keeps whatever is attached.
    pub fn upsert_session(&self, info: SessionInfo, terminal: Option<Arc<TerminalSession<T>>>) {
        match self.sessions.entry(info.id) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.info = info;
                if terminal.is_some() {
                    entry.terminal = terminal;
                }
            }
            Entry::Vacant(vacant) => {
                let order = self.next_order.fetch_add(1, Ordering::Relaxed);
                vacant.insert(SessionEntry {
                    info,
                    terminal,
                    order,
                });
            }
        }
        self.notify();
    }

    pub fn session(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|entry| entry.info.clone())
    }

    /// The attached terminal, but only while it is connected.
    pub fn get_terminal_session(&self, id: SessionId) -> Option<Arc<TerminalSession<T>>> {
        let terminal = self.sessions.get(&id)?.terminal.clone()?;
        terminal.is_connected().then_some(terminal)
    }

    /// Most recently active connected session for this identity.
    pub fn find_connected_session(&self, host: &str, port: u16, username: &str) -> Option<SessionInfo> {
        self.sessions
            .iter()
            .filter(|entry| entry.info.connected && entry.info.endpoint.matches(host, port, username))
            .max_by_key(|entry| (entry.info.last_activity, entry.order))
            .map(|entry| entry.info.clone())
    }

    /// Update the connected flag and activity time. False if the id is unknown.
    pub fn mark_connected(&self, id: SessionId, connected: bool) -> bool {
        let updated = match self.sessions.get_mut(&id) {
            Some(mut entry) => {
                entry.info.connected = connected;
                entry.info.touch();
                true
            }
            None => false,
        };
        if updated {
            self.notify();
        }
        updated
    }

    pub fn touch(&self, id: SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.info.touch();
        }
    }

    /// Park a live handle. The registry owns it until someone takes it.
    ///
    /// A handle already parked under `id` is displaced and returned; the
    /// caller must close it.
    #[must_use = "a displaced handle must be closed"]
    pub fn put_shared_handle(&self, id: SessionId, handle: SessionHandle) -> Option<SessionHandle> {
        tracing::debug!("Parking connection {} under {}", handle.id(), id);
        self.shared.insert(id, handle)
    }

    /// Atomically remove the parked handle. At most one caller gets it.
    pub fn take_shared_handle(&self, id: SessionId) -> Option<SessionHandle> {
        self.shared.remove(&id).map(|(_, handle)| handle)
    }

    /// Take a parked handle belonging to any session with this identity,
    /// most recently active first.
    pub fn take_shared_handle_matching(&self, endpoint: &Endpoint) -> Option<(SessionId, SessionHandle)> {
        let mut candidates: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .info
                    .endpoint
                    .matches(&endpoint.hostname, endpoint.port, &endpoint.username)
            })
            .map(|entry| (entry.info.last_activity, entry.order, entry.info.id))
            .collect();
        candidates.sort_unstable_by(|a, b| b.cmp(a));

        candidates
            .into_iter()
            .find_map(|(_, _, id)| self.take_shared_handle(id).map(|handle| (id, handle)))
    }

    pub fn has_shared_handle(&self, id: SessionId) -> bool {
        self.shared.contains_key(&id)
    }

    /// Evict a session and drop the attached terminal. Any parked handle is
    /// returned for the caller to close.
    #[must_use = "a returned handle must be closed"]
    pub fn remove_session(&self, id: SessionId) -> Option<SessionHandle> {
        let removed = self.sessions.remove(&id).is_some();
        let handle = self.take_shared_handle(id);
        if removed {
            self.notify();
        }
        handle
    }

    /// Snapshot in insertion order
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut entries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| (entry.order, entry.info.clone()))
            .collect();
        entries.sort_unstable_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, info)| info).collect()
    }

    /// Receiver whose value bumps on every change to the session table
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn notify(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}
