//! Interactive shell session with listener-based events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::SshError;

use super::connector::SessionConnector;
use super::endpoint::{Credentials, Endpoint};
use super::handle::{HandleId, SessionHandle};
use super::registry::{SessionId, SessionInfo};
use super::transport::{LocalForward, Transport};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Receives terminal events. Called on the session's tasks; must not block.
///
/// Callbacks run while the listener list is locked, so they must not add or
/// remove listeners on the same session.
pub trait TerminalListener: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_data_received(&self, _chunk: &[u8]) {}
    fn on_error(&self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Events forwarded by [`ChannelListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Connected,
    Data(Vec<u8>),
    Disconnected,
    Error(String),
}

/// Listener that forwards every event into an unbounded channel, in order
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<TerminalEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TerminalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: TerminalEvent) {
        // Receiver gone means nobody is watching any more
        let _ = self.tx.send(event);
    }
}

impl TerminalListener for ChannelListener {
    fn on_connected(&self) {
        self.forward(TerminalEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.forward(TerminalEvent::Disconnected);
    }

    fn on_data_received(&self, chunk: &[u8]) {
        self.forward(TerminalEvent::Data(chunk.to_vec()));
    }

    fn on_error(&self, message: &str) {
        self.forward(TerminalEvent::Error(message.to_string()));
    }
}

struct Reader {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Link {
    handle: Option<SessionHandle>,
    reader: Option<Reader>,
}

/// One interactive shell on one connection.
///
/// The session owns its handle from a successful connect until
/// [`disconnect`](Self::disconnect) or [`hand_off`](Self::hand_off). Output
/// is read on a dedicated task and delivered to listeners in transport order.
///
/// Registering with a [`SessionRegistry`](super::SessionRegistry) makes the
/// registry and the session hold each other through the connector; the pair
/// is only freed once the session is evicted with `remove_session`.
pub struct TerminalSession<T: Transport> {
    id: SessionId,
    display_name: String,
    connector: Arc<SessionConnector<T>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn TerminalListener>)>>,
    next_listener: AtomicU64,
    link: Mutex<Link>,
    connected: AtomicBool,
    /// Bumped under the link lock on every teardown so an in-flight connect
    /// knows it was cancelled
    epoch: AtomicU64,
    /// Serializes connected-flag flips with their registry update and event
    transition: Mutex<()>,
    size: Mutex<(u16, u16)>,
}

impl<T: Transport> TerminalSession<T> {
    pub fn new(
        id: SessionId,
        display_name: impl Into<String>,
        connector: Arc<SessionConnector<T>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            display_name: display_name.into(),
            connector,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            link: Mutex::new(Link::default()),
            connected: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            transition: Mutex::new(()),
            size: Mutex::new((DEFAULT_COLS, DEFAULT_ROWS)),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn handle_id(&self) -> Option<HandleId> {
        self.link.lock().handle.as_ref().map(SessionHandle::id)
    }

    pub fn add_listener(&self, listener: Arc<dyn TerminalListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Waits for an in-progress dispatch; the listener sees no event after
    /// this returns.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Connect in the background, preferring a dedicated connection.
    ///
    /// Emits `on_connected` once the shell is open, or `on_error` and stays
    /// disconnected. The returned task can be awaited or dropped.
    pub fn connect(self: &Arc<Self>, endpoint: Endpoint, credentials: Credentials) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if this.is_connected() {
                tracing::warn!("{} is already connected, ignoring connect", this.id);
                return;
            }

            let epoch = this.epoch.load(Ordering::SeqCst);
            this.register(&endpoint, &credentials);

            let acquired = match this
                .connector
                .acquire(&endpoint, &credentials, true)
                .await
            {
                Ok(acquired) => acquired,
                Err(e) => {
                    tracing::debug!("{} failed to connect to {}: {}", this.id, endpoint, e);
                    this.fail(&format!("Error: {e}"));
                    return;
                }
            };

            if let Err(e) = this.start(acquired.handle, epoch).await {
                this.fail(&format!("Error: {e}"));
            }
        })
    }

    /// Open a shell on a handle that is already verified and authenticated,
    /// such as one taken from the registry's shared slot.
    pub async fn attach_existing(
        self: &Arc<Self>,
        handle: SessionHandle,
        endpoint: Endpoint,
        credentials: Credentials,
    ) -> Result<(), SshError> {
        if self.is_connected() {
            self.connector.release(handle).await;
            return Err(SshError::Channel(format!("{} is already connected", self.id)));
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        self.register(&endpoint, &credentials);
        let result = self.start(handle, epoch).await;
        if let Err(e) = &result {
            self.fail(&format!("Error: {e}"));
        }
        result
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        let handle = match self.handle_id() {
            Some(handle) if self.is_connected() => handle,
            _ => return Err(SshError::NotConnected),
        };
        self.connector.transport().write(handle, data).await?;
        self.connector.registry().touch(self.id);
        Ok(())
    }

    /// Remembered for the next shell; forwarded only while connected.
    pub async fn resize(&self, cols: u16, rows: u16) {
        *self.size.lock() = (cols, rows);

        let Some(handle) = self.handle_id().filter(|_| self.is_connected()) else {
            return;
        };
        if let Err(e) = self.connector.transport().resize(handle, cols, rows).await {
            tracing::debug!("Resize on {} failed: {}", handle, e);
        }
    }

    /// Tunnel `forward.local_port` on 127.0.0.1 to the target through this
    /// session's connection. Returns the bound local port; repeating a
    /// forward that is already running returns its port.
    pub async fn start_local_forwarding(&self, forward: LocalForward) -> Result<u16, SshError> {
        let handle = match self.handle_id() {
            Some(handle) if self.is_connected() => handle,
            _ => return Err(SshError::NotConnected),
        };
        let port = self
            .connector
            .transport()
            .forward_local(handle, &forward)
            .await?;
        tracing::info!("{} forwarding {} (bound {})", self.id, forward, port);
        Ok(port)
    }

    /// Close every forward on this session's connection. Disconnecting does
    /// this as well.
    pub async fn stop_forwards(&self) -> usize {
        match self.handle_id() {
            Some(handle) => self.connector.transport().stop_forwards(handle).await,
            None => 0,
        }
    }

    /// Stop reading, close the connection and emit `on_disconnected` once.
    /// Safe to call any number of times.
    pub async fn disconnect(&self) {
        self.teardown(None, true).await;
    }

    /// Stop reading and park the live connection in the registry instead of
    /// closing it. Returns false if there was nothing to hand off.
    pub async fn hand_off(&self) -> bool {
        let (handle, reader) = {
            let mut link = self.link.lock();
            let Some(handle) = link.handle.take() else {
                return false;
            };
            self.epoch.fetch_add(1, Ordering::SeqCst);
            (handle, link.reader.take())
        };

        if let Some(reader) = reader {
            let _ = reader.stop.send(());
            let _ = reader.task.await;
        }

        // Forwards belong to this terminal, not to whoever adopts the connection
        let stopped = self.connector.transport().stop_forwards(handle.id()).await;
        if stopped > 0 {
            tracing::debug!("{} stopped {} forwards before hand-off", self.id, stopped);
        }
        self.connector.park(self.id, handle).await;

        let _transition = self.transition.lock();
        self.connector.registry().mark_connected(self.id, true);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(|listener| listener.on_disconnected());
        }
        true
    }

    fn register(self: &Arc<Self>, endpoint: &Endpoint, credentials: &Credentials) {
        let info = SessionInfo::new(
            self.id,
            self.display_name.clone(),
            endpoint.clone(),
            credentials.clone(),
        );
        self.connector
            .registry()
            .upsert_session(info, Some(Arc::clone(self)));
    }

    fn fail(&self, message: &str) {
        self.connector.registry().mark_connected(self.id, false);
        self.emit(|listener| listener.on_error(message));
    }

    /// Open the shell and take ownership of `handle`. If a teardown happened
    /// since `epoch` was read, the handle is closed and nothing is emitted.
    async fn start(self: &Arc<Self>, handle: SessionHandle, epoch: u64) -> Result<(), SshError> {
        let handle_id = handle.id();
        let (cols, rows) = *self.size.lock();

        if let Err(e) = self
            .connector
            .transport()
            .open_shell(handle_id, cols, rows)
            .await
        {
            self.connector.release(handle).await;
            return Err(e);
        }

        let stale = {
            let _transition = self.transition.lock();
            let stale = {
                let mut link = self.link.lock();
                if self.epoch.load(Ordering::SeqCst) != epoch || link.handle.is_some() {
                    Some(handle)
                } else {
                    link.handle = Some(handle);
                    self.connected.store(true, Ordering::SeqCst);
                    None
                }
            };
            if stale.is_none() {
                self.connector.registry().mark_connected(self.id, true);
                self.emit(|listener| listener.on_connected());

                let (stop, stop_rx) = oneshot::channel();
                let mut link = self.link.lock();
                if link.handle.as_ref().map(SessionHandle::id) == Some(handle_id) {
                    let task = tokio::spawn(Arc::clone(self).read_loop(handle_id, stop_rx));
                    link.reader = Some(Reader { stop, task });
                }
            }
            stale
        };

        if let Some(handle) = stale {
            tracing::debug!("{} was torn down while connecting, closing {}", self.id, handle_id);
            self.connector.release(handle).await;
        }
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, handle: HandleId, mut stop: oneshot::Receiver<()>) {
        let transport = Arc::clone(self.connector.transport());

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => return,
                chunk = transport.read(handle) => match chunk {
                    Ok(Some(data)) if data.is_empty() => continue,
                    Ok(Some(data)) => self.emit(|listener| listener.on_data_received(&data)),
                    Ok(None) => {
                        tracing::debug!("Remote closed the shell on {}", handle);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Read on {} failed: {}", handle, e);
                        self.emit(|listener| listener.on_error(&format!("Read error: {e}")));
                        break;
                    }
                },
            }
        }

        self.teardown(Some(handle), false).await;
    }

    /// `expected` limits the teardown to that connection; `join_reader` is
    /// false when called from the reader itself.
    async fn teardown(&self, expected: Option<HandleId>, join_reader: bool) {
        let (handle, reader) = {
            let mut link = self.link.lock();
            let current = link.handle.as_ref().map(SessionHandle::id);
            if expected.is_some() && current != expected {
                return;
            }
            self.epoch.fetch_add(1, Ordering::SeqCst);
            (link.handle.take(), link.reader.take())
        };

        if let Some(reader) = reader {
            let _ = reader.stop.send(());
            if join_reader {
                let _ = reader.task.await;
            }
        }
        if let Some(handle) = handle {
            self.connector.release(handle).await;
        }

        let _transition = self.transition.lock();
        if self.connected.swap(false, Ordering::SeqCst) {
            self.connector.registry().mark_connected(self.id, false);
            self.emit(|listener| listener.on_disconnected());
        }
    }

    /// Dispatch under the read lock so removal waits for us.
    fn emit(&self, event: impl Fn(&dyn TerminalListener)) {
        for (_, listener) in self.listeners.read().iter() {
            event(listener.as_ref());
        }
    }
}
