use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{self, Config};
use russh::{Channel, ChannelMsg, Disconnect};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::SshError;

use super::auth::load_private_key;
use super::forward::{self, ActiveForward, SharedHandle};
use super::handle::{HandleId, SessionHandle};
use super::handler::{CapturedKey, ClientHandler, key_info_string};
use super::transport::{LocalForward, Transport, TransportTimeouts, within};

/// Commands that can be sent to the shell channel task
enum ChannelCommand {
    Data(Vec<u8>),
    WindowChange { cols: u32, rows: u32 },
}

struct Shell {
    command_tx: mpsc::Sender<ChannelCommand>,
    output_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

struct Connection {
    host: String,
    port: u16,
    handle: SharedHandle,
    server_key: CapturedKey,
    timeouts: Mutex<TransportTimeouts>,
    shell: Mutex<Option<Arc<Shell>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    forwards: Mutex<HashMap<LocalForward, ActiveForward>>,
}

impl Connection {
    fn session_timeout(&self) -> Option<Duration> {
        self.timeouts.lock().session_timeout
    }

    fn stop_forwards(&self) -> usize {
        let stopped: Vec<_> = self.forwards.lock().drain().collect();
        let count = stopped.len();
        for (spec, active) in stopped {
            tracing::debug!("Stopping forward {} on {}:{}", spec, self.host, self.port);
            active.stop();
        }
        count
    }
}

/// [`Transport`] backed by russh
///
/// Keepalive, read and channel-open timeouts are per connection and come
/// from [`Transport::configure`].
pub struct RusshTransport {
    config: Arc<Config>,
    next_id: AtomicU64,
    connections: Mutex<HashMap<HandleId, Arc<Connection>>>,
}

impl RusshTransport {
    pub fn new() -> Self {
        let config = Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: None,
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn connection(&self, id: HandleId) -> Result<Arc<Connection>, SshError> {
        self.connections
            .lock()
            .get(&id)
            .cloned()
            .ok_or(SshError::HandleUnavailable)
    }

    fn shell(&self, id: HandleId) -> Result<Arc<Shell>, SshError> {
        self.connection(id)?
            .shell
            .lock()
            .clone()
            .ok_or_else(|| SshError::Channel("no shell open on this connection".to_string()))
    }

    fn mint(&self) -> Result<HandleId, SshError> {
        HandleId::new(self.next_id.fetch_add(1, Ordering::Relaxed)).ok_or(SshError::HandleUnavailable)
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RusshTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<SessionHandle, SshError> {
        let connect_failed = |reason: String| SshError::Connect {
            host: host.to_string(),
            port,
            reason,
        };

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| connect_failed(e.to_string()))?;

        let server_key: CapturedKey = Arc::new(Mutex::new(None));
        let handler = ClientHandler::new(host.to_string(), port, server_key.clone());
        let handle = client::connect_stream(self.config.clone(), stream, handler)
            .await
            .map_err(|e| connect_failed(e.to_string()))?;

        let id = self.mint()?;
        let connection = Connection {
            host: host.to_string(),
            port,
            handle: Arc::new(tokio::sync::Mutex::new(handle)),
            server_key,
            timeouts: Mutex::new(TransportTimeouts::default()),
            shell: Mutex::new(None),
            keepalive: Mutex::new(None),
            forwards: Mutex::new(HashMap::new()),
        };
        self.connections.lock().insert(id, Arc::new(connection));

        tracing::debug!("Handshake with {}:{} complete ({})", host, port, id);
        Ok(SessionHandle::from_id(id))
    }

    async fn configure(&self, handle: HandleId, timeouts: TransportTimeouts) -> Result<(), SshError> {
        let connection = self.connection(handle)?;
        *connection.timeouts.lock() = timeouts;

        let keepalive = timeouts.keepalive_interval.map(|interval| {
            spawn_keepalive(
                connection.handle.clone(),
                interval,
                timeouts.keepalive_reply,
                format!("{}:{}", connection.host, connection.port),
            )
        });
        if let Some(previous) = std::mem::replace(&mut *connection.keepalive.lock(), keepalive) {
            previous.abort();
        }
        Ok(())
    }

    async fn host_key_info(&self, handle: HandleId) -> Result<String, SshError> {
        let connection = self.connection(handle)?;
        let key = connection.server_key.lock().clone();
        key.map(|key| key_info_string(&key))
            .ok_or_else(|| SshError::MalformedHostKeyInfo(String::new()))
    }

    async fn auth_password(
        &self,
        handle: HandleId,
        username: &str,
        password: &SecretString,
    ) -> Result<(), SshError> {
        let connection = self.connection(handle)?;
        let mut session = connection.handle.lock().await;
        let result = session
            .authenticate_password(username, password.expose_secret())
            .await
            .map_err(|e| SshError::Auth(e.to_string()))?;

        if !result.success() {
            return Err(SshError::Auth("Authentication rejected by server".to_string()));
        }
        Ok(())
    }

    async fn auth_key(
        &self,
        handle: HandleId,
        username: &str,
        key_path: &Path,
        passphrase: Option<&SecretString>,
    ) -> Result<(), SshError> {
        let connection = self.connection(handle)?;
        let key = load_private_key(key_path, passphrase)?;

        let mut session = connection.handle.lock().await;
        let result = session
            .authenticate_publickey(username, key)
            .await
            .map_err(|e| SshError::Auth(e.to_string()))?;

        if !result.success() {
            return Err(SshError::Auth("Public key rejected by server".to_string()));
        }
        Ok(())
    }

    async fn exec(&self, handle: HandleId, command: &str) -> Result<String, SshError> {
        let connection = self.connection(handle)?;
        let mut channel = open_session_channel(&connection).await?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::Channel(format!("Failed to exec '{}': {}", command, e)))?;

        let mut output = String::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    output.push_str(&String::from_utf8_lossy(&data));
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    tracing::debug!("{} stderr: {:?}", command, String::from_utf8_lossy(&data));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    if exit_status != 0 {
                        tracing::debug!("{} exited with status {}", command, exit_status);
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        Ok(output)
    }

    async fn open_shell(&self, handle: HandleId, cols: u16, rows: u16) -> Result<(), SshError> {
        let connection = self.connection(handle)?;
        let channel = open_session_channel(&connection).await?;

        channel
            .request_pty(
                false,
                "xterm-256color",
                cols as u32,
                rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| SshError::Channel(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::Channel(format!("Shell request failed: {}", e)))?;

        let shell = spawn_shell_task(channel, connection.host.clone(), connection.port);
        // Replacing the previous shell drops its command sender, which ends its task
        *connection.shell.lock() = Some(Arc::new(shell));
        Ok(())
    }

    async fn write(&self, handle: HandleId, data: &[u8]) -> Result<(), SshError> {
        let shell = self.shell(handle)?;
        shell
            .command_tx
            .send(ChannelCommand::Data(data.to_vec()))
            .await
            .map_err(|e| {
                tracing::debug!("SSH send failed: {}", e);
                SshError::Channel(e.to_string())
            })
    }

    async fn read(&self, handle: HandleId) -> Result<Option<Vec<u8>>, SshError> {
        let read_timeout = self.connection(handle)?.timeouts.lock().read_timeout;
        let shell = self.shell(handle)?;
        let mut output = shell.output_rx.lock().await;

        match read_timeout {
            Some(limit) => match timeout(limit, output.recv()).await {
                Ok(chunk) => Ok(chunk),
                Err(_) => Ok(Some(Vec::new())),
            },
            None => Ok(output.recv().await),
        }
    }

    async fn resize(&self, handle: HandleId, cols: u16, rows: u16) -> Result<(), SshError> {
        let shell = self.shell(handle)?;
        shell
            .command_tx
            .send(ChannelCommand::WindowChange {
                cols: cols as u32,
                rows: rows as u32,
            })
            .await
            .map_err(|e| SshError::Channel(e.to_string()))
    }

    async fn forward_local(&self, handle: HandleId, forward: &LocalForward) -> Result<u16, SshError> {
        let connection = self.connection(handle)?;
        if let Some(active) = connection.forwards.lock().get(forward) {
            return Ok(active.bound_port);
        }

        let (listener, bound_port) = forward::bind(forward).await?;
        let mut forwards = connection.forwards.lock();
        if let Some(active) = forwards.get(forward) {
            // Lost a race with an identical request
            return Ok(active.bound_port);
        }
        let active = forward::spawn(
            listener,
            bound_port,
            connection.handle.clone(),
            forward.clone(),
            connection.session_timeout(),
        );
        forwards.insert(forward.clone(), active);
        Ok(bound_port)
    }

    async fn stop_forwards(&self, handle: HandleId) -> usize {
        match self.connection(handle) {
            Ok(connection) => connection.stop_forwards(),
            Err(_) => 0,
        }
    }

    async fn disconnect(&self, handle: SessionHandle) {
        let Some(connection) = self.connections.lock().remove(&handle.id()) else {
            tracing::debug!("Connection {} already closed", handle.id());
            return;
        };
        connection.stop_forwards();
        if let Some(keepalive) = connection.keepalive.lock().take() {
            keepalive.abort();
        }
        connection.shell.lock().take();

        let session = connection.handle.lock().await;
        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(
                "Disconnect from {}:{} failed: {}",
                connection.host,
                connection.port,
                e
            );
        }
    }
}

async fn open_session_channel(connection: &Connection) -> Result<Channel<client::Msg>, SshError> {
    let open = async {
        let session = connection.handle.lock().await;
        session
            .channel_open_session()
            .await
            .map_err(|e| SshError::Channel(format!("Failed to open channel: {}", e)))
    };
    within(connection.session_timeout(), open, || {
        format!("opening a channel on {}:{}", connection.host, connection.port)
    })
    .await
}

/// Send a keepalive every `interval` until the connection goes away.
fn spawn_keepalive(
    session: SharedHandle,
    interval: Duration,
    want_reply: bool,
    peer: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let sent = {
                let session = session.lock().await;
                timeout(interval, session.send_keepalive(want_reply)).await
            };
            match sent {
                Ok(Ok(())) => tracing::trace!("Keepalive sent to {}", peer),
                Ok(Err(e)) => {
                    tracing::debug!("Keepalive to {} failed, stopping: {}", peer, e);
                    break;
                }
                Err(_) => tracing::warn!("Keepalive to {} timed out", peer),
            }
        }
    })
}

/// Spawn the task that owns the shell channel.
///
/// Output flows out through a bounded queue; the queue closing tells readers
/// the remote side is done.
fn spawn_shell_task(mut channel: Channel<client::Msg>, host: String, port: u16) -> Shell {
    let (command_tx, mut command_rx) = mpsc::channel::<ChannelCommand>(256);
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(256);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if output_tx.send(data.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, .. }) => {
                            if output_tx.send(data.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            tracing::debug!("Shell on {}:{} exited with {}", host, port, exit_status);
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    }
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                tracing::error!("Failed to send data: {}", e);
                            }
                        }
                        Some(ChannelCommand::WindowChange { cols, rows }) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                tracing::error!("Failed to send window change: {}", e);
                            }
                        }
                        None => {
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }
            }
        }
    });

    Shell {
        command_tx,
        output_rx: tokio::sync::Mutex::new(output_rx),
    }
}
