//! Common test utilities
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;
use tokio::sync::mpsc;

use orcterm_core::config::{HostKeyPolicy, SessionSettings};
use orcterm_core::error::SshError;
use orcterm_core::ssh::{
    ChallengeHandler, HandleId, HostKeyStore, HostKeyVerifier, SessionConnector, SessionHandle,
    LocalForward, SessionRegistry, Transport, TransportTimeouts,
};

pub const KEY_A: &str = "ssh-ed25519|SHA256:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
pub const KEY_B: &str = "ssh-ed25519|SHA256:BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
pub const PASSWORD: &str = "testpass123";

/// Test environment with isolated configuration directory
pub struct TestEnvironment {
    pub config_dir: TempDir,
    pub known_hosts_path: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let config_dir = TempDir::new().expect("Failed to create temp dir");
        let known_hosts_path = config_dir.path().join("known_hosts");
        Self {
            config_dir,
            known_hosts_path,
        }
    }

    pub fn store(&self) -> HostKeyStore {
        HostKeyStore::open(&self.known_hosts_path)
    }

    /// Connector over `transport` with a fresh registry and this environment's known_hosts
    pub fn connector(
        &self,
        transport: Arc<MockTransport>,
        handler: Arc<dyn ChallengeHandler>,
        policy: HostKeyPolicy,
    ) -> Arc<SessionConnector<MockTransport>> {
        let settings = SessionSettings {
            host_key_policy: policy,
            ..SessionSettings::default()
        };
        self.connector_with_settings(transport, handler, settings)
    }

    pub fn connector_with_settings(
        &self,
        transport: Arc<MockTransport>,
        handler: Arc<dyn ChallengeHandler>,
        settings: SessionSettings,
    ) -> Arc<SessionConnector<MockTransport>> {
        Arc::new(SessionConnector::new(
            transport,
            Arc::new(HostKeyVerifier::new(self.store())),
            Arc::new(SessionRegistry::new()),
            handler,
            settings,
        ))
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

/// Scripted behaviour of one fake server
#[derive(Debug, Clone)]
pub struct MockHost {
    pub key_info: String,
    pub password: String,
    pub accept_keys: bool,
    pub reachable: bool,
    pub connect_delay: Option<Duration>,
    pub fail_shell: bool,
}

impl Default for MockHost {
    fn default() -> Self {
        Self {
            key_info: KEY_A.to_string(),
            password: PASSWORD.to_string(),
            accept_keys: false,
            reachable: true,
            connect_delay: None,
            fail_shell: false,
        }
    }
}

struct MockConnection {
    host: (String, u16),
    authenticated: bool,
    shell_open: bool,
    size: Option<(u16, u16)>,
    written: Vec<u8>,
    output_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    output_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    forwards: Vec<(LocalForward, u16)>,
}

/// In-memory transport that records everything done to it
#[derive(Default)]
pub struct MockTransport {
    next_id: AtomicU64,
    hosts: Mutex<HashMap<(String, u16), MockHost>>,
    open: Mutex<HashMap<HandleId, MockConnection>>,
    connects: AtomicUsize,
    auth_calls: AtomicUsize,
    disconnected: Mutex<Vec<HandleId>>,
    next_port: AtomicU64,
    stopped_forwards: Mutex<Vec<LocalForward>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_host(host: &str, port: u16, mock: MockHost) -> Arc<Self> {
        let transport = Self::new();
        transport.set_host(host, port, mock);
        transport
    }

    pub fn set_host(&self, host: &str, port: u16, mock: MockHost) {
        self.hosts.lock().insert((host.to_string(), port), mock);
    }

    pub fn update_host(&self, host: &str, port: u16, update: impl FnOnce(&mut MockHost)) {
        if let Some(mock) = self.hosts.lock().get_mut(&(host.to_string(), port)) {
            update(mock);
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn auth_count(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> Vec<HandleId> {
        self.disconnected.lock().clone()
    }

    pub fn open_handles(&self) -> Vec<HandleId> {
        let mut ids: Vec<_> = self.open.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_open(&self, id: HandleId) -> bool {
        self.open.lock().contains_key(&id)
    }

    /// Queue shell output for `id`
    pub fn push_output(&self, id: HandleId, data: &[u8]) {
        if let Some(tx) = self.open.lock().get(&id).and_then(|c| c.output_tx.as_ref()) {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Simulate the remote side closing the shell
    pub fn close_remote(&self, id: HandleId) {
        if let Some(connection) = self.open.lock().get_mut(&id) {
            connection.output_tx = None;
        }
    }

    pub fn written(&self, id: HandleId) -> Vec<u8> {
        self.open
            .lock()
            .get(&id)
            .map(|c| c.written.clone())
            .unwrap_or_default()
    }

    pub fn size(&self, id: HandleId) -> Option<(u16, u16)> {
        self.open.lock().get(&id).and_then(|c| c.size)
    }

    pub fn forwards(&self, id: HandleId) -> Vec<LocalForward> {
        self.open
            .lock()
            .get(&id)
            .map(|c| c.forwards.iter().map(|(f, _)| f.clone()).collect())
            .unwrap_or_default()
    }

    /// Every forward torn down so far, by stop_forwards or disconnect
    pub fn stopped_forwards(&self) -> Vec<LocalForward> {
        self.stopped_forwards.lock().clone()
    }

    fn host_of(&self, id: HandleId) -> Result<MockHost, SshError> {
        let key = self
            .open
            .lock()
            .get(&id)
            .map(|c| c.host.clone())
            .ok_or(SshError::HandleUnavailable)?;
        self.hosts
            .lock()
            .get(&key)
            .cloned()
            .ok_or(SshError::HandleUnavailable)
    }

    fn with_connection<R>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut MockConnection) -> Result<R, SshError>,
    ) -> Result<R, SshError> {
        match self.open.lock().get_mut(&id) {
            Some(connection) => f(connection),
            None => Err(SshError::HandleUnavailable),
        }
    }
}

impl Transport for MockTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<SessionHandle, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mock = self.hosts.lock().get(&(host.to_string(), port)).cloned();
        let unreachable = || SshError::Connect {
            host: host.to_string(),
            port,
            reason: "connection refused".to_string(),
        };

        let mock = mock.ok_or_else(unreachable)?;
        if let Some(delay) = mock.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if !mock.reachable {
            return Err(unreachable());
        }

        let id = HandleId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
            .ok_or(SshError::HandleUnavailable)?;
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        self.open.lock().insert(
            id,
            MockConnection {
                host: (host.to_string(), port),
                authenticated: false,
                shell_open: false,
                size: None,
                written: Vec::new(),
                output_tx: Some(output_tx),
                output_rx: Arc::new(tokio::sync::Mutex::new(output_rx)),
                forwards: Vec::new(),
            },
        );
        Ok(SessionHandle::from_id(id))
    }

    async fn configure(&self, handle: HandleId, _timeouts: TransportTimeouts) -> Result<(), SshError> {
        self.with_connection(handle, |_| Ok(()))
    }

    async fn host_key_info(&self, handle: HandleId) -> Result<String, SshError> {
        Ok(self.host_of(handle)?.key_info)
    }

    async fn auth_password(
        &self,
        handle: HandleId,
        _username: &str,
        password: &SecretString,
    ) -> Result<(), SshError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        let mock = self.host_of(handle)?;
        if password.expose_secret() != mock.password {
            return Err(SshError::Auth("Authentication rejected by server".to_string()));
        }
        self.with_connection(handle, |c| {
            c.authenticated = true;
            Ok(())
        })
    }

    async fn auth_key(
        &self,
        handle: HandleId,
        _username: &str,
        _key_path: &Path,
        _passphrase: Option<&SecretString>,
    ) -> Result<(), SshError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        if !self.host_of(handle)?.accept_keys {
            return Err(SshError::Auth("Public key rejected by server".to_string()));
        }
        self.with_connection(handle, |c| {
            c.authenticated = true;
            Ok(())
        })
    }

    async fn exec(&self, handle: HandleId, command: &str) -> Result<String, SshError> {
        self.with_connection(handle, |c| {
            if !c.authenticated {
                return Err(SshError::Channel("not authenticated".to_string()));
            }
            Ok(format!("ran: {command}"))
        })
    }

    async fn open_shell(&self, handle: HandleId, cols: u16, rows: u16) -> Result<(), SshError> {
        if self.host_of(handle)?.fail_shell {
            return Err(SshError::Channel("Shell request failed".to_string()));
        }
        self.with_connection(handle, |c| {
            c.shell_open = true;
            c.size = Some((cols, rows));
            Ok(())
        })
    }

    async fn write(&self, handle: HandleId, data: &[u8]) -> Result<(), SshError> {
        self.with_connection(handle, |c| {
            if !c.shell_open {
                return Err(SshError::Channel("no shell open".to_string()));
            }
            c.written.extend_from_slice(data);
            Ok(())
        })
    }

    async fn read(&self, handle: HandleId) -> Result<Option<Vec<u8>>, SshError> {
        let output = self.with_connection(handle, |c| Ok(c.output_rx.clone()))?;
        let mut output = output.lock().await;
        Ok(output.recv().await)
    }

    async fn resize(&self, handle: HandleId, cols: u16, rows: u16) -> Result<(), SshError> {
        self.with_connection(handle, |c| {
            c.size = Some((cols, rows));
            Ok(())
        })
    }

    async fn forward_local(&self, handle: HandleId, forward: &LocalForward) -> Result<u16, SshError> {
        self.with_connection(handle, |c| {
            if !c.authenticated {
                return Err(SshError::Channel("not authenticated".to_string()));
            }
            if let Some((_, port)) = c.forwards.iter().find(|(f, _)| f == forward) {
                return Ok(*port);
            }
            let port = match forward.local_port {
                0 => 40000 + self.next_port.fetch_add(1, Ordering::SeqCst) as u16,
                port => port,
            };
            c.forwards.push((forward.clone(), port));
            Ok(port)
        })
    }

    async fn stop_forwards(&self, handle: HandleId) -> usize {
        let stopped = self
            .with_connection(handle, |c| Ok(std::mem::take(&mut c.forwards)))
            .unwrap_or_default();
        let count = stopped.len();
        self.stopped_forwards
            .lock()
            .extend(stopped.into_iter().map(|(f, _)| f));
        count
    }

    async fn disconnect(&self, handle: SessionHandle) {
        let removed = self.open.lock().remove(&handle.id());
        if let Some(connection) = removed {
            self.stopped_forwards
                .lock()
                .extend(connection.forwards.into_iter().map(|(f, _)| f));
        }
        self.disconnected.lock().push(handle.id());
    }
}
