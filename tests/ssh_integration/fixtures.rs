//! Docker-based SSH test fixtures

use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, timeout};

use orcterm_core::config::{HostKeyPolicy, SessionSettings};
use orcterm_core::ssh::{
    ChallengeHandler, Credentials, Endpoint, HostKeyStore, HostKeyVerifier, RusshTransport,
    SessionConnector, SessionRegistry,
};

// Ensure Docker containers are started only once per test run
static DOCKER_INIT: Once = Once::new();
static DOCKER_AVAILABLE: AtomicBool = AtomicBool::new(false);
// The server limits concurrent unauthenticated connections
static TEST_LOCK: Mutex<()> = Mutex::const_new(());

/// Serialize tests that talk to the shared server
pub async fn acquire_test_lock() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().await
}

/// Account on the container from tests/docker/docker-compose.yml
#[derive(Debug, Clone)]
pub struct TestSshServer {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for TestSshServer {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2222,
            username: "testuser".to_string(),
            password: "testpass123".to_string(),
        }
    }
}

/// `docker compose` if the plugin is installed, else the standalone binary
fn compose_command() -> Option<Command> {
    let succeeds = |cmd: &mut Command| cmd.output().is_ok_and(|out| out.status.success());

    if succeeds(Command::new("docker").args(["compose", "version"])) {
        let mut cmd = Command::new("docker");
        cmd.arg("compose");
        Some(cmd)
    } else if succeeds(Command::new("docker-compose").arg("--version")) {
        Some(Command::new("docker-compose"))
    } else {
        None
    }
}

/// Bring up the OpenSSH container once per test binary
pub fn ensure_docker_started() {
    DOCKER_INIT.call_once(|| {
        let Some(mut compose) = compose_command() else {
            eprintln!("WARNING: docker compose not available, SSH integration tests will be skipped");
            return;
        };

        let docker_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/docker");
        match compose.current_dir(&docker_dir).args(["up", "-d", "--wait"]).status() {
            Ok(status) if status.success() => {
                DOCKER_AVAILABLE.store(true, Ordering::SeqCst);
                eprintln!("SSH test server is up");
            }
            Ok(status) => eprintln!("SSH test server failed to start: {status}"),
            Err(e) => eprintln!("SSH test server failed to start: {e}"),
        }
    });
}

pub fn is_docker_available() -> bool {
    ensure_docker_started();
    DOCKER_AVAILABLE.load(Ordering::SeqCst)
}

/// Poll until the server accepts TCP connections
pub async fn wait_for_ssh_ready(host: &str, port: u16) -> Result<(), String> {
    const ATTEMPTS: u32 = 30;

    for _ in 0..ATTEMPTS {
        if let Ok(Ok(_)) = timeout(Duration::from_secs(2), TcpStream::connect((host, port))).await {
            return Ok(());
        }
        sleep(Duration::from_millis(200)).await;
    }
    Err(format!("SSH server at {host}:{port} not ready after {ATTEMPTS} attempts"))
}

/// Test environment with isolated known_hosts and Docker fixtures
pub struct SshTestEnvironment {
    pub server: TestSshServer,
    pub config_dir: TempDir,
    pub known_hosts_path: PathBuf,
}

impl SshTestEnvironment {
    pub async fn new() -> Result<Self, String> {
        if !is_docker_available() {
            return Err("Docker not available".to_string());
        }

        let server = TestSshServer::default();
        wait_for_ssh_ready(&server.host, server.port).await?;

        let config_dir = TempDir::new().map_err(|e| format!("Failed to create temp dir: {}", e))?;
        let known_hosts_path = config_dir.path().join("known_hosts");

        Ok(Self {
            server,
            config_dir,
            known_hosts_path,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(
            self.server.host.clone(),
            self.server.port,
            self.server.username.clone(),
        )
    }

    pub fn password(&self) -> Credentials {
        Credentials::password(self.server.password.clone())
    }

    /// Store over this environment's isolated known_hosts file
    pub fn store(&self) -> HostKeyStore {
        HostKeyStore::open(&self.known_hosts_path)
    }

    /// Connector over a real russh transport
    pub fn connector(
        &self,
        handler: Arc<dyn ChallengeHandler>,
        policy: HostKeyPolicy,
    ) -> Arc<SessionConnector<RusshTransport>> {
        let settings = SessionSettings {
            connect_timeout_secs: 10,
            host_key_policy: policy,
            ..SessionSettings::default()
        };
        self.connector_with_settings(handler, settings)
    }

    pub fn connector_with_settings(
        &self,
        handler: Arc<dyn ChallengeHandler>,
        settings: SessionSettings,
    ) -> Arc<SessionConnector<RusshTransport>> {
        Arc::new(SessionConnector::new(
            Arc::new(RusshTransport::new()),
            Arc::new(HostKeyVerifier::new(self.store())),
            Arc::new(SessionRegistry::new()),
            handler,
            settings,
        ))
    }
}

/// Macro to skip tests when Docker is not available
#[macro_export]
macro_rules! skip_if_no_docker {
    () => {
        if !super::fixtures::is_docker_available() {
            eprintln!("Skipping test: Docker not available");
            return;
        }
    };
}
