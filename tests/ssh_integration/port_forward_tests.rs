//! Local port forwarding through a live terminal session

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::timeout;

use orcterm_core::config::HostKeyPolicy;
use orcterm_core::ssh::{
    ChannelListener, FixedDecision, LocalForward, SessionId, TerminalEvent, TerminalSession,
    TrustDecision,
};

use super::fixtures::{SshTestEnvironment, acquire_test_lock};

/// sshd inside the container listens here
const SSHD_PORT: u16 = 2222;

#[tokio::test]
async fn test_local_forward_reaches_remote_sshd_banner() {
    skip_if_no_docker!();
    let _guard = acquire_test_lock().await;

    let env = SshTestEnvironment::new()
        .await
        .expect("Failed to create test environment");
    let connector = env.connector(
        Arc::new(FixedDecision(TrustDecision::TrustAndSave)),
        HostKeyPolicy::AskUser,
    );
    let terminal = TerminalSession::new(SessionId(1), "forwarding", connector.clone());
    let (listener, mut events) = ChannelListener::new();
    terminal.add_listener(listener);

    terminal
        .connect(env.endpoint(), env.password())
        .await
        .unwrap();
    let first = timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("connect timeout");
    assert_eq!(first, Some(TerminalEvent::Connected));

    let port = terminal
        .start_local_forwarding(LocalForward::new(0, "127.0.0.1", SSHD_PORT))
        .await
        .expect("forward failed");

    let mut stream = timeout(
        Duration::from_secs(3),
        tokio::net::TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    .expect("connect timeout")
    .expect("connect failed");

    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .expect("read timeout")
        .expect("read failed");
    let banner = String::from_utf8_lossy(&buf[..n]);
    assert!(banner.starts_with("SSH-"), "expected SSH banner, got: {:?}", banner);

    assert_eq!(terminal.stop_forwards().await, 1);
    terminal.disconnect().await;
}
