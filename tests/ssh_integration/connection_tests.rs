//! Connection, exec and interactive shell tests

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use orcterm_core::config::{HostKeyPolicy, SessionSettings};
use orcterm_core::error::SshError;
use orcterm_core::ssh::{
    ChannelListener, Credentials, Endpoint, FixedDecision, RusshTransport, SessionConnector,
    SessionId, TerminalEvent, TerminalSession, TrustDecision,
};

use super::fixtures::{SshTestEnvironment, acquire_test_lock};

fn trusting_connector(env: &SshTestEnvironment) -> Arc<SessionConnector<RusshTransport>> {
    env.connector(
        Arc::new(FixedDecision(TrustDecision::TrustAndSave)),
        HostKeyPolicy::AskUser,
    )
}

/// Collect shell output until `needle` appears
async fn wait_for_output(events: &mut UnboundedReceiver<TerminalEvent>, needle: &str) -> String {
    let mut output = String::new();
    let result = timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            match event {
                TerminalEvent::Data(bytes) => {
                    output.push_str(&String::from_utf8_lossy(&bytes));
                    if output.contains(needle) {
                        return;
                    }
                }
                TerminalEvent::Error(message) => panic!("Unexpected error: {message}"),
                TerminalEvent::Disconnected => panic!("Disconnected while waiting for {needle:?}"),
                TerminalEvent::Connected => {}
            }
        }
    })
    .await;
    assert!(result.is_ok(), "Timed out waiting for {needle:?}, got {output:?}");
    output
}

/// Test successful connection with password authentication
#[tokio::test]
async fn test_password_auth_success() {
    skip_if_no_docker!();
    let _guard = acquire_test_lock().await;

    let env = SshTestEnvironment::new()
        .await
        .expect("Failed to create test environment");
    let connector = trusting_connector(&env);

    let result = connector
        .connect_fresh(&env.endpoint(), &env.password())
        .await;

    let handle = result.expect("Password auth should succeed");
    connector.release(handle).await;
}

/// Test that a wrong password is reported as an authentication failure
#[tokio::test]
async fn test_wrong_password_fails() {
    skip_if_no_docker!();
    let _guard = acquire_test_lock().await;

    let env = SshTestEnvironment::new()
        .await
        .expect("Failed to create test environment");
    let connector = trusting_connector(&env);

    let result = connector
        .connect_fresh(&env.endpoint(), &Credentials::password("wrong-password"))
        .await;

    assert!(
        matches!(result, Err(SshError::Auth(_))),
        "Wrong password should fail auth: {:?}",
        result.err()
    );
}

/// Test connection to a port with nothing listening
#[tokio::test]
async fn test_connection_refused() {
    skip_if_no_docker!();
    let _guard = acquire_test_lock().await;

    let env = SshTestEnvironment::new()
        .await
        .expect("Failed to create test environment");
    let connector = trusting_connector(&env);

    let endpoint = Endpoint::new(env.server.host.clone(), 1, env.server.username.clone());
    let result = connector.connect_fresh(&endpoint, &env.password()).await;

    assert!(
        matches!(result, Err(SshError::Connect { .. } | SshError::Timeout(_))),
        "Closed port should fail to connect: {:?}",
        result.err()
    );
}

/// Test running a one-off command on an authenticated connection
#[tokio::test]
async fn test_exec_command() {
    skip_if_no_docker!();
    let _guard = acquire_test_lock().await;

    let env = SshTestEnvironment::new()
        .await
        .expect("Failed to create test environment");
    let connector = trusting_connector(&env);

    let handle = connector
        .connect_fresh(&env.endpoint(), &env.password())
        .await
        .expect("Connection should succeed");
    let output = connector.exec(handle.id(), "echo orcterm-exec").await;
    connector.release(handle).await;

    let output = output.expect("exec should succeed");
    assert_eq!(output.trim(), "orcterm-exec");
}

/// Test that per-connection keepalives and channel-open timeouts leave a
/// connection usable after several keepalive rounds
#[tokio::test]
async fn test_keepalive_keeps_connection_usable() {
    skip_if_no_docker!();
    let _guard = acquire_test_lock().await;

    let env = SshTestEnvironment::new()
        .await
        .expect("Failed to create test environment");
    let settings = SessionSettings {
        connect_timeout_secs: 10,
        keepalive_interval_secs: 1,
        keepalive_reply: true,
        ..SessionSettings::default()
    };
    let connector = env.connector_with_settings(
        Arc::new(FixedDecision(TrustDecision::TrustAndSave)),
        settings,
    );

    let handle = connector
        .connect_fresh(&env.endpoint(), &env.password())
        .await
        .expect("Connection should succeed");
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let output = connector.exec(handle.id(), "echo still-here").await;
    connector.release(handle).await;

    assert_eq!(output.expect("exec after keepalives").trim(), "still-here");
}

/// Test an interactive shell: connect, echo a marker, disconnect
#[tokio::test]
async fn test_terminal_session_round_trip() {
    skip_if_no_docker!();
    let _guard = acquire_test_lock().await;

    let env = SshTestEnvironment::new()
        .await
        .expect("Failed to create test environment");
    let connector = trusting_connector(&env);

    let terminal = TerminalSession::new(SessionId(1), "integration", connector.clone());
    let (listener, mut events) = ChannelListener::new();
    terminal.add_listener(listener);

    terminal
        .connect(env.endpoint(), env.password())
        .await
        .expect("connect task panicked");
    let first = timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("Timed out waiting for connect");
    assert_eq!(first, Some(TerminalEvent::Connected));
    assert!(terminal.is_connected());

    terminal.resize(120, 40).await;
    terminal
        .write(b"echo orcterm-$((20 + 22))\n")
        .await
        .expect("write should succeed");
    wait_for_output(&mut events, "orcterm-42").await;

    terminal.disconnect().await;
    assert!(!terminal.is_connected());
    assert!(connector.registry().get_terminal_session(SessionId(1)).is_none());
}

/// Test that a handed-off connection is adopted by a second terminal
#[tokio::test]
async fn test_hand_off_to_second_terminal() {
    skip_if_no_docker!();
    let _guard = acquire_test_lock().await;

    let env = SshTestEnvironment::new()
        .await
        .expect("Failed to create test environment");
    let connector = trusting_connector(&env);

    let first = TerminalSession::new(SessionId(1), "first", connector.clone());
    let (listener, mut first_events) = ChannelListener::new();
    first.add_listener(listener);
    first.connect(env.endpoint(), env.password()).await.unwrap();
    assert_eq!(
        timeout(Duration::from_secs(10), first_events.recv()).await.unwrap(),
        Some(TerminalEvent::Connected)
    );
    let handle = first.handle_id().expect("handle");

    assert!(first.hand_off().await);
    assert!(connector.registry().has_shared_handle(SessionId(1)));

    let acquired = connector
        .acquire(&env.endpoint(), &env.password(), false)
        .await
        .expect("Shared handle should be adopted");
    assert!(acquired.shared);
    assert_eq!(acquired.source, Some(SessionId(1)));
    assert_eq!(acquired.handle.id(), handle);

    let second = TerminalSession::new(SessionId(2), "second", connector.clone());
    let (listener, mut second_events) = ChannelListener::new();
    second.add_listener(listener);
    second
        .attach_existing(acquired.handle, env.endpoint(), env.password())
        .await
        .expect("Adopted handle should open a shell");
    assert_eq!(
        timeout(Duration::from_secs(10), second_events.recv()).await.unwrap(),
        Some(TerminalEvent::Connected)
    );

    second.write(b"echo adopted-ok\n").await.unwrap();
    wait_for_output(&mut second_events, "adopted-ok").await;
    second.disconnect().await;
}
