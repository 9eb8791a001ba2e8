//! Local port forwarding over an authenticated russh connection.
//!
//! Each accepted socket gets its own direct-tcpip channel. Aborting the
//! accept task closes the listener and drops every bridge it spawned.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client::Handle;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::SshError;

use super::handler::ClientHandler;
use super::transport::{LocalForward, within};

pub(crate) type SharedHandle = Arc<tokio::sync::Mutex<Handle<ClientHandler>>>;

/// A running forward, owned by its connection
pub(crate) struct ActiveForward {
    pub bound_port: u16,
    task: JoinHandle<()>,
}

impl ActiveForward {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Bind the local side of `forward` on the loopback interface.
pub(crate) async fn bind(forward: &LocalForward) -> Result<(TcpListener, u16), SshError> {
    let listener = TcpListener::bind(("127.0.0.1", forward.local_port))
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => {
                SshError::Forward(format!("port {} is already in use", forward.local_port))
            }
            std::io::ErrorKind::PermissionDenied => SshError::Forward(format!(
                "permission denied binding port {}",
                forward.local_port
            )),
            _ => SshError::Forward(format!("binding port {}: {}", forward.local_port, e)),
        })?;
    let bound_port = listener
        .local_addr()
        .map_err(|e| SshError::Forward(e.to_string()))?
        .port();
    Ok((listener, bound_port))
}

pub(crate) fn spawn(
    listener: TcpListener,
    bound_port: u16,
    session: SharedHandle,
    forward: LocalForward,
    open_timeout: Option<Duration>,
) -> ActiveForward {
    tracing::info!("Forwarding 127.0.0.1:{} -> {}:{}", bound_port, forward.target_host, forward.target_port);
    let task = tokio::spawn(accept_loop(listener, session, forward, open_timeout));
    ActiveForward { bound_port, task }
}

async fn accept_loop(
    listener: TcpListener,
    session: SharedHandle,
    forward: LocalForward,
    open_timeout: Option<Duration>,
) {
    let mut bridges = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    bridges.spawn(bridge(stream, peer, session.clone(), forward.clone(), open_timeout));
                }
                Err(e) => {
                    tracing::warn!("Accept on forward {} failed: {}", forward, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = bridges.join_next(), if !bridges.is_empty() => {}
        }
    }
}

async fn bridge(
    mut local: TcpStream,
    peer: SocketAddr,
    session: SharedHandle,
    forward: LocalForward,
    open_timeout: Option<Duration>,
) {
    let open = async {
        let session = session.lock().await;
        session
            .channel_open_direct_tcpip(
                forward.target_host.clone(),
                u32::from(forward.target_port),
                peer.ip().to_string(),
                u32::from(peer.port()),
            )
            .await
            .map_err(|e| SshError::Forward(e.to_string()))
    };

    let channel = match within(open_timeout, open, || format!("opening tunnel {forward}")).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!("Forward {} for {} failed: {}", forward, peer, e);
            return;
        }
    };

    let mut remote = channel.into_stream();
    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((sent, received)) => {
            tracing::debug!("Tunnel {} for {} closed ({} up, {} down)", forward, peer, sent, received);
        }
        Err(e) => tracing::debug!("Tunnel {} for {} ended: {}", forward, peer, e),
    }
}
