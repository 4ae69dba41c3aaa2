//! Accept loop for one reverse tunnel: binds a local listener and bridges
//! each accepted connection through a `direct-tcpip` channel on the live
//! SSH session. Grounded on the workspace's own `-L` local-forward runtime
//! (bind, accept, `channel_open_direct_tcpip`, `copy_bidirectional`).

use std::sync::Arc;

use sshc_core::instance::InstanceId;
use sshc_manager::SshManager;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::tunnel::{Tunnel, TunnelHealth, TunnelKind, TunnelState};

/// Bind the listener and spawn the accept loop. Returns the bound
/// `Tunnel` in `Starting` state; the caller flips it to `Active` once the
/// listener is confirmed bound (which, since `bind` already succeeded,
/// happens immediately).
pub async fn start(
    instance_id: InstanceId,
    label: String,
    remote_host: String,
    remote_port: u16,
    manager: Arc<SshManager>,
) -> std::io::Result<Arc<Tunnel>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let local_addr = listener.local_addr()?;
    let cancel = CancellationToken::new();

    let tunnel = Arc::new(Tunnel {
        instance_id,
        label: label.clone(),
        local_addr,
        remote_host: remote_host.clone(),
        remote_port,
        kind: TunnelKind::ReverseService,
        state: parking_lot::Mutex::new(TunnelState::Starting),
        health: parking_lot::Mutex::new(TunnelHealth::Unknown),
        cancel: cancel.clone(),
        accept_task: tokio::spawn(accept_loop(
            listener,
            instance_id,
            remote_host,
            remote_port,
            manager,
            cancel,
        )),
    });

    tunnel.set_state(TunnelState::Active);
    Ok(tunnel)
}

async fn accept_loop(
    listener: TcpListener,
    instance_id: InstanceId,
    remote_host: String,
    remote_port: u16,
    manager: Arc<SshManager>,
    cancel: CancellationToken,
) {
    loop {
        let (tcp_stream, _peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(
                        local_addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                        error = %e,
                        "tunnel listener accept failed"
                    );
                    continue;
                }
            },
            _ = cancel.cancelled() => return,
        };

        let remote_host = remote_host.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            splice_one(tcp_stream, instance_id, remote_host, remote_port, manager).await;
        });
    }
}

async fn splice_one(
    mut tcp_stream: tokio::net::TcpStream,
    instance_id: InstanceId,
    remote_host: String,
    remote_port: u16,
    manager: Arc<SshManager>,
) {
    let channel = manager
        .open_direct_tcpip(instance_id, &remote_host, remote_port)
        .await;

    let channel = match channel {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(%remote_host, remote_port, error = %e, "failed to open direct-tcpip channel");
            return;
        }
    };

    let mut channel_stream = channel.into_stream();
    if let Err(e) = tokio::io::copy_bidirectional(&mut tcp_stream, &mut channel_stream).await {
        tracing::debug!(error = %e, "tunnel stream closed");
    }
}

/// Confirm the tunnel is healthy: listener task still running and the SSH
/// session still connected.
pub fn check_health(tunnel: &Tunnel, session_connected: bool) -> TunnelHealth {
    let healthy = tunnel.is_accepting() && session_connected;
    let health = if healthy { TunnelHealth::Healthy } else { TunnelHealth::Unhealthy };
    *tunnel.health.lock() = health;
    if !healthy {
        tunnel.set_state(TunnelState::Error);
    }
    health
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshc_core::orchestrator::MockOrchestrator;
    use sshc_manager::SshManager;

    async fn test_manager() -> Arc<SshManager> {
        let dir = tempfile::tempdir().unwrap();
        let keystore = sshc_core::keystore::KeyStore::ensure(dir.path()).unwrap();
        let orchestrator = Arc::new(MockOrchestrator::new());
        SshManager::new(sshc_core::config::CoreConfig::default(), &keystore, orchestrator).unwrap()
    }

    #[tokio::test]
    async fn healthy_tunnel_stays_active_on_successful_check() {
        let manager = test_manager().await;
        let tunnel = start(instance_id(), "VNC".to_string(), "localhost".to_string(), 3000, manager)
            .await
            .unwrap();

        assert_eq!(check_health(&tunnel, true), TunnelHealth::Healthy);
        assert_eq!(tunnel.state(), TunnelState::Active);

        tunnel.stop().await;
    }

    #[tokio::test]
    async fn disconnected_session_marks_tunnel_unhealthy_and_errored() {
        let manager = test_manager().await;
        let tunnel = start(instance_id(), "VNC".to_string(), "localhost".to_string(), 3000, manager)
            .await
            .unwrap();

        assert_eq!(check_health(&tunnel, false), TunnelHealth::Unhealthy);
        assert_eq!(tunnel.state(), TunnelState::Error);

        tunnel.stop().await;
    }

    #[tokio::test]
    async fn stopped_listener_is_unhealthy_even_if_session_is_connected() {
        let manager = test_manager().await;
        let tunnel = start(instance_id(), "VNC".to_string(), "localhost".to_string(), 3000, manager)
            .await
            .unwrap();
        tunnel.stop().await;

        assert_eq!(check_health(&tunnel, true), TunnelHealth::Unhealthy);
    }

    fn instance_id() -> sshc_core::instance::InstanceId {
        sshc_core::instance::InstanceId(1)
    }
}
