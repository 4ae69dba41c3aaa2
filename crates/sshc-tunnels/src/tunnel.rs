//! A single reverse tunnel: one `127.0.0.1:0` listener forwarding each
//! accepted connection to a fixed `localhost:<remote_port>` destination on
//! the agent, over a `direct-tcpip` SSH channel.

use std::net::SocketAddr;

use sshc_core::instance::InstanceId;

/// A closed set today; only `reverse_service` is configured, but the type
/// leaves room for other tunnel kinds later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    ReverseService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Active,
    Error,
    Stopped,
}

/// Point-in-time health, refreshed by the per-tunnel health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Read-only snapshot of a tunnel, handed out by the status query
#[derive(Debug, Clone)]
pub struct TunnelStatus {
    pub instance_id: InstanceId,
    pub label: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub kind: TunnelKind,
    pub state: TunnelState,
    pub health: TunnelHealth,
}

/// A live reverse tunnel. `listener_addr` is whatever `127.0.0.1:0` resolved
/// to; `accept_task` and `cancel` drive and stop the accept loop.
pub struct Tunnel {
    pub instance_id: InstanceId,
    pub label: String,
    pub local_addr: SocketAddr,
    pub remote_host: String,
    pub remote_port: u16,
    pub kind: TunnelKind,
    pub(crate) state: parking_lot::Mutex<TunnelState>,
    pub(crate) health: parking_lot::Mutex<TunnelHealth>,
    pub(crate) cancel: tokio_util::sync::CancellationToken,
    pub(crate) accept_task: tokio::task::JoinHandle<()>,
}

impl Tunnel {
    pub fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TunnelState) {
        *self.state.lock() = state;
    }

    pub fn health(&self) -> TunnelHealth {
        *self.health.lock()
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus {
            instance_id: self.instance_id,
            label: self.label.clone(),
            local_port: self.local_port(),
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            kind: self.kind,
            state: self.state(),
            health: self.health(),
        }
    }

    /// True while the accept loop task is still running. Part of the
    /// health-check contract: "the local listener is still accepting".
    pub fn is_accepting(&self) -> bool {
        !self.accept_task.is_finished()
    }

    /// Stop the accept loop and mark `Stopped`. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.accept_task.abort();
        self.set_state(TunnelState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn test_tunnel(accept_task: tokio::task::JoinHandle<()>) -> Tunnel {
        Tunnel {
            instance_id: InstanceId(1),
            label: "VNC".to_string(),
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote_host: "localhost".to_string(),
            remote_port: 3000,
            kind: TunnelKind::ReverseService,
            state: parking_lot::Mutex::new(TunnelState::Starting),
            health: parking_lot::Mutex::new(TunnelHealth::Unknown),
            cancel: CancellationToken::new(),
            accept_task,
        }
    }

    #[tokio::test]
    async fn is_accepting_while_task_runs_then_false_after_stop() {
        let cancel = CancellationToken::new();
        let child = cancel.child_token();
        let task = tokio::spawn(async move { child.cancelled().await });
        let mut tunnel = test_tunnel(task);
        tunnel.cancel = cancel;

        assert!(tunnel.is_accepting());
        tunnel.stop().await;

        assert!(!tunnel.is_accepting());
        assert_eq!(tunnel.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let tunnel = test_tunnel(tokio::spawn(async {}));
        tunnel.stop().await;
        tunnel.stop().await;
        assert_eq!(tunnel.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn status_reflects_current_state_and_health() {
        let tunnel = test_tunnel(tokio::spawn(async { std::future::pending::<()>().await }));
        tunnel.set_state(TunnelState::Active);
        *tunnel.health.lock() = TunnelHealth::Healthy;

        let status = tunnel.status();
        assert_eq!(status.instance_id, InstanceId(1));
        assert_eq!(status.label, "VNC");
        assert_eq!(status.state, TunnelState::Active);
        assert_eq!(status.health, TunnelHealth::Healthy);
        assert_eq!(status.remote_port, 3000);

        tunnel.stop().await;
    }
}
