//! `TunnelManager`: owns the reverse-tunnel set and the logical channel
//! multiplexer for every `Connected` session. Reacts to `SshManager`'s
//! event stream as a `SessionObserver` rather than being driven by direct
//! calls, so neither manager holds the other as an owning reference.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use sshc_core::config::CoreConfig;
use sshc_core::error::CoreError;
use sshc_core::instance::InstanceId;
use sshc_core::orchestrator::Orchestrator;
use sshc_manager::{ConnectionEvent, EventType, SessionObserver, SshManager};
use tokio::sync::Semaphore;

use crate::reconciler;
use crate::splice;
use crate::tunnel::{Tunnel, TunnelHealth, TunnelStatus};

const RECONCILER_FANOUT: usize = 16;

pub struct TunnelManager {
    pub(crate) ssh: Arc<SshManager>,
    pub(crate) orchestrator: Arc<dyn Orchestrator>,
    pub(crate) config: CoreConfig,
    pub(crate) tunnels: DashMap<(InstanceId, String), Arc<Tunnel>>,
    pub(crate) fanout: Semaphore,
    weak_self: Weak<TunnelManager>,
}

impl TunnelManager {
    pub fn new(
        ssh: Arc<SshManager>,
        orchestrator: Arc<dyn Orchestrator>,
        config: CoreConfig,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak_self| Self {
            ssh: ssh.clone(),
            orchestrator,
            config,
            tunnels: DashMap::new(),
            fanout: Semaphore::new(RECONCILER_FANOUT),
            weak_self: weak_self.clone(),
        });
        ssh.register_observer(manager.clone() as Arc<dyn SessionObserver>);
        manager
    }

    /// Start the configured reverse tunnels for `instance`. Requires the
    /// session to be `Connected`. Idempotent: an existing `Active` tunnel
    /// for a (instance, label) pair whose health check still passes is left
    /// alone; anything else is torn down and recreated.
    pub async fn start_tunnels_for_instance(&self, instance: InstanceId) -> Result<(), CoreError> {
        let session = self.ssh.session(instance).await.ok_or(CoreError::Closed)?;
        if !session.is_connected() {
            return Err(CoreError::Closed);
        }

        for spec in self.config.tunnels.clone() {
            let key = (instance, spec.label.clone());
            if let Some(existing) = self.tunnels.get(&key) {
                if splice::check_health(existing.value(), true) == TunnelHealth::Healthy {
                    continue;
                }
            }
            self.tunnels.remove(&key);

            match splice::start(
                instance,
                spec.label.clone(),
                "localhost".to_string(),
                spec.remote_port,
                self.ssh.clone(),
            )
            .await
            {
                Ok(tunnel) => {
                    tracing::info!(
                        instance_id = %instance,
                        label = %spec.label,
                        local_port = tunnel.local_port(),
                        remote_port = spec.remote_port,
                        "tunnel active"
                    );
                    self.tunnels.insert(key, tunnel);
                }
                Err(e) => {
                    tracing::warn!(instance_id = %instance, label = %spec.label, error = %e, "failed to start tunnel");
                    return Err(CoreError::NetworkError(e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Close every tunnel listener for `instance` and release its ports.
    /// Idempotent.
    pub async fn stop_tunnels_for_instance(&self, instance: InstanceId) {
        let keys: Vec<_> = self
            .tunnels
            .iter()
            .filter(|e| e.key().0 == instance)
            .map(|e| e.key().clone())
            .collect();

        for key in keys {
            if let Some((_, tunnel)) = self.tunnels.remove(&key) {
                tunnel.stop().await;
            }
        }
    }

    pub fn tunnel_statuses(&self, instance: InstanceId) -> Vec<TunnelStatus> {
        self.tunnels
            .iter()
            .filter(|e| e.key().0 == instance)
            .map(|e| e.value().status())
            .collect()
    }

    /// Spawn the per-tunnel health check loop, ticking every 10s.
    pub fn spawn_health_checks(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.tunnel_health_interval);
            loop {
                ticker.tick().await;
                let entries: Vec<_> = manager
                    .tunnels
                    .iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect();
                for ((instance, _label), tunnel) in entries {
                    let connected = manager
                        .ssh
                        .session(instance)
                        .await
                        .map(|s| s.is_connected())
                        .unwrap_or(false);
                    splice::check_health(&tunnel, connected);
                }
            }
        });
    }

    /// Spawn the background reconciler
    pub fn spawn_reconciler(self: &Arc<Self>) {
        let manager = self.clone();
        let interval = manager.config.reconciler_interval;
        tokio::spawn(async move {
            reconciler::run(manager, interval).await;
        });
    }

    pub(crate) async fn ensure_connected(&self, instance: InstanceId) -> Result<(), CoreError> {
        if let Some(session) = self.ssh.session(instance).await {
            if session.is_connected() {
                return Ok(());
            }
        }
        self.ssh.connect(instance, None, None).await
    }

    pub(crate) async fn close_instance(&self, instance: InstanceId) -> Result<(), CoreError> {
        self.stop_tunnels_for_instance(instance).await;
        self.ssh.close(instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sshc_core::orchestrator::MockOrchestrator;

    async fn test_manager() -> Arc<TunnelManager> {
        let dir = tempfile::tempdir().unwrap();
        let keystore = sshc_core::keystore::KeyStore::ensure(dir.path()).unwrap();
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(MockOrchestrator::new());
        let ssh = SshManager::new(CoreConfig::default(), &keystore, orchestrator.clone()).unwrap();
        TunnelManager::new(ssh, orchestrator, CoreConfig::default())
    }

    #[tokio::test]
    async fn tunnel_statuses_is_empty_for_unknown_instance() {
        let manager = test_manager().await;
        assert!(manager.tunnel_statuses(InstanceId(1)).is_empty());
    }

    #[tokio::test]
    async fn stop_tunnels_for_instance_with_none_running_is_a_no_op() {
        let manager = test_manager().await;
        manager.stop_tunnels_for_instance(InstanceId(1)).await;
        assert!(manager.tunnel_statuses(InstanceId(1)).is_empty());
    }

    #[tokio::test]
    async fn start_tunnels_for_instance_without_a_session_fails_closed() {
        let manager = test_manager().await;
        let result = manager.start_tunnels_for_instance(InstanceId(1)).await;
        assert!(matches!(result, Err(CoreError::Closed)));
    }
}

impl SessionObserver for TunnelManager {
    fn on_event(&self, event: &ConnectionEvent) {
        // Called synchronously from the emitter; must not block. Hand off
        // to a task for anything that needs I/O.
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let instance = event.instance_id;

        match event.event_type {
            EventType::Connected | EventType::Reconnected => {
                tokio::spawn(async move {
                    if let Err(e) = this.start_tunnels_for_instance(instance).await {
                        tracing::warn!(instance_id = %instance, error = %e, "failed to start tunnels after connect");
                    }
                });
            }
            EventType::ReconnectFailed => {
                tokio::spawn(async move {
                    this.stop_tunnels_for_instance(instance).await;
                });
            }
            _ => {}
        }
    }
}
