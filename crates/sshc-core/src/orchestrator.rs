//! Orchestrator collaborator contract.
//!
//! The SSH Manager and Tunnel Manager never talk to Docker, Kubernetes, or
//! any other backend directly. They ask an `Orchestrator` to authorize our
//! public key against an instance's agent and to resolve where that agent's
//! sshd is currently listening. Production backends live outside this
//! crate; `MockOrchestrator` here exists for tests and for the CLI's local
//! smoke-testing mode.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::instance::InstanceId;

/// Where an agent's sshd can currently be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
}

impl SshEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Failure classification for orchestrator calls. `Transient`
/// failures are retried under the caller's backoff policy; `Fatal` and
/// `NotFound` are not.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    #[error("transient orchestrator failure: {0}")]
    Transient(String),

    #[error("fatal orchestrator failure: {0}")]
    Fatal(String),
}

impl OrchestratorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestratorError::Transient(_))
    }
}

/// Collaborator contract the connectivity core uses to reach whatever
/// backend actually owns the fleet (Docker, Kubernetes, a bare VM fleet,
/// ...). Implemented outside this crate in production; `MockOrchestrator`
/// below backs tests and the CLI's standalone mode.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Push our public key (and, if supported, an IP allow list) so the
    /// instance's sshd will accept us. Idempotent: calling it again with
    /// the same key is a no-op on the backend side.
    async fn configure_ssh_access(
        &self,
        instance: InstanceId,
        public_key: &str,
        allow_list: Option<&str>,
    ) -> Result<(), OrchestratorError>;

    /// Resolve the instance's current SSH endpoint. Endpoints can change
    /// across restarts or rescheduling, so the SSH Manager re-resolves on
    /// every reconnect rather than caching indefinitely.
    async fn get_ssh_address(&self, instance: InstanceId) -> Result<SshEndpoint, OrchestratorError>;

    /// List instances the backend currently considers running, for the
    /// background reconciler. A `Transient` failure here is
    /// logged and skipped by the reconciler rather than treated as "none
    /// running".
    async fn list_running(&self) -> Result<Vec<InstanceId>, OrchestratorError>;

    /// Block until the instance reports running, or fail. Optional: the
    /// default polls `list_running` every second for up to 30s, which is
    /// adequate for tests and the CLI; real backends should override this
    /// with a native wait primitive.
    async fn wait_running(&self, instance: InstanceId) -> Result<(), OrchestratorError> {
        for _ in 0..30 {
            if self.list_running().await?.contains(&instance) {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        Err(OrchestratorError::Transient(format!(
            "instance {instance} did not report running in time"
        )))
    }
}

#[derive(Debug, Clone)]
struct MockInstanceState {
    endpoint: SshEndpoint,
    running: bool,
    configured_key: Option<String>,
    allow_list: Option<String>,
}

/// In-memory `Orchestrator` for tests and the CLI's standalone mode. Every
/// instance starts "running" with the endpoint given at registration.
#[derive(Default)]
pub struct MockOrchestrator {
    instances: RwLock<HashMap<InstanceId, MockInstanceState>>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance: InstanceId, host: impl Into<String>, port: u16) {
        self.instances.write().insert(
            instance,
            MockInstanceState {
                endpoint: SshEndpoint::new(host, port),
                running: true,
                configured_key: None,
                allow_list: None,
            },
        );
    }

    pub fn set_running(&self, instance: InstanceId, running: bool) {
        if let Some(state) = self.instances.write().get_mut(&instance) {
            state.running = running;
        }
    }

    pub fn configured_key(&self, instance: InstanceId) -> Option<String> {
        self.instances
            .read()
            .get(&instance)
            .and_then(|s| s.configured_key.clone())
    }

    pub fn source_allowed(&self, instance: InstanceId, source_ip: IpAddr) -> bool {
        let guard = self.instances.read();
        let Some(state) = guard.get(&instance) else {
            return false;
        };
        match &state.allow_list {
            None => true,
            Some(list) => crate::ip_policy::check(&source_ip.to_string(), list).is_ok(),
        }
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn configure_ssh_access(
        &self,
        instance: InstanceId,
        public_key: &str,
        allow_list: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let mut guard = self.instances.write();
        let state = guard
            .get_mut(&instance)
            .ok_or(OrchestratorError::NotFound(instance))?;
        state.configured_key = Some(public_key.to_string());
        state.allow_list = allow_list.map(str::to_string);
        Ok(())
    }

    async fn get_ssh_address(&self, instance: InstanceId) -> Result<SshEndpoint, OrchestratorError> {
        self.instances
            .read()
            .get(&instance)
            .map(|s| s.endpoint.clone())
            .ok_or(OrchestratorError::NotFound(instance))
    }

    async fn list_running(&self) -> Result<Vec<InstanceId>, OrchestratorError> {
        Ok(self
            .instances
            .read()
            .iter()
            .filter(|(_, state)| state.running)
            .map(|(id, _)| *id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn configure_then_resolve_round_trips() {
        let orchestrator = MockOrchestrator::new();
        orchestrator.register(InstanceId(1), "10.0.0.5", 22);

        orchestrator
            .configure_ssh_access(InstanceId(1), "ssh-ed25519 AAAA...", Some("10.0.0.0/24"))
            .await
            .unwrap();

        let endpoint = orchestrator.get_ssh_address(InstanceId(1)).await.unwrap();
        assert_eq!(endpoint, SshEndpoint::new("10.0.0.5", 22));
        assert_eq!(
            orchestrator.configured_key(InstanceId(1)),
            Some("ssh-ed25519 AAAA...".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let orchestrator = MockOrchestrator::new();
        let err = orchestrator.get_ssh_address(InstanceId(99)).await.unwrap_err();
        assert_eq!(err, OrchestratorError::NotFound(InstanceId(99)));
    }

    #[tokio::test]
    async fn list_running_excludes_stopped_instances() {
        let orchestrator = MockOrchestrator::new();
        orchestrator.register(InstanceId(1), "10.0.0.5", 22);
        orchestrator.register(InstanceId(2), "10.0.0.6", 22);
        orchestrator.set_running(InstanceId(2), false);

        let running = orchestrator.list_running().await.unwrap();
        assert_eq!(running, vec![InstanceId(1)]);
    }

    #[tokio::test]
    async fn wait_running_returns_immediately_when_already_running() {
        let orchestrator = MockOrchestrator::new();
        orchestrator.register(InstanceId(1), "10.0.0.5", 22);
        orchestrator.wait_running(InstanceId(1)).await.unwrap();
    }

    #[test]
    fn allow_list_gate_denies_non_member_source() {
        let orchestrator = MockOrchestrator::new();
        orchestrator.register(InstanceId(1), "10.0.0.5", 22);
        {
            let mut guard = orchestrator.instances.write();
            guard.get_mut(&InstanceId(1)).unwrap().allow_list = Some("10.0.0.0/24".to_string());
        }

        assert!(orchestrator.source_allowed(InstanceId(1), "10.0.0.9".parse().unwrap()));
        assert!(!orchestrator.source_allowed(InstanceId(1), "192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn no_allow_list_means_allow_all() {
        let orchestrator = MockOrchestrator::new();
        orchestrator.register(InstanceId(1), "10.0.0.5", 22);
        assert!(orchestrator.source_allowed(InstanceId(1), "203.0.113.9".parse().unwrap()));
    }
}
