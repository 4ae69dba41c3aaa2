//! `SshManager`: owns every live `Session`, drives the connect/reconnect
//! state machine, and fans out `ConnectionEvent`s to registered observers.
//! Grounded on the workspace's existing `StateCoordinator` (cross-collection
//! locking discipline) and `ConnectionPool`/`SessionManager` (map ownership
//! pattern), generalized from a single fixed peer to an arbitrary fleet.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use russh_keys::key::KeyPair;
use tokio::sync::RwLock;

use sshc_core::config::CoreConfig;
use sshc_core::error::CoreError;
use sshc_core::instance::InstanceId;
use sshc_core::ip_policy;
use sshc_core::keystore::KeyStore;
use sshc_core::orchestrator::{Orchestrator, OrchestratorError};
use sshc_core::rate_limiter::RateLimiter;

use crate::backoff::ExponentialBackoff;
use crate::client::{self, DialError};
use crate::event::{ConnectionEvent, EventBus, EventType, SessionObserver};
use crate::host_keys::HostKeyStore;
use crate::keepalive;
use crate::session::{Session, SessionStatus};
use crate::state::ConnectionState;

/// Everything needed to attempt a connection, captured once so automatic
/// reconnects can replay it without the caller re-supplying arguments.
#[derive(Clone, Default)]
struct ConnectParams {
    source_ip: Option<IpAddr>,
    allow_list: Option<String>,
}

pub struct SshManager {
    sessions: RwLock<HashMap<InstanceId, Arc<Session>>>,
    params: parking_lot::Mutex<HashMap<InstanceId, ConnectParams>>,
    config: CoreConfig,
    signer: Arc<KeyPair>,
    public_key_line: String,
    rate_limiter: Arc<RateLimiter>,
    orchestrator: Arc<dyn Orchestrator>,
    host_keys: Arc<HostKeyStore>,
    events: Arc<EventBus>,
}

impl SshManager {
    pub fn new(
        config: CoreConfig,
        keystore: &KeyStore,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Result<Arc<Self>, CoreError> {
        let host_keys = HostKeyStore::load(&config.data_dir)
            .map_err(|e| CoreError::Internal(format!("failed to load host key store: {e}")))?;

        let signer = russh_keys::decode_secret_key(keystore.private_pem(), None)
            .map_err(|_| CoreError::Internal("failed to decode signer key".into()))?;

        Ok(Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            params: parking_lot::Mutex::new(HashMap::new()),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            public_key_line: keystore.public_key_authorized_format().to_string(),
            config,
            signer: Arc::new(signer),
            orchestrator,
            host_keys: Arc::new(host_keys),
            events: Arc::new(EventBus::new()),
        }))
    }

    pub fn register_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.events.register(observer);
    }

    pub async fn status(&self, instance: InstanceId) -> Option<SessionStatus> {
        let sessions = self.sessions.read().await;
        sessions.get(&instance).map(|s| s.status())
    }

    pub async fn list_instances(&self) -> Vec<InstanceId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Direct session access for the tunnel layer's channel operations.
    pub async fn session(&self, instance: InstanceId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&instance).cloned()
    }

    /// Open a `direct-tcpip` channel to `remote_host:remote_port` on the
    /// instance's agent, for the Tunnel Manager's reverse-forward splicing.
    pub async fn open_direct_tcpip(
        &self,
        instance: InstanceId,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<russh::Channel<russh::client::Msg>, CoreError> {
        let session = self.session(instance).await.ok_or(CoreError::Closed)?;
        let guard = session.handle.lock().await;
        let handle = guard.as_ref().ok_or(CoreError::Closed)?;
        handle
            .channel_open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| CoreError::NetworkError(e.to_string()))
    }

    /// Open a plain session channel on the instance's live SSH session, for
    /// the Tunnel Manager's logical channel multiplexer.
    pub async fn open_session_channel(
        &self,
        instance: InstanceId,
    ) -> Result<russh::Channel<russh::client::Msg>, CoreError> {
        let session = self.session(instance).await.ok_or(CoreError::Closed)?;
        let guard = session.handle.lock().await;
        let handle = guard.as_ref().ok_or(CoreError::Closed)?;
        handle
            .channel_open_session()
            .await
            .map_err(|e| CoreError::NetworkError(e.to_string()))
    }

    async fn get_or_create_session(&self, instance: InstanceId) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(instance)
            .or_insert_with(|| Session::new(instance))
            .clone()
    }

    pub(crate) fn emit(&self, session: &Session, event_type: EventType, details: Option<String>) {
        let event = ConnectionEvent::new(session.instance_id, event_type, details);
        session.events.push(event.clone());
        self.events.emit(&event);
    }

    /// Explicit connect. Valid only when the instance has no session yet or
    /// its session is `Disconnected`/`Failed`. Makes exactly one handshake
    /// attempt against the Rate Limiter and returns — it does not retry
    /// internally. Resilience against a dropped session is the keepalive/
    /// reconnect path's job, once a session has reached `Connected` at least
    /// once; a caller wanting retries on a cold connect re-issues `connect`.
    pub async fn connect(
        self: &Arc<Self>,
        instance: InstanceId,
        source_ip: Option<IpAddr>,
        allow_list: Option<&str>,
    ) -> Result<(), CoreError> {
        let session = self.get_or_create_session(instance).await;
        if !session.state().accepts_connect() {
            return Err(CoreError::Internal(format!(
                "connect called on instance {instance} in state {:?}",
                session.state()
            )));
        }

        self.params.lock().insert(
            instance,
            ConnectParams {
                source_ip,
                allow_list: allow_list.map(str::to_string),
            },
        );

        if let Some(source_ip) = source_ip {
            if ip_policy::check(&source_ip.to_string(), allow_list.unwrap_or("")).is_err() {
                self.emit(&session, EventType::IpRestricted, Some(source_ip.to_string()));
                return Err(CoreError::IpDenied(source_ip.to_string()));
            }
        }

        session.set_state(ConnectionState::Connecting);
        self.emit(&session, EventType::Connecting, None);

        match self.attempt_once(&session).await {
            Ok(()) => {
                session.set_state(ConnectionState::Connected);
                session.inner.lock().connected_at = Some(std::time::Instant::now());
                self.rate_limiter.record_success(instance);
                self.emit(&session, EventType::Connected, None);
                self.spawn_keepalive(instance);
                Ok(())
            }
            Err(err @ CoreError::HostKeyMismatch(_)) => {
                session.set_state(ConnectionState::Failed);
                session.inner.lock().last_error = Some(err.to_string());
                self.emit(&session, EventType::ReconnectFailed, Some(err.to_string()));
                Err(err)
            }
            Err(err @ (CoreError::RateLimited { .. } | CoreError::Blocked { .. })) => {
                session.set_state(ConnectionState::Disconnected);
                self.emit(&session, EventType::RateLimited, Some(err.to_string()));
                Err(err)
            }
            Err(err) => {
                self.rate_limiter.record_failure(instance);
                session.inner.lock().last_error = Some(err.to_string());
                session.set_state(ConnectionState::Failed);
                self.emit(&session, EventType::ReconnectFailed, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Trigger a reconnect, coalescing concurrent callers onto one in-flight
    /// attempt. Unlike `connect`, this retries internally under the
    /// configured backoff policy until success or `max_attempts` exhausted.
    pub async fn trigger_reconnect(self: &Arc<Self>, instance: InstanceId) -> Result<(), CoreError> {
        let session = match self.session(instance).await {
            Some(s) => s,
            None => return Err(CoreError::Closed),
        };

        let _coalesced = session.reconnect_lock.lock().await;
        if session.is_connected() {
            // Another waiter already completed the reconnect.
            return Ok(());
        }

        session.set_state(ConnectionState::Reconnecting);
        self.emit(&session, EventType::Disconnected, None);
        self.emit(&session, EventType::Reconnecting, None);

        self.run_sequence(&session).await
    }

    /// Backoff-driven retry loop used exclusively by `trigger_reconnect`.
    async fn run_sequence(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), CoreError> {
        let params = self.params.lock().get(&session.instance_id).cloned().unwrap_or_default();

        if let Some(source_ip) = params.source_ip {
            let allow_list = params.allow_list.as_deref().unwrap_or("");
            if ip_policy::check(&source_ip.to_string(), allow_list).is_err() {
                self.emit(session, EventType::IpRestricted, Some(source_ip.to_string()));
                return Err(CoreError::IpDenied(source_ip.to_string()));
            }
        }

        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);

        loop {
            let is_retry = backoff.attempts() > 0;
            if is_retry {
                tokio::time::sleep(backoff.next_delay()).await;
            } else {
                backoff.next_delay();
            }

            session.set_state(ConnectionState::Connecting);
            if is_retry {
                self.emit(session, EventType::Reconnecting, None);
            }
            // On the first iteration the caller (trigger_reconnect) already
            // emitted Reconnecting for this attempt.

            match self.attempt_once(session).await {
                Ok(()) => {
                    session.set_state(ConnectionState::Connected);
                    session.inner.lock().connected_at = Some(std::time::Instant::now());
                    self.rate_limiter.record_success(session.instance_id);
                    self.emit(session, EventType::Reconnected, None);
                    self.spawn_keepalive(session.instance_id);
                    return Ok(());
                }
                Err(err @ CoreError::HostKeyMismatch(_)) => {
                    session.set_state(ConnectionState::Failed);
                    session.inner.lock().last_error = Some(err.to_string());
                    self.emit(session, EventType::ReconnectFailed, Some(err.to_string()));
                    return Err(err);
                }
                Err(err @ (CoreError::RateLimited { .. } | CoreError::Blocked { .. })) => {
                    session.set_state(ConnectionState::Disconnected);
                    self.emit(session, EventType::RateLimited, Some(err.to_string()));
                    return Err(err);
                }
                Err(err) => {
                    self.rate_limiter.record_failure(session.instance_id);
                    session.inner.lock().last_error = Some(err.to_string());

                    if backoff.attempts_exhausted() {
                        session.set_state(ConnectionState::Failed);
                        self.emit(session, EventType::ReconnectFailed, Some(err.to_string()));
                        return Err(err);
                    }
                    session.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    async fn attempt_once(&self, session: &Arc<Session>) -> Result<(), CoreError> {
        self.rate_limiter.allow(session.instance_id)?;

        let endpoint = self
            .orchestrator
            .get_ssh_address(session.instance_id)
            .await
            .map_err(map_orchestrator_err(session.instance_id))?;

        self.orchestrator
            .configure_ssh_access(session.instance_id, &self.public_key_line, None)
            .await
            .map_err(map_orchestrator_err(session.instance_id))?;
        self.emit(session, EventType::KeyUploaded, None);

        let handle = client::dial(
            session.instance_id,
            &endpoint,
            self.signer.clone(),
            self.host_keys.clone(),
            self.config.dial_timeout,
            self.config.handshake_timeout,
        )
        .await
        .map_err(map_dial_err(session.instance_id))?;

        {
            let mut handle_guard = session.handle.lock().await;
            *handle_guard = Some(handle);
        }
        session.inner.lock().dial_address = Some(endpoint);

        Ok(())
    }

    /// Spawn the keepalive worker for a connected session, wiring its
    /// failure outcome back into `trigger_reconnect`.
    pub fn spawn_keepalive(self: &Arc<Self>, instance: InstanceId) {
        let manager = self.clone();
        tokio::spawn(async move {
            let session = match manager.session(instance).await {
                Some(s) => s,
                None => return,
            };
            let cancel = session.cancel.child_token();
            let should_reconnect = keepalive::run(
                manager.clone(),
                session,
                manager.config.keepalive_interval,
                manager.config.keepalive_reply_timeout,
                manager.config.keepalive_miss_max,
                cancel,
            )
            .await;

            if should_reconnect {
                let _ = manager.trigger_reconnect(instance).await;
            }
        });
    }

    /// Cancel keepalive/reconnect, drop the SSH handle, and remove the
    /// session. Idempotent.
    pub async fn close(&self, instance: InstanceId) -> Result<(), CoreError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&instance)
        };

        let Some(session) = session else {
            return Ok(());
        };

        session.cancel.cancel();
        let mut handle_guard = session.handle.lock().await;
        if let Some(handle) = handle_guard.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "closing", "en")
                .await;
        }
        session.set_state(ConnectionState::Disconnected);
        self.params.lock().remove(&instance);
        Ok(())
    }
}

fn map_orchestrator_err(instance: InstanceId) -> impl Fn(OrchestratorError) -> CoreError {
    move |e| match e {
        OrchestratorError::NotFound(_) => CoreError::EndpointUnresolved(instance),
        OrchestratorError::Transient(_) => CoreError::EndpointUnresolved(instance),
        OrchestratorError::Fatal(msg) => CoreError::NetworkError(msg),
    }
}

fn map_dial_err(instance: InstanceId) -> impl Fn(DialError) -> CoreError {
    move |e| match e {
        DialError::DialTimeout(d) => CoreError::Timeout(d),
        DialError::HandshakeTimeout(d) => CoreError::Timeout(d),
        DialError::HostKeyMismatch => CoreError::HostKeyMismatch(instance),
        DialError::AuthRejected => CoreError::AuthFailed(instance),
        DialError::Network(msg) => CoreError::NetworkError(msg),
    }
}
