//! SSH client dialing: TCP dial, handshake, TOFU host-key verification,
//! public-key authentication. Grounded on the client-side connector the
//! rest of the workspace already used for its own outbound tunnel, adapted
//! to dial out to each agent instead of a single fixed peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, Handle};
use russh_keys::key::{KeyPair, PublicKey};

use sshc_core::instance::InstanceId;
use sshc_core::orchestrator::SshEndpoint;

use crate::host_keys::{HostKeyOutcome, HostKeyStore};

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("host key mismatch")]
    HostKeyMismatch,

    #[error("authentication rejected")]
    AuthRejected,

    #[error("network error: {0}")]
    Network(String),
}

/// A connected SSH client session, ready for channel operations.
pub type ClientHandle = Handle<SshClientHandler>;

/// Dial `endpoint`, perform the handshake under `handshake_timeout`, verify
/// the host key through `host_keys`, and authenticate as `signer`.
pub async fn dial(
    instance: InstanceId,
    endpoint: &SshEndpoint,
    signer: Arc<KeyPair>,
    host_keys: Arc<HostKeyStore>,
    dial_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<ClientHandle, DialError> {
    let config = Arc::new(client::Config::default());
    let handler = SshClientHandler::new(instance, host_keys);
    let address = format!("{}:{}", endpoint.host, endpoint.port);

    let mut session = tokio::time::timeout(
        dial_timeout.max(handshake_timeout),
        client::connect(config, address, handler.clone()),
    )
    .await
    .map_err(|_| DialError::DialTimeout(dial_timeout))?
    .map_err(|e| {
        if matches!(handler.outcome(), Some(HostKeyOutcome::Mismatch)) {
            DialError::HostKeyMismatch
        } else {
            DialError::Network(e.to_string())
        }
    })?;

    if matches!(handler.outcome(), Some(HostKeyOutcome::Mismatch)) {
        return Err(DialError::HostKeyMismatch);
    }

    let authenticated = tokio::time::timeout(
        handshake_timeout,
        session.authenticate_publickey("root", signer),
    )
    .await
    .map_err(|_| DialError::HandshakeTimeout(handshake_timeout))?
    .map_err(|e| DialError::Network(e.to_string()))?;

    if !authenticated {
        return Err(DialError::AuthRejected);
    }

    Ok(session)
}

/// Verifies the agent's host key via TOFU and otherwise accepts the
/// defaults; owns no session state beyond that.
#[derive(Clone)]
pub struct SshClientHandler {
    instance: InstanceId,
    host_keys: Arc<HostKeyStore>,
    outcome: Arc<Mutex<Option<HostKeyOutcome>>>,
}

impl SshClientHandler {
    fn new(instance: InstanceId, host_keys: Arc<HostKeyStore>) -> Self {
        Self {
            instance,
            host_keys,
            outcome: Arc::new(Mutex::new(None)),
        }
    }

    fn outcome(&self) -> Option<HostKeyOutcome> {
        *self.outcome.lock()
    }
}

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        let result = self.host_keys.check_or_pin(self.instance, &fingerprint);
        *self.outcome.lock() = Some(result);

        match result {
            HostKeyOutcome::FirstUse | HostKeyOutcome::Matched => Ok(true),
            HostKeyOutcome::Mismatch => {
                tracing::error!(instance_id = %self.instance, %fingerprint, "host key mismatch");
                Ok(false)
            }
        }
    }
}
