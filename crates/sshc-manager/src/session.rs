//! A live (or recently live) per-instance SSH session.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use sshc_core::instance::InstanceId;
use sshc_core::orchestrator::SshEndpoint;

use crate::client::ClientHandle;
use crate::event::{ConnectionEvent, Ring, EVENT_RING_CAPACITY, TRANSITION_RING_CAPACITY};
use crate::state::{ConnectionState, StateTransition};

/// Keepalive counters, exposed via the status query
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepaliveStats {
    pub sent: u64,
    pub ok: u64,
    pub missed: u32,
}

/// Mutable session fields guarded together by one lock: state, rings, and
/// stats share a single per-session mutex; the event/transition rings are
/// self-locked circular buffers layered on top.
pub struct SessionInner {
    pub state: ConnectionState,
    pub dial_address: Option<SshEndpoint>,
    pub connected_at: Option<Instant>,
    pub keepalive: KeepaliveStats,
    pub last_error: Option<String>,
    pub source_ip: Option<IpAddr>,
}

impl Default for SessionInner {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            dial_address: None,
            connected_at: None,
            keepalive: KeepaliveStats::default(),
            last_error: None,
            source_ip: None,
        }
    }
}

/// Exclusively owned by the SSH Manager. Destroyed on explicit `Close`, on
/// `Failed` terminal, or on process shutdown.
pub struct Session {
    pub instance_id: InstanceId,
    pub(crate) inner: Mutex<SessionInner>,
    pub(crate) handle: AsyncMutex<Option<ClientHandle>>,
    pub(crate) reconnect_lock: AsyncMutex<()>,
    pub events: Ring<ConnectionEvent>,
    pub transitions: Ring<StateTransition>,
    pub cancel: CancellationToken,
}

impl Session {
    pub fn new(instance_id: InstanceId) -> Arc<Self> {
        Arc::new(Self {
            instance_id,
            inner: Mutex::new(SessionInner::default()),
            handle: AsyncMutex::new(None),
            reconnect_lock: AsyncMutex::new(()),
            events: Ring::new(EVENT_RING_CAPACITY),
            transitions: Ring::new(TRANSITION_RING_CAPACITY),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected)
    }

    /// Transition to `to`, recording a `StateTransition` and returning the
    /// prior state. Every state change produces exactly one matching
    /// `StateTransition` record.
    pub(crate) fn set_state(&self, to: ConnectionState) -> ConnectionState {
        let from = {
            let mut guard = self.inner.lock();
            let from = guard.state;
            guard.state = to;
            from
        };
        self.transitions.push(StateTransition::new(from, to));
        from
    }

    pub fn status(&self) -> SessionStatus {
        let guard = self.inner.lock();
        SessionStatus {
            instance_id: self.instance_id,
            state: guard.state,
            dial_address: guard.dial_address.clone(),
            connected_at: guard.connected_at,
            keepalive: guard.keepalive,
            last_error: guard.last_error.clone(),
        }
    }
}

/// Read-only snapshot of a session, safe to hand to callers outside the lock.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub instance_id: InstanceId,
    pub state: ConnectionState,
    pub dial_address: Option<SshEndpoint>,
    pub connected_at: Option<Instant>,
    pub keepalive: KeepaliveStats,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_disconnected() {
        let session = Session::new(InstanceId(1));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
    }

    #[test]
    fn set_state_records_transition() {
        let session = Session::new(InstanceId(1));
        session.set_state(ConnectionState::Connecting);
        session.set_state(ConnectionState::Connected);

        let transitions = session.transitions.snapshot();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].from, ConnectionState::Connecting);
        assert_eq!(transitions[0].to, ConnectionState::Connected);
        assert_eq!(transitions[1].from, ConnectionState::Disconnected);
        assert_eq!(transitions[1].to, ConnectionState::Connecting);
    }
}
