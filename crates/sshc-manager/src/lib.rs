//! sshc-manager: owns per-instance SSH sessions (component C4 of the
//! connectivity core). Connect, key upload, keepalive, the connection
//! state machine, event history, and deduplicated reconnection with
//! backoff all live here; the Tunnel Manager layers on top as an observer.

pub mod backoff;
pub mod client;
pub mod event;
pub mod host_keys;
pub mod keepalive;
pub mod manager;
pub mod session;
pub mod state;

pub use backoff::ExponentialBackoff;
pub use client::{ClientHandle, DialError};
pub use event::{ConnectionEvent, EventBus, EventType, Ring, SessionObserver};
pub use host_keys::{HostKeyOutcome, HostKeyStore};
pub use manager::SshManager;
pub use session::{KeepaliveStats, Session, SessionStatus};
pub use state::{ConnectionState, StateTransition};
