//! Core error types shared across the SSH connectivity core.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::instance::InstanceId;

/// Top-level error taxonomy from the design's failure model
///
/// `RateLimited`, `Blocked`, `IpDenied`, `HostKeyMismatch`, `AuthFailed`, and
/// `KeyError` are meant to surface to callers unchanged. `Timeout`,
/// `NetworkError`, and `EndpointUnresolved` are retried under backoff by the
/// SSH Manager and only surface once `reconnect_max_attempts` is exhausted.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad key material or key generation failure.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// The orchestrator collaborator could not resolve the agent's endpoint.
    #[error("endpoint unresolved for instance {0}")]
    EndpointUnresolved(InstanceId),

    /// The agent rejected our key during the SSH handshake.
    #[error("authentication rejected by instance {0}")]
    AuthFailed(InstanceId),

    /// Trust-on-first-use host key verification failed.
    #[error("host key mismatch for instance {0}")]
    HostKeyMismatch(InstanceId),

    /// A bounded operation (dial, handshake, keepalive, ping) exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The rate limiter's sliding window rejected this attempt.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The rate limiter's consecutive-failure threshold is currently tripped.
    #[error("blocked, retry after {retry_after:?}")]
    Blocked { retry_after: Duration },

    /// The source IP failed the instance's allow list.
    #[error("source IP denied: {0}")]
    IpDenied(String),

    /// A network-level failure (dial refused, EOF, reset).
    #[error("network error: {0}")]
    NetworkError(String),

    /// The operation targeted a session or tunnel that is already closed.
    #[error("closed")]
    Closed,

    /// An invariant was violated. Implies a bug in the core, not in the caller.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Key Store failures
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("I/O error accessing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse key material at {0:?}")]
    BadKey(PathBuf),

    #[error("failed to generate Ed25519 key pair")]
    GenerationFailed,

    #[error("could not acquire exclusive lock on key directory {0:?}")]
    LockUnavailable(PathBuf),
}

/// Configuration loading/parsing failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0:?}")]
    NotFound(PathBuf),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
