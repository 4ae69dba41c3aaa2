//! sshc-core: shared types, configuration, and policy engines for the
//! SSH connectivity core.
//!
//! This crate holds the pieces that are small enough to not deserve their
//! own crate (the Key Store, Rate Limiter, and IP Policy from the design
//! doc) plus the `Orchestrator` collaborator contract and the types shared
//! by `sshc-manager` and `sshc-tunnels`.

pub mod clock;
pub mod config;
pub mod error;
pub mod instance;
pub mod ip_policy;
pub mod keystore;
pub mod orchestrator;
pub mod rate_limiter;

pub use clock::{Clock, SystemClock};
pub use config::CoreConfig;
pub use error::{ConfigError, CoreError, KeyError};
pub use instance::{Instance, InstanceId};
pub use ip_policy::{IpPolicy, IpPolicyError};
pub use keystore::{Fingerprint, KeyStore};
pub use orchestrator::{MockOrchestrator, Orchestrator, OrchestratorError, SshEndpoint};
pub use rate_limiter::{RateLimitDecision, RateLimitStatus, RateLimiter};
