//! sshc-cli: operator CLI for the connectivity core. Boots the same
//! `SshManager` / `TunnelManager` pair a production process would, wired to
//! a `MockOrchestrator` for local smoke-testing rather than a real backend.

pub mod fleet;
pub mod output;
