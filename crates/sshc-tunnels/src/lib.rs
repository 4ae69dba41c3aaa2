//! sshc-tunnels: the multiplexed stream layer over a live SSH session
//! (component C5). Reverse tunnels for configured service ports, a named
//! logical channel multiplexer, per-tunnel health checks, and the fleet
//! reconciler all live here, driven by `sshc-manager`'s event stream rather
//! than by owning it directly.

pub mod channel;
pub mod manager;
pub mod reconciler;
pub mod splice;
pub mod tunnel;

pub use channel::{open_channel, ping, ChannelName, ChannelStream};
pub use manager::TunnelManager;
pub use tunnel::{Tunnel, TunnelHealth, TunnelKind, TunnelState, TunnelStatus};
