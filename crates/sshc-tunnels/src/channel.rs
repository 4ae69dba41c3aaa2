//! Logical channel multiplexer: named streams layered over the same SSH
//! session a tunnel already uses, distinguished by a one-line header
//! instead of a second SSH connection.

use std::time::Duration;

use sshc_core::instance::InstanceId;
use sshc_core::error::CoreError;
use sshc_manager::SshManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// The closed set of channel names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelName {
    Gateway,
    Neko,
    Terminal,
    Files,
    Logs,
    Ping,
}

impl ChannelName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelName::Gateway => "gateway",
            ChannelName::Neko => "neko",
            ChannelName::Terminal => "terminal",
            ChannelName::Files => "files",
            ChannelName::Logs => "logs",
            ChannelName::Ping => "ping",
        }
    }
}

/// A live, header-tagged stream. Bytes after the header are opaque to the
/// core; callers drive the protocol appropriate to `name`.
pub type ChannelStream = russh::ChannelStream<russh::client::Msg>;

/// Open a new stream over `instance`'s live session and write the
/// `<name>\n` header. Returns the stream for the caller to read/write.
pub async fn open_channel(
    manager: &SshManager,
    instance: InstanceId,
    name: ChannelName,
) -> Result<ChannelStream, CoreError> {
    let channel = manager.open_session_channel(instance).await?;
    let mut stream = channel.into_stream();
    stream
        .write_all(format!("{}\n", name.as_str()).as_bytes())
        .await
        .map_err(|e| CoreError::NetworkError(e.to_string()))?;
    Ok(stream)
}

/// Open the `ping` channel and run one exact-match round trip: write
/// `ping\n`, require exactly `pong\n` back within `timeout`. Anything else,
/// including a timeout, is an error — the reply must be exactly `pong\n`,
/// not merely prefixed with `pong`.
pub async fn ping(manager: &SshManager, instance: InstanceId, timeout: Duration) -> Result<(), CoreError> {
    let mut stream = open_channel(manager, instance, ChannelName::Ping).await?;

    stream
        .write_all(b"ping\n")
        .await
        .map_err(|e| CoreError::NetworkError(e.to_string()))?;

    let mut reply = [0u8; 5];
    let read = tokio::time::timeout(timeout, stream.read_exact(&mut reply))
        .await
        .map_err(|_| CoreError::Timeout(timeout))?
        .map_err(|e| CoreError::NetworkError(e.to_string()))?;

    if read == 5 && &reply == b"pong\n" {
        Ok(())
    } else {
        Err(CoreError::NetworkError("ping channel did not reply pong\\n".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_match_closed_set() {
        let names = [
            ChannelName::Gateway,
            ChannelName::Neko,
            ChannelName::Terminal,
            ChannelName::Files,
            ChannelName::Logs,
            ChannelName::Ping,
        ]
        .map(|n| n.as_str());
        assert_eq!(names, ["gateway", "neko", "terminal", "files", "logs", "ping"]);
    }
}
