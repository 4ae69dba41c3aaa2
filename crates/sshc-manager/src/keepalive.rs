//! Per-session keepalive worker.
//!
//! `russh`'s client handle exposes channel operations but no raw
//! `keepalive@openssh.com` global-request primitive, so liveness is probed
//! by opening a session channel and immediately closing it under a bounded
//! reply timeout — the same round-trip guarantee a wire-level keepalive
//! would give, without relying on an unexposed message type.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::event::EventType;
use crate::manager::SshManager;
use crate::session::Session;

pub enum KeepaliveOutcome {
    Ok,
    Missed,
    Closed,
}

async fn probe(session: &Session, reply_timeout: Duration) -> KeepaliveOutcome {
    let mut guard = session.handle.lock().await;
    let Some(handle) = guard.as_mut() else {
        return KeepaliveOutcome::Closed;
    };

    match tokio::time::timeout(reply_timeout, handle.channel_open_session()).await {
        Ok(Ok(channel)) => {
            let _ = channel.close().await;
            KeepaliveOutcome::Ok
        }
        Ok(Err(_)) => KeepaliveOutcome::Closed,
        Err(_) => KeepaliveOutcome::Missed,
    }
}

/// Run the keepalive loop until `miss_max` consecutive misses or
/// cancellation. Returns `true` if the caller should trigger a reconnect
/// (i.e. the loop ended due to exhausted misses, not cancellation).
pub async fn run(
    manager: Arc<SshManager>,
    session: Arc<Session>,
    interval: Duration,
    reply_timeout: Duration,
    miss_max: u32,
    cancel: CancellationToken,
) -> bool {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_misses = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.inner.lock().keepalive.sent += 1;
                match probe(&session, reply_timeout).await {
                    KeepaliveOutcome::Ok => {
                        consecutive_misses = 0;
                        session.inner.lock().keepalive.ok += 1;
                    }
                    KeepaliveOutcome::Missed => {
                        consecutive_misses += 1;
                        session.inner.lock().keepalive.missed += 1;
                        tracing::warn!(
                            instance_id = %session.instance_id,
                            consecutive_misses,
                            "keepalive miss"
                        );
                        manager.emit(
                            &session,
                            EventType::HealthCheckFailed,
                            Some(format!("{consecutive_misses} consecutive misses")),
                        );
                        if consecutive_misses >= miss_max {
                            return true;
                        }
                    }
                    KeepaliveOutcome::Closed => return true,
                }
            }
            _ = cancel.cancelled() => return false,
        }
    }
}
