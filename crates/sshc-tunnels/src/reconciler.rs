//! Background reconciler: keeps the live session/tunnel set in sync with
//! what the orchestrator collaborator currently reports as running.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sshc_core::instance::InstanceId;

use crate::manager::TunnelManager;

/// Reconciler iteration's hard cap: cancelled and retried next
/// tick rather than allowed to run forever.
const ITERATION_HARD_CAP: Duration = Duration::from_secs(5 * 60);

pub async fn run(manager: Arc<TunnelManager>, base_interval: Duration) {
    loop {
        let jittered = jitter(base_interval);
        tokio::time::sleep(jittered).await;

        let result = tokio::time::timeout(ITERATION_HARD_CAP, reconcile_once(&manager)).await;
        if result.is_err() {
            tracing::warn!("reconciler iteration exceeded its hard cap, moving on");
        }
    }
}

async fn reconcile_once(manager: &Arc<TunnelManager>) {
    let running = match manager.orchestrator.list_running().await {
        Ok(list) => list,
        Err(e) => {
            // Log and skip; keep existing sessions alive rather than
            // treating an error as "none running".
            tracing::warn!(error = %e, "reconciler: list_running failed, skipping iteration");
            return;
        }
    };

    let known = manager.ssh.list_instances().await;

    let mut handles = Vec::with_capacity(running.len());
    for instance in running.clone() {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let _permit = manager.fanout.acquire().await.expect("fanout semaphore is never closed");
            reconcile_instance(&manager, instance).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    let stale: Vec<InstanceId> = known.into_iter().filter(|id| !running.contains(id)).collect();
    let mut handles = Vec::with_capacity(stale.len());
    for instance in stale {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let _permit = manager.fanout.acquire().await.expect("fanout semaphore is never closed");
            if let Err(e) = manager.close_instance(instance).await {
                tracing::warn!(instance_id = %instance, error = %e, "reconciler: failed to close stale session");
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn reconcile_instance(manager: &Arc<TunnelManager>, instance: InstanceId) {
    let connected = manager
        .ssh
        .session(instance)
        .await
        .map(|s| s.is_connected())
        .unwrap_or(false);

    if !connected {
        if let Err(e) = manager.ensure_connected(instance).await {
            tracing::warn!(instance_id = %instance, error = %e, "reconciler: ensure_connected failed");
            return;
        }
    }

    if let Err(e) = manager.start_tunnels_for_instance(instance).await {
        tracing::warn!(instance_id = %instance, error = %e, "reconciler: start_tunnels_for_instance failed");
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}
