//! Per-pool background monitor.
//!
//! One long-lived task per pool. Each tick takes the pool's scaling lock
//! non-blocking (an API-triggered pass already holding it means the tick
//! is simply skipped) and otherwise runs one reconciliation pass. The
//! task holds only a `Weak` reference to the manager so a dropped manager
//! ends its monitors instead of being kept alive by them.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::PoolManager;

pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub(super) fn spawn(
        manager: Weak<PoolManager>,
        pool: String,
        grace: Duration,
        interval: Duration,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(monitor_loop(manager, pool, stop_rx, grace, interval));
        Self { stop, task }
    }

    /// Signal the task to stop and wait for it, bounded. A task that does
    /// not exit in time is detached; it observes the signal at its next
    /// wait point.
    pub(super) async fn stop(self, timeout: Duration) {
        let _ = self.stop.send(true);
        if tokio::time::timeout(timeout, self.task).await.is_err() {
            warn!("pool monitor did not exit within {:?}, detaching", timeout);
        }
    }
}

async fn monitor_loop(
    manager: Weak<PoolManager>,
    pool: String,
    mut stop: watch::Receiver<bool>,
    grace: Duration,
    interval: Duration,
) {
    info!(pool = %pool, "pool monitor started");

    // Initial grace period so the creation-time pass can settle first.
    tokio::select! {
        _ = stop.changed() => {
            info!(pool = %pool, "pool monitor stopped before first pass");
            return;
        }
        _ = tokio::time::sleep(grace) => {}
    }

    loop {
        let Some(mgr) = manager.upgrade() else { break };
        let pool_alive = mgr.monitor_tick(&pool).await;
        drop(mgr);
        if !pool_alive {
            break;
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!(pool = %pool, "pool monitor stopped");
}
