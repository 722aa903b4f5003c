//! 守卫窗口清理与访问计数刷盘的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{COUNTER_SYNC_INTERVAL_SECS, GUARD_PRUNE_INTERVAL_SECS};
use crate::counter::PersistentCounter;
use crate::guard::RateGuard;

/// 启动后台任务（守卫窗口清理与计数器刷盘）。
pub fn spawn_background_tasks(guard: Arc<RateGuard>, counter: Arc<PersistentCounter>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(GUARD_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let removed = guard.prune_idle().await;
            if removed > 0 {
                let remaining = guard.tracked_clients().await;
                debug!(removed, remaining, "pruned idle client windows");
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(COUNTER_SYNC_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = counter.flush() {
                warn!(error = %err, "visit counter flush failed");
            }
        }
    });
}
