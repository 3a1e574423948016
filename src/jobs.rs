//! Periodic maintenance: session sweep, expired reminder cleanup and idle
//! model unload.

use chrono::{Local, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::assistant::{Assistant, ChatQueue};
use crate::config::FemtoConfig;
use crate::schedule::Scheduler;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Evict idle sessions and stop their chat workers. Terminal sessions are
/// autosaved every turn, so eviction never writes to disk.
pub async fn sweep_sessions(
    assistant: &Assistant,
    inactivity: chrono::Duration,
    queue: Option<&ChatQueue>,
) -> usize {
    let evicted = assistant.sessions().sweep_inactive(inactivity, Utc::now()).await;
    if let Some(queue) = queue {
        for snapshot in &evicted {
            queue.forget(&snapshot.chat_id);
        }
    }
    evicted.len()
}

pub async fn cleanup_schedule(scheduler: &dyn Scheduler) -> usize {
    match scheduler.cleanup_expired(Local::now().naive_local()).await {
        Ok(removed) => {
            if removed > 0 {
                info!(removed, "expired reminders removed");
            }
            removed
        }
        Err(e) => {
            warn!(error = %e, "reminder cleanup failed");
            0
        }
    }
}

/// Start every periodic job. Dropping or aborting the returned set stops them.
pub fn spawn_all(
    config: &FemtoConfig,
    assistant: Arc<Assistant>,
    scheduler: Arc<dyn Scheduler>,
    queue: Option<Arc<ChatQueue>>,
) -> JoinSet<()> {
    let mut set = JoinSet::new();
    let inactivity = chrono::Duration::hours(config.session.inactivity_hours as i64);
    let idle_after = Duration::from_secs(config.model.idle_unload_minutes * 60);

    let sweeper = Arc::clone(&assistant);
    set.spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = sweep_sessions(&sweeper, inactivity, queue.as_deref()).await;
            debug!(evicted, "session sweep done");
        }
    });

    set.spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            cleanup_schedule(scheduler.as_ref()).await;
        }
    });

    if config.model.idle_unload_minutes > 0 {
        set.spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if assistant.unload_if_idle(idle_after).await {
                    info!(idle_minutes = idle_after.as_secs() / 60, "model unloaded after inactivity");
                }
            }
        });
    }

    set
}
