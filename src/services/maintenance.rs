// Built-in maintenance tasks
// The periodic jobs the collector registers with its scheduler

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::app_config::CollectorConfig;
use crate::db::HitStorage;
use crate::services::memstore::Memstore;
use crate::services::scheduler::{Scheduler, Task};

pub const PERSIST_TASK: &str = "persist_hits";
pub const CYCLE_SESSIONS_TASK: &str = "cycle_sessions";
pub const DATA_RETENTION_TASK: &str = "data_retention";

/// Flush the hit buffer to storage
pub fn persist_task(memstore: Arc<Memstore>, period: Duration) -> Task {
    Task::new(PERSIST_TASK, "persist hits", period, move |_| {
        let memstore = memstore.clone();
        async move {
            memstore.drain_and_persist().await?;
            Ok(())
        }
    })
}

/// Rotate the session salt when due and evict stale sessions
pub fn cycle_sessions_task(memstore: Arc<Memstore>, period: Duration) -> Task {
    Task::new(CYCLE_SESSIONS_TASK, "cycle sessions", period, move |_| {
        let memstore = memstore.clone();
        async move {
            memstore.cycle_sessions(Utc::now());
            Ok(())
        }
    })
}

/// Delete stored hits older than `retention_days`
pub fn data_retention_task(
    storage: Arc<dyn HitStorage>,
    retention_days: u32,
    period: Duration,
) -> Task {
    Task::new(
        DATA_RETENTION_TASK,
        "vacuum pageviews (data retention)",
        period,
        move |_| {
            let storage = storage.clone();
            async move {
                let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
                storage.delete_before(cutoff).await?;
                info!("Removed hits older than {}", cutoff.format("%Y-%m-%d"));
                Ok(())
            }
        },
    )
}

/// Register the collector's task set. Retention is skipped when disabled.
pub fn register_default_tasks(
    scheduler: &Scheduler,
    memstore: &Arc<Memstore>,
    storage: &Arc<dyn HitStorage>,
    config: &CollectorConfig,
) {
    scheduler.register(persist_task(memstore.clone(), config.persist_interval));
    scheduler.register(cycle_sessions_task(
        memstore.clone(),
        config.cycle_sessions_interval,
    ));

    if config.data_retention_days > 0 {
        scheduler.register(data_retention_task(
            storage.clone(),
            config.data_retention_days,
            config.retention_interval,
        ));
    }
}
