// Library exports for the hit collector
// This file exposes modules and functions for library consumers

pub mod app;
pub mod app_config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use app::{router, AppState};
pub use app_config::{AppConfig, CollectorConfig, CONFIG};
pub use db::{ClickHouseClient, HitStorage, MemoryHitStorage, StorageError};
pub use models::{Hit, HitMetadata, RefScheme, SessionId};
pub use services::{
    Memstore, PersistRunner, PersistSignals, SaltStore, Scheduler, SchedulerSettings,
    SchedulerState, SessionAssigner, Task, TaskStats,
};
pub use utils::{Fingerprint, ServiceError};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A wired collector: hit store, scheduler and HTTP state sharing one
/// persist runner and one storage backend
pub struct Collector {
    pub memstore: Arc<Memstore>,
    pub scheduler: Scheduler,
    pub state: AppState,
}

/// Build the collector around `storage` and register its tasks. The
/// scheduler is returned unstarted.
pub fn build_collector(
    config: &CollectorConfig,
    storage: Arc<dyn HitStorage>,
    shutdown: CancellationToken,
) -> Result<Collector, prometheus::Error> {
    let salts = Arc::new(SaltStore::new(config.salt_rotation));
    let assigner = SessionAssigner::new(salts, config.session_window);
    let (runner, signals) = PersistRunner::new();

    let memstore = Arc::new(
        Memstore::new(assigner, storage.clone())
            .with_persist_runner(runner, config.persist_watermark),
    );

    let scheduler = Scheduler::new(
        SchedulerSettings {
            task_timeout: config.task_timeout,
        },
        shutdown,
    )?;
    services::register_default_tasks(&scheduler, &memstore, &storage, config);
    scheduler.with_manual_trigger(services::PERSIST_TASK, signals);

    let state = AppState::new(memstore.clone(), scheduler.registry());

    Ok(Collector {
        memstore,
        scheduler,
        state,
    })
}
