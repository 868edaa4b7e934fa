// Services module for the hit collector
// Session assignment, hit buffering and the background scheduler

pub mod maintenance;
pub mod memstore;
pub mod persist_runner;
pub mod salt;
pub mod scheduler;
pub mod session;

// Re-export commonly used services
pub use maintenance::{
    register_default_tasks, CYCLE_SESSIONS_TASK, DATA_RETENTION_TASK, PERSIST_TASK,
};
pub use memstore::Memstore;
pub use persist_runner::{PersistRunner, PersistSignals};
pub use salt::{Salt, SaltStore};
pub use scheduler::{
    RunContext, Scheduler, SchedulerSettings, SchedulerState, Task, TaskStats, Trigger,
};
pub use session::{SessionAssigner, SessionIndex};
