pub mod backend;
pub mod cron;
pub mod scheduler;
pub mod store;

pub use backend::{FileBackend, MemoryBackend, SqlBackend};
pub use cron::CronError;
pub use scheduler::{
    NoneAdapter, OutputAdapter, ScheduleExecutor, Scheduler, SchedulerOptions,
};
pub use store::{LockToken, ScheduleBackend, ScheduleStore, StoreError};
