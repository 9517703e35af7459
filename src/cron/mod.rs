//! Generic job scheduling primitive, shared by the monitor loop, alert
//! evaluator, timeseries cleanup, and notifier retry worker. Each of those
//! owns its own `Scheduler` and registers its own jobs rather than going
//! through a central registry.

mod scheduler;

pub use scheduler::{Job, JobHandle, JobStats, Scheduler, SchedulerError};
