//!
//! Stratus Scheduler - signature-serialized task execution
//!
//! Tasks carry a signature (the serialization domain, such as a target
//! host) and a level. At most one task body per signature runs at a time;
//! tasks with different signatures share a bounded worker pool.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Scheduler configuration
pub mod config;

/// The scheduler itself
pub mod scheduler;

/// Task contract and builder
pub mod task;

pub use config::SchedulerConfig;
pub use scheduler::{SchedulerStats, SyncTaskScheduler};
pub use task::{BodyTask, SyncTask, TaskSpec};
