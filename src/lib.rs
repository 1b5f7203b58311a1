//! # Stratus
//!
//! Orchestration engine for a cloud control plane.
//!
//! This crate re-exports the workspace members:
//!
//! - [`core`]: completions, errors, and compensating flow chains
//! - [`scheduler`]: the synchronized task scheduler
//! - [`deploy`]: module deployment and playbook runs
//! - [`monitoring`]: logging setup

#![forbid(unsafe_code)]

pub use stratus_core as core;
pub use stratus_deploy as deploy;
pub use stratus_monitoring as monitoring;
pub use stratus_scheduler as scheduler;

pub use stratus_core::{Completion, CoreError, Flow, FlowChain, FlowContext, FlowTrigger};
pub use stratus_scheduler::{SchedulerConfig, SyncTask, SyncTaskScheduler, TaskSpec};
