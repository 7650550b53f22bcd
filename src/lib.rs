//! Per-project exclusive task execution with persistent task logs.
//!
//! A task claims its project through [`guard::ExclusiveTask`], runs under a
//! [`logger::TaskLogger`] that keeps a log file and heartbeat, and leaves a
//! terminal status behind. The [`reset`] workflow and [`worker`] build the
//! project reset job on top of those pieces.

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod hooks;
}

pub mod model;
pub mod storage;

pub mod guard;
pub mod logger;
pub mod query;
pub mod recovery;
pub mod reset;
pub mod worker;

// Re-exports for convenience
pub use core::config::{GuardConfig, GuardConfigBuilder};
pub use core::errors::{GuardError, Result};
pub use core::hooks::{hook_fn, HookRegistry, ProjectHook, PROJECT_RESET_AFTER, PROJECT_RESET_BEFORE};
pub use guard::{Acquisition, ActiveTask, ExclusiveTask, LockConflict};
pub use logger::{read_from, TaskLog, TaskLogger};
pub use model::{
    AnalysisPriority, LastReset, Project, ProjectId, ResetStatus, Task, TaskId, TaskStatus,
    TaskType,
};
pub use query::{Pagination, TaskDetails, TaskLogView, TaskQuery};
pub use recovery::{ReapStats, StaleTaskReaper};
pub use reset::{ResetCommand, ResetContext, ResetOutcome, ResetWorkflow};
pub use storage::{MemoryStore, RecordStore, SledStore};
pub use worker::{JobHandle, ResetWorker};
