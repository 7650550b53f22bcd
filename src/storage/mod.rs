//! Record store for tasks and projects
//!
//! The guard, logger and reset workflow only talk to the [`RecordStore`]
//! trait. Exclusivity is decided by [`RecordStore::claim_task`], which every
//! implementation must run atomically against concurrent claims.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::errors::{GuardError, Result};
use crate::model::{
    AnalysisPriority, LastReset, Project, ProjectId, Task, TaskId, TaskStatus, TaskType,
};

/// Storage trait for task and project persistence
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Get the single task matching `filter`, or `NotFound`
    async fn get_task(&self, filter: &TaskFilter) -> Result<Task>;

    /// List tasks matching `filter`, sorted and sliced by `opts`
    async fn filter_tasks(&self, filter: &TaskFilter, opts: &TaskQueryOpts) -> Result<Vec<Task>>;

    /// Get a project by primary key, or `NotFound`
    async fn get_project(&self, id: &str) -> Result<Project>;

    /// Insert or replace a project
    async fn put_project(&self, project: &Project) -> Result<()>;

    async fn filter_projects(&self, filter: &ProjectFilter) -> Result<Vec<Project>>;

    /// Apply a patch to one task; `updated_at` is bumped by the store
    async fn update_task(&self, pk: &str, patch: TaskPatch) -> Result<Task>;

    /// Apply a patch to one project
    async fn update_project(&self, id: &str, patch: ProjectPatch) -> Result<Project>;

    /// Apply all updates or none of them
    async fn transaction(&self, updates: Vec<Update>) -> Result<()>;

    /// Atomically create (or reuse) `candidate` unless another active task
    /// matching `conflict` exists for the project. Fails with
    /// `GuardError::Configuration` when the pk belongs to another project.
    async fn claim_task(&self, conflict: &ConflictFilter, candidate: Task) -> Result<Claim>;
}

/// Result of a compare-and-set task claim
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// No conflicting task existed; the candidate was inserted
    Created(Task),
    /// The candidate's own pk was already active and is reused as-is
    Reused(Task),
    /// Another active task holds the project
    Conflict(Task),
}

/// Active tasks of one project whose type falls in a conflicting set
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictFilter {
    pub project_id: ProjectId,
    pub types: Vec<TaskType>,
}

impl ConflictFilter {
    pub fn new(project_id: impl Into<ProjectId>, types: Vec<TaskType>) -> Self {
        Self {
            project_id: project_id.into(),
            types,
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        task.project_id == self.project_id
            && self.types.contains(&task.task_type)
            && task.status.is_active()
    }

    /// Decide the claim outcome given the project's currently active tasks
    pub(crate) fn resolve<'a, I>(&self, active: I, candidate: &Task) -> ClaimDecision
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let mut own = None;
        for task in active {
            if !self.matches(task) {
                continue;
            }
            if task.pk == candidate.pk {
                own = Some(task.clone());
            } else {
                return ClaimDecision::Conflict(task.clone());
            }
        }
        match own {
            Some(task) => ClaimDecision::Reuse(task),
            None => ClaimDecision::Insert,
        }
    }
}

pub(crate) enum ClaimDecision {
    Insert,
    Reuse(Task),
    Conflict(Task),
}

/// Record to write for an uncontested claim.
///
/// A finished record with the same pk on the same project is brought back to
/// `running` as a fresh attempt: `created_at` restarts and the old heartbeat
/// is dropped, while `log_path` is kept so the log keeps growing. A pk that
/// belongs to another project is refused; its record is never overwritten.
pub(crate) fn admit(existing: Option<Task>, candidate: Task) -> Result<Claim> {
    match existing {
        None => Ok(Claim::Created(candidate)),
        Some(task) if task.project_id != candidate.project_id => {
            Err(GuardError::configuration_field(
                format!(
                    "task id {} is already used by project {}",
                    task.pk, task.project_id
                ),
                "task_id",
            ))
        }
        Some(mut task) => {
            let now = Utc::now();
            task.status = TaskStatus::Running;
            task.task_type = candidate.task_type;
            task.created_at = now;
            task.updated_at = now;
            task.last_ping = None;
            Ok(Claim::Reused(task))
        }
    }
}

impl Claim {
    /// The record that the store now holds for this claim
    pub fn task(&self) -> &Task {
        match self {
            Claim::Created(task) | Claim::Reused(task) | Claim::Conflict(task) => task,
        }
    }
}

/// Equality/membership filter over task records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub pk: Option<TaskId>,
    pub project_id: Option<ProjectId>,
    pub types: Option<Vec<TaskType>>,
    pub statuses: Option<Vec<TaskStatus>>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pk(mut self, pk: impl Into<TaskId>) -> Self {
        self.pk = Some(pk.into());
        self
    }

    pub fn project(mut self, project_id: impl Into<ProjectId>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn types(mut self, types: Vec<TaskType>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn statuses(mut self, statuses: Vec<TaskStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.pk.as_ref().map_or(true, |pk| &task.pk == pk)
            && self
                .project_id
                .as_ref()
                .map_or(true, |p| &task.project_id == p)
            && self
                .types
                .as_ref()
                .map_or(true, |t| t.contains(&task.task_type))
            && self
                .statuses
                .as_ref()
                .map_or(true, |s| s.contains(&task.status))
    }

    /// Human-readable id for not-found errors
    pub(crate) fn describe(&self) -> String {
        match (&self.pk, &self.project_id) {
            (Some(pk), Some(project)) => format!("{} (project {})", pk, project),
            (Some(pk), None) => pk.clone(),
            (None, Some(project)) => format!("project {}", project),
            (None, None) => "<any>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    CreatedAtAsc,
    #[default]
    CreatedAtDesc,
}

/// Sort and slice options for task listings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQueryOpts {
    pub sort: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl TaskQueryOpts {
    pub fn page(offset: usize, limit: usize) -> Self {
        Self {
            sort: SortOrder::CreatedAtDesc,
            offset,
            limit: Some(limit),
        }
    }

    /// Sort then slice a task list in place of a database cursor
    pub(crate) fn apply(&self, mut tasks: Vec<Task>) -> Vec<Task> {
        match self.sort {
            SortOrder::CreatedAtAsc => tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            SortOrder::CreatedAtDesc => tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        }
        let iter = tasks.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectFilter {
    pub reset_pending: Option<bool>,
}

impl ProjectFilter {
    pub fn reset_pending() -> Self {
        Self {
            reset_pending: Some(true),
        }
    }

    pub fn matches(&self, project: &Project) -> bool {
        self.reset_pending.map_or(true, |r| project.reset == r)
    }
}

/// Task fields that may be removed by a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskField {
    LastPing,
    LogPath,
}

/// Partial update of a task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub last_ping: Option<DateTime<Utc>>,
    pub log_path: Option<String>,
    pub unset: Vec<TaskField>,
    /// Apply only while the stored task has this status
    pub only_if: Option<TaskStatus>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn last_ping(mut self, at: DateTime<Utc>) -> Self {
        self.last_ping = Some(at);
        self
    }

    pub fn log_path(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn unset(mut self, field: TaskField) -> Self {
        self.unset.push(field);
        self
    }

    /// Make the patch conditional on the task's current status
    pub fn only_if_status(mut self, status: TaskStatus) -> Self {
        self.only_if = Some(status);
        self
    }

    /// Apply the patch, returning false (and leaving `task` untouched) when
    /// the status precondition does not hold
    pub fn apply(&self, task: &mut Task) -> bool {
        if self.only_if.map_or(false, |expected| task.status != expected) {
            return false;
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(at) = self.last_ping {
            task.last_ping = Some(at);
        }
        if let Some(path) = &self.log_path {
            task.log_path = Some(path.clone());
        }
        for field in &self.unset {
            match field {
                TaskField::LastPing => task.last_ping = None,
                TaskField::LogPath => task.log_path = None,
            }
        }
        task.updated_at = Utc::now();
        true
    }
}

/// Project fields that may be removed by a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectField {
    ResetRequestedAt,
    LastReset,
    AnalysisRequestedAt,
    FirstAnalysisEmailSent,
}

/// Partial update of a project
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPatch {
    pub reset: Option<bool>,
    pub reset_requested_at: Option<DateTime<Utc>>,
    pub last_reset: Option<LastReset>,
    pub analyze: Option<bool>,
    pub analysis_priority: Option<AnalysisPriority>,
    pub analysis_requested_at: Option<DateTime<Utc>>,
    pub unset: Vec<ProjectField>,
}

impl ProjectPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = Some(reset);
        self
    }

    pub fn reset_requested_at(mut self, at: DateTime<Utc>) -> Self {
        self.reset_requested_at = Some(at);
        self
    }

    pub fn last_reset(mut self, last_reset: LastReset) -> Self {
        self.last_reset = Some(last_reset);
        self
    }

    pub fn analyze(mut self, analyze: bool) -> Self {
        self.analyze = Some(analyze);
        self
    }

    pub fn analysis_priority(mut self, priority: AnalysisPriority) -> Self {
        self.analysis_priority = Some(priority);
        self
    }

    pub fn analysis_requested_at(mut self, at: DateTime<Utc>) -> Self {
        self.analysis_requested_at = Some(at);
        self
    }

    pub fn unset(mut self, field: ProjectField) -> Self {
        self.unset.push(field);
        self
    }

    pub fn apply(&self, project: &mut Project) {
        if let Some(reset) = self.reset {
            project.reset = reset;
        }
        if let Some(at) = self.reset_requested_at {
            project.reset_requested_at = Some(at);
        }
        if let Some(last_reset) = &self.last_reset {
            project.last_reset = Some(last_reset.clone());
        }
        if let Some(analyze) = self.analyze {
            project.analyze = analyze;
        }
        if let Some(priority) = self.analysis_priority {
            project.analysis_priority = priority;
        }
        if let Some(at) = self.analysis_requested_at {
            project.analysis_requested_at = Some(at);
        }
        for field in &self.unset {
            match field {
                ProjectField::ResetRequestedAt => project.reset_requested_at = None,
                ProjectField::LastReset => project.last_reset = None,
                ProjectField::AnalysisRequestedAt => project.analysis_requested_at = None,
                ProjectField::FirstAnalysisEmailSent => project.first_analysis_email_sent = None,
            }
        }
    }
}

/// One write inside a [`RecordStore::transaction`] batch
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Task { pk: TaskId, patch: TaskPatch },
    Project { id: ProjectId, patch: ProjectPatch },
}

impl Update {
    pub fn task(pk: impl Into<TaskId>, patch: TaskPatch) -> Self {
        Update::Task {
            pk: pk.into(),
            patch,
        }
    }

    pub fn project(id: impl Into<ProjectId>, patch: ProjectPatch) -> Self {
        Update::Project {
            id: id.into(),
            patch,
        }
    }
}
