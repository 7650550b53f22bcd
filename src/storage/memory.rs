//! In-process record store
//!
//! A single `RwLock` guards both maps so that claims and transaction batches
//! are observed all-or-nothing by concurrent readers.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use super::{
    admit, Claim, ClaimDecision, ConflictFilter, ProjectFilter, ProjectPatch, RecordStore, TaskFilter,
    TaskPatch, TaskQueryOpts, Update,
};
use crate::core::errors::{GuardError, Result};
use crate::model::{Project, ProjectId, Task, TaskId};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    tasks: HashMap<TaskId, Task>,
    projects: HashMap<ProjectId, Project>,
}

impl MemoryState {
    fn patch_task(&mut self, pk: &str, patch: &TaskPatch) -> Result<Task> {
        let task = self
            .tasks
            .get_mut(pk)
            .ok_or_else(|| GuardError::not_found("task", pk))?;
        if !patch.apply(task) {
            trace!("Skipped patch of task {} in status {}", pk, task.status);
        }
        Ok(task.clone())
    }

    fn patch_project(&mut self, id: &str, patch: &ProjectPatch) -> Result<Project> {
        let project = self
            .projects
            .get_mut(id)
            .ok_or_else(|| GuardError::not_found("project", id))?;
        patch.apply(project);
        Ok(project.clone())
    }
}

/// Record store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task record as-is, bypassing the claim protocol
    pub async fn insert_task(&self, task: Task) {
        self.state.write().await.tasks.insert(task.pk.clone(), task);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_task(&self, filter: &TaskFilter) -> Result<Task> {
        let state = self.state.read().await;
        if let Some(pk) = &filter.pk {
            return state
                .tasks
                .get(pk)
                .filter(|t| filter.matches(t))
                .cloned()
                .ok_or_else(|| GuardError::not_found("task", filter.describe()));
        }
        state
            .tasks
            .values()
            .find(|t| filter.matches(t))
            .cloned()
            .ok_or_else(|| GuardError::not_found("task", filter.describe()))
    }

    async fn filter_tasks(&self, filter: &TaskFilter, opts: &TaskQueryOpts) -> Result<Vec<Task>> {
        let state = self.state.read().await;
        let matching = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        Ok(opts.apply(matching))
    }

    async fn get_project(&self, id: &str) -> Result<Project> {
        self.state
            .read()
            .await
            .projects
            .get(id)
            .cloned()
            .ok_or_else(|| GuardError::not_found("project", id))
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        self.state
            .write()
            .await
            .projects
            .insert(project.pk.clone(), project.clone());
        Ok(())
    }

    async fn filter_projects(&self, filter: &ProjectFilter) -> Result<Vec<Project>> {
        let state = self.state.read().await;
        let mut projects: Vec<Project> = state
            .projects
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.pk.cmp(&b.pk));
        Ok(projects)
    }

    async fn update_task(&self, pk: &str, patch: TaskPatch) -> Result<Task> {
        self.state.write().await.patch_task(pk, &patch)
    }

    async fn update_project(&self, id: &str, patch: ProjectPatch) -> Result<Project> {
        self.state.write().await.patch_project(id, &patch)
    }

    async fn transaction(&self, updates: Vec<Update>) -> Result<()> {
        let mut state = self.state.write().await;
        // Work on a copy so a failing update leaves nothing behind
        let mut staged = state.clone();
        for update in &updates {
            match update {
                Update::Task { pk, patch } => {
                    staged.patch_task(pk, patch)?;
                }
                Update::Project { id, patch } => {
                    staged.patch_project(id, patch)?;
                }
            }
        }
        *state = staged;
        trace!("Committed transaction with {} updates", updates.len());
        Ok(())
    }

    async fn claim_task(&self, conflict: &ConflictFilter, candidate: Task) -> Result<Claim> {
        let mut state = self.state.write().await;
        let active = state
            .tasks
            .values()
            .filter(|t| t.project_id == conflict.project_id);

        match conflict.resolve(active, &candidate) {
            ClaimDecision::Conflict(holder) => Ok(Claim::Conflict(holder)),
            ClaimDecision::Reuse(task) => Ok(Claim::Reused(task)),
            ClaimDecision::Insert => {
                let claim = admit(state.tasks.get(&candidate.pk).cloned(), candidate)?;
                let task = claim.task().clone();
                state.tasks.insert(task.pk.clone(), task);
                Ok(claim)
            }
        }
    }
}
