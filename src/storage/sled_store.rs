//! Sled-backed record store
//!
//! Trees:
//! - `tasks`: task pk -> bincode `Task`
//! - `projects`: project pk -> bincode `Project`
//! - `active`: project pk -> bincode `Vec<TaskId>` of its `running` tasks
//!
//! The `active` index lets claims read a project's running tasks with plain
//! key lookups, which is all a sled transaction allows.

use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Transactional, Tree};
use tracing::{debug, info};

use super::{
    admit, Claim, ClaimDecision, ConflictFilter, ProjectFilter, ProjectPatch, RecordStore,
    TaskFilter, TaskPatch, TaskQueryOpts, Update,
};
use crate::core::errors::{GuardError, Result};
use crate::model::{Project, Task, TaskId};

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(raw)?)
}

fn abort<T>(err: GuardError) -> ConflictableTransactionResult<T, GuardError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn flatten<T>(result: std::result::Result<T, TransactionError<GuardError>>) -> Result<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => GuardError::database("sled_transaction", err),
    })
}

/// Read a project's active task pks inside a transaction
fn active_pks(
    active: &TransactionalTree,
    project_id: &str,
) -> ConflictableTransactionResult<Vec<TaskId>, GuardError> {
    match active.get(project_id)? {
        Some(raw) => decode(&raw).or_else(abort),
        None => Ok(Vec::new()),
    }
}

fn write_active(
    active: &TransactionalTree,
    project_id: &str,
    pks: &[TaskId],
) -> ConflictableTransactionResult<(), GuardError> {
    if pks.is_empty() {
        active.remove(project_id)?;
    } else {
        let raw = encode(&pks).or_else(abort)?;
        active.insert(project_id, raw)?;
    }
    Ok(())
}

/// Patch one task inside a transaction, keeping the active index in step
fn patch_task_tx(
    tasks: &TransactionalTree,
    active: &TransactionalTree,
    pk: &str,
    patch: &TaskPatch,
) -> ConflictableTransactionResult<Task, GuardError> {
    let raw = match tasks.get(pk)? {
        Some(raw) => raw,
        None => return abort(GuardError::not_found("task", pk)),
    };
    let mut task: Task = decode(&raw).or_else(abort)?;
    let was_active = task.status.is_active();
    if !patch.apply(&mut task) {
        return Ok(task);
    }
    tasks.insert(pk, encode(&task).or_else(abort)?)?;

    if was_active != task.status.is_active() {
        let mut pks = active_pks(active, &task.project_id)?;
        pks.retain(|p| p != pk);
        if task.status.is_active() {
            pks.push(task.pk.clone());
        }
        write_active(active, &task.project_id, &pks)?;
    }
    Ok(task)
}

fn patch_project_tx(
    projects: &TransactionalTree,
    id: &str,
    patch: &ProjectPatch,
) -> ConflictableTransactionResult<Project, GuardError> {
    let raw = match projects.get(id)? {
        Some(raw) => raw,
        None => return abort(GuardError::not_found("project", id)),
    };
    let mut project: Project = decode(&raw).or_else(abort)?;
    patch.apply(&mut project);
    projects.insert(id, encode(&project).or_else(abort)?)?;
    Ok(project)
}

/// Record store persisted in a sled database
pub struct SledStore {
    db: sled::Db,
    tasks: Tree,
    projects: Tree,
    active: Tree,
}

impl SledStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        info!("Opening record store at {:?}", path.as_ref());
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A throwaway database removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            tasks: db.open_tree("tasks")?,
            projects: db.open_tree("projects")?,
            active: db.open_tree("active")?,
            db,
        })
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn scan_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut matching = Vec::new();
        for entry in self.tasks.iter() {
            let (_, raw) = entry?;
            let task: Task = decode(&raw)?;
            if filter.matches(&task) {
                matching.push(task);
            }
        }
        Ok(matching)
    }
}

#[async_trait]
impl RecordStore for SledStore {
    async fn get_task(&self, filter: &TaskFilter) -> Result<Task> {
        if let Some(pk) = &filter.pk {
            let task = match self.tasks.get(pk)? {
                Some(raw) => Some(decode::<Task>(&raw)?),
                None => None,
            };
            return task
                .filter(|t| filter.matches(t))
                .ok_or_else(|| GuardError::not_found("task", filter.describe()));
        }
        self.scan_tasks(filter)?
            .into_iter()
            .next()
            .ok_or_else(|| GuardError::not_found("task", filter.describe()))
    }

    async fn filter_tasks(&self, filter: &TaskFilter, opts: &TaskQueryOpts) -> Result<Vec<Task>> {
        Ok(opts.apply(self.scan_tasks(filter)?))
    }

    async fn get_project(&self, id: &str) -> Result<Project> {
        match self.projects.get(id)? {
            Some(raw) => decode(&raw),
            None => Err(GuardError::not_found("project", id)),
        }
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        self.projects.insert(project.pk.as_str(), encode(project)?)?;
        Ok(())
    }

    async fn filter_projects(&self, filter: &ProjectFilter) -> Result<Vec<Project>> {
        let mut matching = Vec::new();
        for entry in self.projects.iter() {
            let (_, raw) = entry?;
            let project: Project = decode(&raw)?;
            if filter.matches(&project) {
                matching.push(project);
            }
        }
        Ok(matching)
    }

    async fn update_task(&self, pk: &str, patch: TaskPatch) -> Result<Task> {
        flatten((&self.tasks, &self.active).transaction(|(tasks, active)| {
            patch_task_tx(tasks, active, pk, &patch)
        }))
    }

    async fn update_project(&self, id: &str, patch: ProjectPatch) -> Result<Project> {
        flatten(
            self.projects
                .transaction(|projects| patch_project_tx(projects, id, &patch)),
        )
    }

    async fn transaction(&self, updates: Vec<Update>) -> Result<()> {
        flatten(
            (&self.tasks, &self.projects, &self.active).transaction(
                |(tasks, projects, active)| {
                    for update in &updates {
                        match update {
                            Update::Task { pk, patch } => {
                                patch_task_tx(tasks, active, pk, patch)?;
                            }
                            Update::Project { id, patch } => {
                                patch_project_tx(projects, id, patch)?;
                            }
                        }
                    }
                    Ok(())
                },
            ),
        )?;
        debug!("Committed transaction with {} updates", updates.len());
        Ok(())
    }

    async fn claim_task(&self, conflict: &ConflictFilter, candidate: Task) -> Result<Claim> {
        flatten((&self.tasks, &self.active).transaction(|(tasks, active)| {
            let mut pks = active_pks(active, &conflict.project_id)?;
            let mut running = Vec::with_capacity(pks.len());
            for pk in &pks {
                if let Some(raw) = tasks.get(pk.as_str())? {
                    running.push(decode::<Task>(&raw).or_else(abort)?);
                }
            }

            match conflict.resolve(running.iter(), &candidate) {
                ClaimDecision::Conflict(holder) => Ok(Claim::Conflict(holder)),
                ClaimDecision::Reuse(task) => Ok(Claim::Reused(task)),
                ClaimDecision::Insert => {
                    let existing = match tasks.get(candidate.pk.as_str())? {
                        Some(raw) => Some(decode::<Task>(&raw).or_else(abort)?),
                        None => None,
                    };
                    let claim = admit(existing, candidate.clone()).or_else(abort)?;
                    let task = claim.task();
                    tasks.insert(task.pk.as_str(), encode(task).or_else(abort)?)?;
                    if !pks.contains(&task.pk) {
                        pks.push(task.pk.clone());
                    }
                    write_active(active, &conflict.project_id, &pks)?;
                    Ok(claim)
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskStatus, TaskType};

    #[tokio::test]
    async fn test_claim_is_released_by_terminal_status() {
        let store = SledStore::temporary().unwrap();
        let conflict = ConflictFilter::new("p1", vec![TaskType::Reset, TaskType::Analysis]);

        let first = store
            .claim_task(&conflict, Task::new("job-1", "p1", TaskType::Reset))
            .await
            .unwrap();
        assert!(matches!(first, Claim::Created(_)));

        let blocked = store
            .claim_task(&conflict, Task::new("job-2", "p1", TaskType::Analysis))
            .await
            .unwrap();
        assert!(matches!(blocked, Claim::Conflict(ref t) if t.pk == "job-1"));

        store
            .update_task("job-1", TaskPatch::new().status(TaskStatus::Succeeded))
            .await
            .unwrap();

        let second = store
            .claim_task(&conflict, Task::new("job-2", "p1", TaskType::Analysis))
            .await
            .unwrap();
        assert!(matches!(second, Claim::Created(ref t) if t.pk == "job-2"));
    }

    #[tokio::test]
    async fn test_transaction_aborts_as_a_whole() {
        let store = SledStore::temporary().unwrap();
        let mut project = Project::new("p1", "demo");
        project.reset = true;
        store.put_project(&project).await.unwrap();

        let result = store
            .transaction(vec![
                Update::project("p1", ProjectPatch::new().reset(false)),
                Update::project("nope", ProjectPatch::new().reset(false)),
            ])
            .await;

        assert!(matches!(result, Err(GuardError::NotFound { .. })));
        assert!(store.get_project("p1").await.unwrap().reset);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        {
            let store = SledStore::open(&path).unwrap();
            store.put_project(&Project::new("p1", "demo")).await.unwrap();
            store
                .claim_task(
                    &ConflictFilter::new("p1", vec![TaskType::Reset]),
                    Task::new("job-1", "p1", TaskType::Reset),
                )
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        let store = SledStore::open(&path).unwrap();
        assert_eq!(store.get_project("p1").await.unwrap().name, "demo");
        let task = store
            .get_task(&TaskFilter::new().pk("job-1"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_pk_of_another_project_is_refused() {
        let store = SledStore::temporary().unwrap();
        let reset = vec![TaskType::Reset];
        store
            .claim_task(
                &ConflictFilter::new("p2", reset.clone()),
                Task::new("job-1", "p2", TaskType::Reset),
            )
            .await
            .unwrap();

        let err = store
            .claim_task(
                &ConflictFilter::new("p1", reset.clone()),
                Task::new("job-1", "p1", TaskType::Reset),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Configuration { .. }));

        let kept = store.get_task(&TaskFilter::new().pk("job-1")).await.unwrap();
        assert_eq!(kept.project_id, "p2");
        assert_eq!(kept.status, TaskStatus::Running);

        // p2 is still locked by its own job-1
        let second = store
            .claim_task(
                &ConflictFilter::new("p2", reset),
                Task::new("job-2", "p2", TaskType::Reset),
            )
            .await
            .unwrap();
        assert!(matches!(second, Claim::Conflict(ref t) if t.pk == "job-1"));
    }
}
