//! Exclusive task guard
//!
//! At most one task of a conflicting type may be `running` per project. The
//! guard claims a task record through [`RecordStore::claim_task`], so the
//! exclusion holds across workers and processes sharing the store, not just
//! within this process.
//!
//! ```text
//! ATTEMPTING -> ACQUIRED -> COMPLETED | FAILED
//! ATTEMPTING -> BLOCKED
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::core::config::GuardConfig;
use crate::core::errors::{GuardError, Result};
use crate::model::{validate_task_id, ProjectId, Task, TaskId, TaskStatus, TaskType};
use crate::storage::{Claim, ConflictFilter, RecordStore, TaskFilter, TaskPatch};

/// Another task holds the project
#[derive(Debug, Clone)]
pub struct LockConflict {
    pub project_id: ProjectId,
    pub holder: Task,
}

impl LockConflict {
    pub fn into_error(self) -> GuardError {
        GuardError::lock(self.project_id, self.holder.pk)
    }
}

/// Outcome of a lock attempt
pub enum Acquisition {
    Acquired(ActiveTask),
    Blocked(LockConflict),
    Failed(GuardError),
}

impl Acquisition {
    /// Collapse into a `Result`, turning contention into `GuardError::Lock`
    pub fn into_result(self) -> Result<ActiveTask> {
        match self {
            Acquisition::Acquired(active) => Ok(active),
            Acquisition::Blocked(conflict) => Err(conflict.into_error()),
            Acquisition::Failed(err) => Err(err),
        }
    }
}

/// A lock request for one task on one project
pub struct ExclusiveTask {
    store: Arc<dyn RecordStore>,
    conflict: ConflictFilter,
    task_type: TaskType,
    task_id: TaskId,
}

impl ExclusiveTask {
    /// `task_id` is the idempotency key: a retry under the same id reuses the
    /// record instead of blocking on itself
    pub fn new(
        store: Arc<dyn RecordStore>,
        conflict: ConflictFilter,
        task_type: TaskType,
        task_id: impl Into<TaskId>,
    ) -> Self {
        Self {
            store,
            conflict,
            task_type,
            task_id: task_id.into(),
        }
    }

    /// Conflict on the configured conflicting task types of `project_id`
    pub fn for_project(
        store: Arc<dyn RecordStore>,
        config: &GuardConfig,
        project_id: impl Into<ProjectId>,
        task_type: TaskType,
        task_id: impl Into<TaskId>,
    ) -> Self {
        let conflict = ConflictFilter::new(project_id, config.conflicting_types.clone());
        Self::new(store, conflict, task_type, task_id)
    }

    pub async fn acquire(self) -> Acquisition {
        if let Err(e) = validate_task_id(&self.task_id) {
            return Acquisition::Failed(e);
        }
        let project_id = self.conflict.project_id.clone();
        let candidate = Task::new(self.task_id.clone(), project_id.clone(), self.task_type);

        let claim = self.store.claim_task(&self.conflict, candidate).await;
        match claim {
            Ok(Claim::Created(task)) => {
                info!(
                    "Acquired {} lock on project {} as task {}",
                    task.task_type, project_id, task.pk
                );
                Acquisition::Acquired(ActiveTask::new(self.store, task, false))
            }
            Ok(Claim::Reused(task)) => {
                info!(
                    "Reusing task {} for {} lock on project {}",
                    task.pk, task.task_type, project_id
                );
                Acquisition::Acquired(ActiveTask::new(self.store, task, true))
            }
            Ok(Claim::Conflict(holder)) => {
                info!(
                    "Project {} is locked by {} task {}, not starting {}",
                    project_id, holder.task_type, holder.pk, self.task_id
                );
                Acquisition::Blocked(LockConflict { project_id, holder })
            }
            Err(e) => {
                error!("Lock attempt on project {} failed: {}", project_id, e);
                Acquisition::Failed(e)
            }
        }
    }
}

/// A claimed task. Run its body with [`ActiveTask::run`].
pub struct ActiveTask {
    store: Arc<dyn RecordStore>,
    task: Task,
    reused: bool,
}

impl ActiveTask {
    fn new(store: Arc<dyn RecordStore>, task: Task, reused: bool) -> Self {
        Self {
            store,
            task,
            reused,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// True when the claim picked up an existing record with the same id
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    /// Run `body` while holding the lock.
    ///
    /// Finalize always runs, including when the body panics (the panic is
    /// resumed afterwards). Errors from the body are returned unchanged.
    pub async fn run<F, Fut, T>(self, body: F) -> Result<T>
    where
        F: FnOnce(Task) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let task = self.task.clone();
        let outcome = AssertUnwindSafe(async move { body(task).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                self.finalize(false).await;
                Ok(value)
            }
            Ok(Err(err)) => {
                debug!("Task {} body failed: {}", self.task.pk, err);
                self.finalize(true).await;
                Err(err)
            }
            Err(panic) => {
                error!("Task {} body panicked", self.task.pk);
                self.finalize(true).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Lock lifecycle only: a failed body that left its record `running` is
    /// marked `failed`, which releases the project.
    async fn finalize(&self, failed: bool) {
        let current = match self
            .store
            .get_task(&TaskFilter::new().pk(self.task.pk.clone()))
            .await
        {
            Ok(task) => task,
            Err(e) => {
                error!("Could not reload task {} on release: {}", self.task.pk, e);
                return;
            }
        };

        if !current.status.is_active() {
            debug!(
                "Released lock of task {} ({})",
                current.pk, current.status
            );
            return;
        }

        if failed {
            match self
                .store
                .update_task(
                    &current.pk,
                    TaskPatch::new()
                        .status(TaskStatus::Failed)
                        .only_if_status(TaskStatus::Running),
                )
                .await
            {
                Ok(_) => info!("Released lock of failed task {}", current.pk),
                Err(e) => error!("Could not release lock of task {}: {}", current.pk, e),
            }
        } else {
            warn!(
                "Task {} finished without committing a terminal status; project {} stays locked",
                current.pk, current.project_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, SledStore, TaskQueryOpts};

    fn store() -> Arc<dyn RecordStore> {
        Arc::new(MemoryStore::new())
    }

    fn reset_guard(store: &Arc<dyn RecordStore>, task_id: &str) -> ExclusiveTask {
        ExclusiveTask::for_project(
            store.clone(),
            &GuardConfig::default(),
            "p1",
            TaskType::Reset,
            task_id,
        )
    }

    #[tokio::test]
    async fn test_second_claim_is_blocked() {
        let store = store();
        let first = reset_guard(&store, "job-1").acquire().await.into_result().unwrap();
        assert_eq!(first.task().status, TaskStatus::Running);

        match reset_guard(&store, "job-2").acquire().await {
            Acquisition::Blocked(conflict) => assert_eq!(conflict.holder.pk, "job-1"),
            _ => panic!("expected blocked"),
        }

        let err = reset_guard(&store, "job-3").acquire().await.into_result().err().unwrap();
        assert!(err.is_lock());
    }

    #[tokio::test]
    async fn test_failed_body_releases_lock() {
        let store = store();
        let active = reset_guard(&store, "job-1").acquire().await.into_result().unwrap();

        let result: Result<()> = active
            .run(|_| async { Err(GuardError::execution("test", "boom")) })
            .await;
        assert!(matches!(result, Err(GuardError::Execution { .. })));

        let task = store.get_task(&TaskFilter::new().pk("job-1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(matches!(
            reset_guard(&store, "job-2").acquire().await,
            Acquisition::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn test_successful_body_keeps_its_own_status() {
        let store = store();
        let active = reset_guard(&store, "job-1").acquire().await.into_result().unwrap();

        let body_store = store.clone();
        let value = active
            .run(|task| async move {
                body_store
                    .update_task(&task.pk, TaskPatch::new().status(TaskStatus::Succeeded))
                    .await?;
                Ok(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        let task = store.get_task(&TaskFilter::new().pk("job-1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_panicking_body_still_finalizes() {
        let store = store();
        let active = reset_guard(&store, "job-1").acquire().await.into_result().unwrap();

        let joined = tokio::spawn(async move {
            let _: Result<()> = active
                .run(|_| async {
                    if true {
                        panic!("worker crashed");
                    }
                    Ok(())
                })
                .await;
        })
        .await;
        assert!(joined.is_err());

        let task = store.get_task(&TaskFilter::new().pk("job-1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    async fn assert_retry_reuses_record(store: Arc<dyn RecordStore>) {
        let first = reset_guard(&store, "job-1").acquire().await.into_result().unwrap();
        assert!(!first.was_reused());

        // Same id while the first attempt is still running
        let retry = reset_guard(&store, "job-1").acquire().await.into_result().unwrap();
        assert!(retry.was_reused());
        assert_eq!(retry.task().pk, "job-1");
        assert_eq!(retry.task().created_at, first.task().created_at);

        let tasks = store
            .filter_tasks(&TaskFilter::new().project("p1"), &TaskQueryOpts::default())
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_same_id_reuses_running_record_in_memory() {
        assert_retry_reuses_record(store()).await;
    }

    #[tokio::test]
    async fn test_same_id_reuses_running_record_in_sled() {
        assert_retry_reuses_record(Arc::new(SledStore::temporary().unwrap())).await;
    }

    #[tokio::test]
    async fn test_id_of_another_project_fails_without_touching_it() {
        let sled: Arc<dyn RecordStore> = Arc::new(SledStore::temporary().unwrap());
        for store in [store(), sled] {
            let theirs = ExclusiveTask::for_project(
                store.clone(),
                &GuardConfig::default(),
                "p2",
                TaskType::Reset,
                "job-1",
            );
            theirs.acquire().await.into_result().unwrap();

            match reset_guard(&store, "job-1").acquire().await {
                Acquisition::Failed(GuardError::Configuration { .. }) => {}
                _ => panic!("expected configuration failure"),
            }
            let kept = store.get_task(&TaskFilter::new().pk("job-1")).await.unwrap();
            assert_eq!(kept.project_id, "p2");
            assert_eq!(kept.status, TaskStatus::Running);
        }
    }

    #[tokio::test]
    async fn test_path_like_task_id_is_rejected() {
        let store = store();
        match reset_guard(&store, "../../escape").acquire().await {
            Acquisition::Failed(err) => assert_eq!(err.http_status(), 400),
            _ => panic!("expected failure"),
        }
        let tasks = store
            .filter_tasks(&TaskFilter::new(), &TaskQueryOpts::default())
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }
}
