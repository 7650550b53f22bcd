//! Project reset workflow
//!
//! Runs the external reset command for one project under the exclusive
//! guard and the task logger, recording the outcome on the project.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::config::GuardConfig;
use crate::core::errors::{GuardError, Result};
use crate::core::hooks::{HookRegistry, PROJECT_RESET_AFTER, PROJECT_RESET_BEFORE};
use crate::guard::{Acquisition, ExclusiveTask};
use crate::logger::{TaskLog, TaskLogger};
use crate::model::{
    validate_task_id, AnalysisPriority, LastReset, Project, ResetStatus, TaskId, TaskType,
};
use crate::storage::{ProjectField, ProjectPatch, RecordStore, Update};

/// What the reset command gets to work with
pub struct ResetContext<'a> {
    pub project: &'a Project,
    pub config: &'a GuardConfig,
    pub store: &'a Arc<dyn RecordStore>,
    pub log: &'a TaskLog,
}

/// The external command that wipes a project's analysis state.
///
/// Either completes or fails as a whole; a failure leaves no partial reset
/// the caller has to clean up.
#[async_trait]
pub trait ResetCommand: Send + Sync {
    async fn run(&self, ctx: ResetContext<'_>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    Succeeded { task_id: TaskId },
    /// Another conflicting task holds the project; the request stays pending
    Blocked { holder: TaskId },
    /// The project no longer exists; nothing was recorded
    ProjectMissing,
}

pub struct ResetWorkflow {
    store: Arc<dyn RecordStore>,
    config: Arc<GuardConfig>,
    hooks: HookRegistry,
    command: Arc<dyn ResetCommand>,
}

impl ResetWorkflow {
    pub fn new(
        store: Arc<dyn RecordStore>,
        config: Arc<GuardConfig>,
        hooks: HookRegistry,
        command: Arc<dyn ResetCommand>,
    ) -> Self {
        Self {
            store,
            config,
            hooks,
            command,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<GuardConfig> {
        &self.config
    }

    /// Mark a project as waiting for a reset
    pub async fn request_reset(&self, project_id: &str) -> Result<()> {
        self.store
            .transaction(vec![Update::project(
                project_id,
                ProjectPatch::new().reset(true).reset_requested_at(Utc::now()),
            )])
            .await?;
        info!("Reset requested for project {}", project_id);
        Ok(())
    }

    /// Reset one project. `task_id` is the idempotency key of the enclosing
    /// job; a fresh id is generated when absent.
    ///
    /// Command failures are recorded on the project and then returned as
    /// `GuardError::Execution` so the job queue can apply its retry policy.
    pub async fn reset_project(
        &self,
        project_id: &str,
        task_id: Option<TaskId>,
    ) -> Result<ResetOutcome> {
        let task_id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        validate_task_id(&task_id)?;

        let project = match self.store.get_project(project_id).await {
            Ok(project) => project,
            Err(GuardError::NotFound { .. }) => {
                warn!(
                    "Project {} does not exist and thus cannot be reset.",
                    project_id
                );
                return Ok(ResetOutcome::ProjectMissing);
            }
            Err(e) => return Err(e),
        };

        let guard = ExclusiveTask::for_project(
            self.store.clone(),
            &self.config,
            project.pk.clone(),
            TaskType::Reset,
            task_id.clone(),
        );

        let outcome = match guard.acquire().await {
            Acquisition::Blocked(conflict) => {
                info!(
                    "Project {} ({}) is currently being processed, aborting...",
                    project.name, project.pk
                );
                self.store
                    .transaction(vec![Update::project(
                        project.pk.as_str(),
                        ProjectPatch::new().last_reset(LastReset::now(ResetStatus::Blocked)),
                    )])
                    .await?;
                Ok(ResetOutcome::Blocked {
                    holder: conflict.holder.pk,
                })
            }
            Acquisition::Failed(e) => Err(e),
            Acquisition::Acquired(active) => {
                let logger = TaskLogger::new(self.store.clone(), self.config.clone());
                let project = &project;
                active
                    .run(|task| async move {
                        logger
                            .run(&task, |log| self.reset_locked(project, log))
                            .await
                    })
                    .await
                    .map(|_| ResetOutcome::Succeeded { task_id })
            }
        };

        info!("Reset of project {} done.", project.pk);
        outcome
    }

    /// Body run while holding the project lock
    async fn reset_locked(&self, project: &Project, log: TaskLog) -> Result<()> {
        let attempt = AssertUnwindSafe(self.perform_reset(project, &log))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(GuardError::execution(
                    "reset_command",
                    "reset command panicked",
                ))
            });

        if let Err(e) = &attempt {
            let recorded = self
                .store
                .transaction(vec![Update::project(
                    project.pk.as_str(),
                    ProjectPatch::new().last_reset(LastReset::now(ResetStatus::Failed)),
                )])
                .await;
            if let Err(record_err) = recorded {
                error!(
                    "Could not record failed reset of project {}: {}",
                    project.pk, record_err
                );
            }
            error!(
                "Reset of project {} (pk={}) failed: {}",
                project.name, project.pk, e
            );
        }

        // The request is consumed whatever the outcome
        let cleared = self
            .store
            .transaction(vec![Update::project(
                project.pk.as_str(),
                ProjectPatch::new()
                    .reset(false)
                    .unset(ProjectField::ResetRequestedAt),
            )])
            .await;

        match (attempt, cleared) {
            (Err(e), cleared) => {
                if let Err(clear_err) = cleared {
                    error!(
                        "Could not clear reset request of project {}: {}",
                        project.pk, clear_err
                    );
                }
                Err(e)
            }
            (Ok(()), cleared) => cleared,
        }
    }

    async fn perform_reset(&self, project: &Project, log: &TaskLog) -> Result<()> {
        self.hooks.call(PROJECT_RESET_BEFORE, project).await?;

        log.line(format!("Resetting project {} ({})", project.name, project.pk))
            .await?;
        let ctx = ResetContext {
            project,
            config: &self.config,
            store: &self.store,
            log,
        };
        self.command
            .run(ctx)
            .await
            .map_err(|e| GuardError::execution_from_anyhow("reset_command", e))?;

        let now = Utc::now();
        self.store
            .transaction(vec![Update::project(
                project.pk.as_str(),
                ProjectPatch::new()
                    .last_reset(LastReset {
                        dt: now,
                        status: ResetStatus::Succeeded,
                    })
                    .analyze(true)
                    .analysis_priority(AnalysisPriority::High)
                    .analysis_requested_at(now)
                    .unset(ProjectField::FirstAnalysisEmailSent),
            )])
            .await?;
        log.line("Reset complete, analysis scheduled").await?;

        self.hooks.call(PROJECT_RESET_AFTER, project).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    struct NoopReset;

    #[async_trait]
    impl ResetCommand for NoopReset {
        async fn run(&self, ctx: ResetContext<'_>) -> anyhow::Result<()> {
            ctx.log.line("dropping snapshots").await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_missing_project_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = GuardConfig::builder()
            .data_dir(dir.path())
            .heartbeat_interval(Duration::from_millis(50))
            .stall_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let workflow = ResetWorkflow::new(
            store,
            Arc::new(config),
            HookRegistry::new(),
            Arc::new(NoopReset),
        );

        let outcome = workflow.reset_project("ghost", None).await.unwrap();
        assert_eq!(outcome, ResetOutcome::ProjectMissing);
    }
}
