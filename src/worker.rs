//! Background reset worker
//!
//! Picks up projects flagged for reset and runs each reset on its own tokio
//! task, with at most `max_workers` resets in flight.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::errors::{GuardError, Result};
use crate::model::{ProjectId, TaskId};
use crate::recovery::StaleTaskReaper;
use crate::reset::{ResetOutcome, ResetWorkflow};
use crate::storage::ProjectFilter;

/// A submitted reset job
pub struct JobHandle {
    pub job_id: TaskId,
    pub project_id: ProjectId,
    handle: JoinHandle<Result<ResetOutcome>>,
}

impl JobHandle {
    /// Wait for the job to finish
    pub async fn join(self) -> Result<ResetOutcome> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(GuardError::execution(
                "reset_worker",
                format!("job {} did not complete: {}", self.job_id, e),
            )),
        }
    }
}

/// Removes a project from the in-flight set when its job ends
struct InFlight {
    projects: Arc<DashSet<ProjectId>>,
    project_id: ProjectId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.projects.remove(&self.project_id);
    }
}

pub struct ResetWorker {
    workflow: Arc<ResetWorkflow>,
    reaper: Option<StaleTaskReaper>,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashSet<ProjectId>>,
    max_workers: usize,
}

impl ResetWorker {
    pub fn new(workflow: Arc<ResetWorkflow>) -> Self {
        let max_workers = workflow.config().max_workers;
        Self {
            workflow,
            reaper: None,
            permits: Arc::new(Semaphore::new(max_workers)),
            in_flight: Arc::new(DashSet::new()),
            max_workers,
        }
    }

    /// Also reap stale running tasks on every scheduling tick
    pub fn with_reaper(mut self) -> Self {
        self.reaper = Some(StaleTaskReaper::new(
            self.workflow.store().clone(),
            self.workflow.config().clone(),
        ));
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Queue a reset of `project_id` under a fresh job id
    pub fn submit(&self, project_id: impl Into<ProjectId>) -> JobHandle {
        self.submit_with_id(project_id, Uuid::new_v4().to_string())
    }

    /// Queue a reset under a caller-supplied job id.
    ///
    /// Resubmitting a job id whose task record already exists resumes that
    /// record instead of creating a second one.
    pub fn submit_with_id(
        &self,
        project_id: impl Into<ProjectId>,
        job_id: impl Into<TaskId>,
    ) -> JobHandle {
        let project_id = project_id.into();
        let job_id = job_id.into();
        self.in_flight.insert(project_id.clone());

        let workflow = self.workflow.clone();
        let permits = self.permits.clone();
        let marker = InFlight {
            projects: self.in_flight.clone(),
            project_id: project_id.clone(),
        };
        let task_id = job_id.clone();
        let target = project_id.clone();

        let handle = tokio::spawn(async move {
            let _marker = marker;
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| GuardError::internal("reset worker semaphore closed"))?;
            debug!("Job {} starting reset of project {}", task_id, target);
            workflow.reset_project(&target, Some(task_id)).await
        });

        JobHandle {
            job_id,
            project_id,
            handle,
        }
    }

    /// Submit every project with a pending reset request that is not
    /// already being handled by this worker
    pub async fn schedule_pending(&self) -> Result<Vec<JobHandle>> {
        let pending = self
            .workflow
            .store()
            .filter_projects(&ProjectFilter::reset_pending())
            .await?;

        let jobs: Vec<JobHandle> = pending
            .into_iter()
            .filter(|project| !self.in_flight.contains(&project.pk))
            .map(|project| self.submit(project.pk))
            .collect();

        if !jobs.is_empty() {
            info!("Scheduled {} pending resets", jobs.len());
        }
        Ok(jobs)
    }

    async fn tick(&self) {
        if let Some(reaper) = &self.reaper {
            if let Err(e) = reaper.reap().await {
                warn!("Stale task scan failed: {}", e);
            }
        }

        match self.schedule_pending().await {
            Ok(jobs) => {
                for job in jobs {
                    tokio::spawn(async move {
                        let job_id = job.job_id.clone();
                        let project_id = job.project_id.clone();
                        match job.join().await {
                            Ok(outcome) => debug!("Job {} finished: {:?}", job_id, outcome),
                            Err(e) => error!(
                                job_id = %job_id,
                                project_id = %project_id,
                                error = %e,
                                "Reset job failed"
                            ),
                        }
                    });
                }
            }
            Err(e) => error!("Could not list pending resets: {}", e),
        }
    }

    /// Poll for pending resets every `schedule_interval` until `shutdown`
    /// fires, then wait for in-flight jobs to drain.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let mut ticker = interval(self.workflow.config().schedule_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Reset worker started with {} slots", self.max_workers);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Reset worker shutting down");
                    break;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }

        let _drained = self
            .permits
            .acquire_many(self.max_workers as u32)
            .await
            .map_err(|_| GuardError::internal("reset worker semaphore closed"))?;
        info!("Reset worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GuardConfig;
    use crate::core::hooks::HookRegistry;
    use crate::model::Project;
    use crate::reset::{ResetCommand, ResetContext};
    use crate::storage::{MemoryStore, RecordStore};
    use async_trait::async_trait;
    use std::time::Duration;

    struct SlowReset;

    #[async_trait]
    impl ResetCommand for SlowReset {
        async fn run(&self, ctx: ResetContext<'_>) -> anyhow::Result<()> {
            ctx.log.line("wiping").await?;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pending_projects_are_scheduled_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = GuardConfig::builder()
            .data_dir(dir.path())
            .heartbeat_interval(Duration::from_millis(50))
            .stall_timeout(Duration::from_secs(5))
            .max_workers(1)
            .build()
            .unwrap();
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        for pk in ["p1", "p2"] {
            store.put_project(&Project::new(pk, pk)).await.unwrap();
        }
        let workflow = Arc::new(ResetWorkflow::new(
            store.clone(),
            Arc::new(config),
            HookRegistry::new(),
            Arc::new(SlowReset),
        ));
        workflow.request_reset("p1").await.unwrap();

        let worker = ResetWorker::new(workflow);
        let first = worker.schedule_pending().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].project_id, "p1");

        let second = worker.schedule_pending().await.unwrap();
        assert!(second.is_empty());

        for job in first {
            let job_id = job.job_id.clone();
            assert_eq!(
                job.join().await.unwrap(),
                ResetOutcome::Succeeded { task_id: job_id }
            );
        }
        assert_eq!(worker.in_flight(), 0);
        assert!(!store.get_project("p1").await.unwrap().reset);
    }
}
