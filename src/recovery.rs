use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::core::config::GuardConfig;
use crate::core::errors::Result;
use crate::model::{Task, TaskStatus};
use crate::storage::{RecordStore, TaskFilter, TaskPatch, TaskQueryOpts};

/// Statistics from one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapStats {
    /// Running tasks inspected
    pub scanned: usize,
    /// Tasks marked failed for missing heartbeats
    pub reaped: usize,
    pub errors: usize,
}

/// Releases locks held by tasks whose worker died without finalizing.
///
/// A `running` task whose last sign of life is older than the configured
/// stall timeout is marked `failed`. Nothing calls this implicitly; the
/// worker's maintenance tick or an operator runs it.
pub struct StaleTaskReaper {
    store: Arc<dyn RecordStore>,
    config: Arc<GuardConfig>,
}

impl StaleTaskReaper {
    pub fn new(store: Arc<dyn RecordStore>, config: Arc<GuardConfig>) -> Self {
        Self { store, config }
    }

    fn is_stale(&self, task: &Task, now: DateTime<Utc>) -> bool {
        match (now - task.last_seen()).to_std() {
            Ok(silence) => silence > self.config.stall_timeout,
            // last_seen in the future: clock skew between workers
            Err(_) => false,
        }
    }

    pub async fn reap(&self) -> Result<ReapStats> {
        let running = self
            .store
            .filter_tasks(
                &TaskFilter::new().statuses(vec![TaskStatus::Running]),
                &TaskQueryOpts::default(),
            )
            .await?;

        let mut stats = ReapStats {
            scanned: running.len(),
            ..Default::default()
        };

        for task in running {
            if !self.is_stale(&task, Utc::now()) {
                continue;
            }

            // Re-read to avoid failing a task that pinged since the scan
            let current = match self
                .store
                .get_task(&TaskFilter::new().pk(task.pk.clone()))
                .await
            {
                Ok(current) => current,
                Err(e) => {
                    error!("Could not reload stale task {}: {}", task.pk, e);
                    stats.errors += 1;
                    continue;
                }
            };
            if !current.status.is_active() || !self.is_stale(&current, Utc::now()) {
                debug!("Task {} recovered before reaping", current.pk);
                continue;
            }

            warn!(
                "Task {} on project {} has not pinged since {}, marking failed",
                current.pk,
                current.project_id,
                current.last_seen()
            );
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
                Ok(task) if task.status == TaskStatus::Failed => stats.reaped += 1,
                Ok(task) => {
                    debug!("Task {} finished as {} before reaping", task.pk, task.status)
                }
                Err(e) => {
                    error!("Could not reap task {}: {}", current.pk, e);
                    stats.errors += 1;
                }
            }
        }

        if stats.reaped > 0 {
            info!(
                "Reaped {} stale tasks out of {} running",
                stats.reaped, stats.scanned
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskType;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_only_silent_tasks_are_reaped() {
        let config = Arc::new(
            GuardConfig::builder()
                .heartbeat_interval(Duration::from_secs(1))
                .stall_timeout(Duration::from_secs(60))
                .build()
                .unwrap(),
        );
        let memory = Arc::new(MemoryStore::new());

        let mut silent = Task::new("silent", "p1", TaskType::Reset);
        silent.created_at = Utc::now() - chrono::Duration::minutes(10);
        silent.last_ping = Some(Utc::now() - chrono::Duration::minutes(5));
        memory.insert_task(silent).await;

        let mut alive = Task::new("alive", "p2", TaskType::Reset);
        alive.created_at = Utc::now() - chrono::Duration::minutes(10);
        alive.last_ping = Some(Utc::now());
        memory.insert_task(alive).await;

        let mut done = Task::new("done", "p3", TaskType::Reset);
        done.created_at = Utc::now() - chrono::Duration::hours(1);
        done.status = TaskStatus::Succeeded;
        memory.insert_task(done).await;

        let store: Arc<dyn RecordStore> = memory;
        let stats = StaleTaskReaper::new(store.clone(), config).reap().await.unwrap();

        assert_eq!(
            stats,
            ReapStats {
                scanned: 2,
                reaped: 1,
                errors: 0
            }
        );
        let silent = store.get_task(&TaskFilter::new().pk("silent")).await.unwrap();
        assert_eq!(silent.status, TaskStatus::Failed);
        let alive = store.get_task(&TaskFilter::new().pk("alive")).await.unwrap();
        assert_eq!(alive.status, TaskStatus::Running);
    }
}
