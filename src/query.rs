//! Read side for task records and their logs
//!
//! Views are plain `Serialize` structs; an HTTP layer maps errors to status
//! codes with [`GuardError::http_status`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::config::GuardConfig;
use crate::core::errors::{GuardError, Result};
use crate::logger::read_from;
use crate::model::{Project, ProjectId, Task, TaskId, TaskStatus, TaskType};
use crate::storage::{RecordStore, TaskFilter, TaskQueryOpts};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub pk: ProjectId,
    pub name: String,
}

/// Exported fields of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetails {
    pub pk: TaskId,
    pub project: ProjectRef,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_ping: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
}

impl TaskDetails {
    fn export(task: Task, project: &Project) -> Self {
        Self {
            pk: task.pk,
            project: ProjectRef {
                pk: project.pk.clone(),
                name: project.name.clone(),
            },
            status: task.status,
            created_at: task.created_at,
            updated_at: task.updated_at,
            last_ping: task.last_ping,
            task_type: task.task_type,
        }
    }
}

/// Tail of a task log starting at byte offset `from`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogView {
    pub task_log: String,
    /// Number of bytes returned
    pub len: usize,
    pub from: u64,
    pub task_status: TaskStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Pagination {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
        }
    }

    /// Parse raw `limit`/`offset` query parameters
    pub fn parse(limit: Option<&str>, offset: Option<&str>) -> Result<Self> {
        fn number(raw: Option<&str>, field: &str) -> Result<Option<usize>> {
            raw.map(|value| {
                value.trim().parse::<usize>().map_err(|_| {
                    GuardError::configuration_field(
                        format!("{} must be a non-negative integer", field),
                        field,
                    )
                })
            })
            .transpose()
        }

        Ok(Self {
            limit: number(limit, "limit")?,
            offset: number(offset, "offset")?,
        })
    }
}

pub struct TaskQuery {
    store: Arc<dyn RecordStore>,
    config: Arc<GuardConfig>,
}

impl TaskQuery {
    pub const DEFAULT_OFFSET: usize = 0;

    pub fn new(store: Arc<dyn RecordStore>, config: Arc<GuardConfig>) -> Self {
        Self { store, config }
    }

    async fn project_task(&self, project_id: &str, task_id: &str) -> Result<(Project, Task)> {
        let project = self.store.get_project(project_id).await?;
        let task = self
            .store
            .get_task(&TaskFilter::new().project(project_id).pk(task_id))
            .await?;
        Ok((project, task))
    }

    pub async fn task_details(&self, project_id: &str, task_id: &str) -> Result<TaskDetails> {
        let (project, task) = self.project_task(project_id, task_id).await?;
        Ok(TaskDetails::export(task, &project))
    }

    /// Read the task's log from byte offset `from` to its current end
    pub async fn task_log(&self, project_id: &str, task_id: &str, from: u64) -> Result<TaskLogView> {
        let (_, task) = self.project_task(project_id, task_id).await?;
        let path = self.config.log_path(&task.pk);

        let content = read_from(&path, from).await.map_err(|e| {
            debug!("Log of task {} unreadable: {}", task.pk, e);
            GuardError::log_not_found(path.display().to_string())
        })?;

        Ok(TaskLogView {
            len: content.len(),
            task_log: String::from_utf8_lossy(&content).into_owned(),
            from,
            task_status: task.status,
        })
    }

    /// A project's tasks, newest first
    pub async fn project_tasks(
        &self,
        project_id: &str,
        pagination: Pagination,
    ) -> Result<Vec<TaskDetails>> {
        let project = self.store.get_project(project_id).await?;
        let opts = TaskQueryOpts::page(
            pagination.offset.unwrap_or(Self::DEFAULT_OFFSET),
            pagination.limit.unwrap_or(self.config.default_page_limit),
        );
        let tasks = self
            .store
            .filter_tasks(&TaskFilter::new().project(project_id), &opts)
            .await?;

        Ok(tasks
            .into_iter()
            .map(|task| TaskDetails::export(task, &project))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_parse() {
        let page = Pagination::parse(Some("5"), None).unwrap();
        assert_eq!(page.limit, Some(5));
        assert_eq!(page.offset, None);

        let err = Pagination::parse(Some("-1"), None).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }
}
