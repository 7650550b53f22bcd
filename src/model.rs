use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::GuardError;

pub type TaskId = String;
pub type ProjectId = String;

/// Check that `id` can name a task log file without leaving the log directory
pub fn validate_task_id(id: &str) -> Result<(), GuardError> {
    if id.is_empty() || id.contains("..") || id.contains(['/', '\\', '\0']) {
        return Err(GuardError::configuration_field(
            format!("invalid task id: {:?}", id),
            "task_id",
        ));
    }
    Ok(())
}

/// Kind of long-running work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Analysis,
    Reset,
    Delete,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Analysis => "analysis",
            TaskType::Reset => "reset",
            TaskType::Delete => "delete",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(TaskType::Analysis),
            "reset" => Ok(TaskType::Reset),
            "delete" => Ok(TaskType::Delete),
            _ => Err(GuardError::configuration(format!("Unknown task type: {}", s))),
        }
    }
}

/// Task status. `Running` is the only status that holds a project lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
    Blocked,
    Unknown,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Unknown => "unknown",
        }
    }

    /// No further transitions are expected once a task reaches this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Blocked
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of long-running work, kept as an audit record after it ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub pk: TaskId,
    pub project_id: ProjectId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_ping: Option<DateTime<Utc>>,
    pub log_path: Option<String>,
}

impl Task {
    /// A fresh `running` task owned by `project_id`
    pub fn new(pk: impl Into<TaskId>, project_id: impl Into<ProjectId>, task_type: TaskType) -> Self {
        let now = Utc::now();
        Self {
            pk: pk.into(),
            project_id: project_id.into(),
            task_type,
            status: TaskStatus::Running,
            created_at: now,
            updated_at: now,
            last_ping: None,
            log_path: None,
        }
    }

    /// Most recent sign of life: the last heartbeat, or creation time
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_ping.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisPriority {
    Low,
    Medium,
    High,
}

impl Default for AnalysisPriority {
    fn default() -> Self {
        AnalysisPriority::Medium
    }
}

/// Outcome of the most recent reset attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetStatus {
    Succeeded,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastReset {
    pub dt: DateTime<Utc>,
    pub status: ResetStatus,
}

impl LastReset {
    pub fn now(status: ResetStatus) -> Self {
        Self {
            dt: Utc::now(),
            status,
        }
    }
}

/// The fields of a project the reset workflow reads and writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub pk: ProjectId,
    pub name: String,
    pub reset: bool,
    pub reset_requested_at: Option<DateTime<Utc>>,
    pub last_reset: Option<LastReset>,
    pub analyze: bool,
    pub analysis_priority: AnalysisPriority,
    pub analysis_requested_at: Option<DateTime<Utc>>,
    pub first_analysis_email_sent: Option<bool>,
}

impl Project {
    pub fn new(pk: impl Into<ProjectId>, name: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            name: name.into(),
            reset: false,
            reset_requested_at: None,
            last_reset: None,
            analyze: false,
            analysis_priority: AnalysisPriority::default(),
            analysis_requested_at: None,
            first_analysis_email_sent: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_must_stay_inside_log_dir() {
        assert!(validate_task_id("3f2a9c1e-job").is_ok());
        for bad in ["", "../../x", "a/b", "a\\b", ".."] {
            let err = validate_task_id(bad).unwrap_err();
            assert_eq!(err.http_status(), 400, "{:?}", bad);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Unknown.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(TaskStatus::Running.is_active());
        assert!(!TaskStatus::Unknown.is_active());
    }

    #[test]
    fn test_task_serializes_type_field() {
        let task = Task::new("t1", "p1", TaskType::Reset);
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "reset");
        assert_eq!(value["status"], "running");
    }

    #[test]
    fn test_task_type_parse() {
        assert_eq!("delete".parse::<TaskType>().unwrap(), TaskType::Delete);
        assert!("compile".parse::<TaskType>().is_err());
    }
}
