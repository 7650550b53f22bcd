//! Per-task progress log and heartbeat
//!
//! [`TaskLogger::run`] wraps a task body: it opens `<task pk>.log` for
//! appending, keeps `last_ping` fresh while the body runs, and commits the
//! terminal task status when the body ends. Log files are never removed here.

use std::future::Future;
use std::io::SeekFrom;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::config::GuardConfig;
use crate::core::errors::{GuardError, Result};
use crate::model::{validate_task_id, Task, TaskId, TaskStatus};
use crate::storage::{RecordStore, TaskPatch};

/// Append-only writer for one task's log file.
///
/// Every write is flushed before it returns, so a reader seeking to any
/// earlier offset sees a complete prefix of what was written.
#[derive(Clone)]
pub struct TaskLog {
    task_pk: Arc<str>,
    path: Arc<PathBuf>,
    file: Arc<Mutex<File>>,
}

impl TaskLog {
    /// Open (creating if absent) the log file at `path` in append mode
    pub async fn open(task_pk: &str, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GuardError::io(format!("create {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| GuardError::io(format!("open {}", path.display()), e))?;

        Ok(Self {
            task_pk: Arc::from(task_pk),
            path: Arc::new(path),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw bytes
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(bytes)
            .await
            .map_err(|e| GuardError::io(format!("write {}", self.path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| GuardError::io(format!("flush {}", self.path.display()), e))?;
        Ok(())
    }

    /// Append one timestamped line, mirrored to tracing
    pub async fn line(&self, message: impl AsRef<str>) -> Result<()> {
        let message = message.as_ref();
        debug!(task = %self.task_pk, "{}", message);
        let line = format!(
            "[{}] {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            message
        );
        self.write(line.as_bytes()).await
    }

    /// Flush buffered data and metadata to disk
    pub async fn sync(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush()
            .await
            .map_err(|e| GuardError::io(format!("flush {}", self.path.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| GuardError::io(format!("sync {}", self.path.display()), e))
    }
}

/// Read a log file from byte offset `from` to its current end
pub async fn read_from(path: impl AsRef<Path>, from: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path.as_ref()).await?;
    file.seek(SeekFrom::Start(from)).await?;
    let mut content = Vec::new();
    file.read_to_end(&mut content).await?;
    Ok(content)
}

/// Background `last_ping` updater for one task
struct Heartbeat {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn spawn(store: Arc<dyn RecordStore>, task_pk: TaskId, period: Duration) -> Self {
        let (stop, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let patch = TaskPatch::new().last_ping(Utc::now());
                        if let Err(e) = store.update_task(&task_pk, patch).await {
                            warn!("Heartbeat for task {} failed: {}", task_pk, e);
                        }
                    }
                }
            }
            debug!("Heartbeat for task {} stopped", task_pk);
        });
        Self { stop, handle }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }
    }
}

/// Wraps a task body with a log file, heartbeat and status bookkeeping
pub struct TaskLogger {
    store: Arc<dyn RecordStore>,
    config: Arc<GuardConfig>,
    ping: bool,
}

impl TaskLogger {
    pub fn new(store: Arc<dyn RecordStore>, config: Arc<GuardConfig>) -> Self {
        Self {
            store,
            config,
            ping: true,
        }
    }

    /// Enable or disable the heartbeat
    pub fn with_ping(mut self, ping: bool) -> Self {
        self.ping = ping;
        self
    }

    /// Run `body` with this task's log open.
    ///
    /// The task ends `succeeded` if the body returns `Ok` and `failed`
    /// otherwise; a panic is resumed once the log and status are settled.
    pub async fn run<F, Fut, T>(&self, task: &Task, body: F) -> Result<T>
    where
        F: FnOnce(TaskLog) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        validate_task_id(&task.pk)?;
        let path = self.config.log_path(&task.pk);
        let log = TaskLog::open(&task.pk, &path).await?;

        self.store
            .update_task(
                &task.pk,
                TaskPatch::new()
                    .log_path(path.display().to_string())
                    .last_ping(Utc::now()),
            )
            .await?;

        log.line(format!(
            "Starting {} task {} for project {}",
            task.task_type, task.pk, task.project_id
        ))
        .await?;

        let heartbeat = self.ping.then(|| {
            Heartbeat::spawn(
                self.store.clone(),
                task.pk.clone(),
                self.config.heartbeat_interval,
            )
        });

        let body_log = log.clone();
        let outcome = AssertUnwindSafe(async move { body(body_log).await })
            .catch_unwind()
            .await;

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }

        let (status, failure) = match &outcome {
            Ok(Ok(_)) => (TaskStatus::Succeeded, None),
            Ok(Err(e)) => (TaskStatus::Failed, Some(format!("Task failed: {}", e))),
            Err(_) => (TaskStatus::Failed, Some("Task aborted by a panic".to_string())),
        };

        if let Some(failure) = failure {
            if let Err(e) = log.line(failure).await {
                warn!("Could not write failure of task {}: {}", task.pk, e);
            }
        }
        if let Err(e) = log.line(format!("Task {} {}", task.pk, status)).await {
            warn!("Could not write footer of task {}: {}", task.pk, e);
        }
        if let Err(e) = log.sync().await {
            warn!("Could not sync log of task {}: {}", task.pk, e);
        }

        // A task the reaper already failed keeps that status
        let commit = TaskPatch::new()
            .status(status)
            .only_if_status(TaskStatus::Running);
        match self.store.update_task(&task.pk, commit).await {
            Ok(stored) if stored.status == status => info!("Task {} {}", task.pk, status),
            Ok(stored) => warn!(
                "Task {} was already {} when it ended as {}",
                task.pk, stored.status, status
            ),
            Err(e) => error!("Could not record status {} of task {}: {}", status, task.pk, e),
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
