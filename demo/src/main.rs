use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use projectguard::{
    hook_fn, GuardConfig, HookRegistry, MemoryStore, Pagination, Project, RecordStore,
    ResetCommand, ResetContext, ResetWorker, ResetWorkflow, SledStore, TaskQuery,
    PROJECT_RESET_AFTER, PROJECT_RESET_BEFORE,
};

/// Pretends to drop a project's analysis snapshots
struct WipeSnapshots;

#[async_trait]
impl ResetCommand for WipeSnapshots {
    async fn run(&self, ctx: ResetContext<'_>) -> Result<()> {
        if ctx.project.name.contains("broken") {
            bail!("snapshot storage for {} is unreachable", ctx.project.name);
        }
        for step in ["snapshots", "issues", "metrics"] {
            ctx.log.line(format!("Dropping {}", step)).await?;
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(())
    }
}

fn load_config() -> Result<GuardConfig> {
    let config = match std::env::var("PROJECTGUARD_CONFIG") {
        Ok(path) => GuardConfig::from_file(path)?,
        Err(_) => GuardConfig::development(),
    };
    Ok(config.with_env_overrides()?)
}

fn open_store(config: &GuardConfig) -> Result<Arc<dyn RecordStore>> {
    Ok(match &config.db_path {
        Some(path) => Arc::new(SledStore::open(path)?) as Arc<dyn RecordStore>,
        None => Arc::new(MemoryStore::new()) as Arc<dyn RecordStore>,
    })
}

fn init_tracing(level: Level) -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(Level::INFO)?;

    let config = Arc::new(load_config()?);
    let store = open_store(&config)?;

    let hooks = HookRegistry::new();
    hooks.register(
        PROJECT_RESET_BEFORE,
        hook_fn(|event, project| async move {
            info!("{}: stopping analysis runners of {}", event, project.name);
            Ok(())
        }),
    );
    hooks.register(
        PROJECT_RESET_AFTER,
        hook_fn(|event, project| async move {
            info!("{}: notifying owners of {}", event, project.name);
            Ok(())
        }),
    );

    let workflow = Arc::new(ResetWorkflow::new(
        store.clone(),
        config.clone(),
        hooks,
        Arc::new(WipeSnapshots),
    ));

    for (pk, name) in [("p1", "backend"), ("p2", "frontend"), ("p3", "broken-mirror")] {
        store.put_project(&Project::new(pk, name)).await?;
        workflow.request_reset(pk).await?;
    }

    let worker = Arc::new(ResetWorker::new(workflow).with_reaper());
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    tokio::time::sleep(config.schedule_interval + Duration::from_secs(2)).await;
    let _ = shutdown_tx.send(());
    runner.await??;

    let query = TaskQuery::new(store.clone(), config.clone());
    for pk in ["p1", "p2", "p3"] {
        let project = store.get_project(pk).await?;
        info!(
            "Project {}: reset={} last_reset={:?} analyze={}",
            project.name, project.reset, project.last_reset, project.analyze
        );
        for task in query.project_tasks(pk, Pagination::default()).await? {
            let log = query.task_log(pk, &task.pk, 0).await?;
            info!(
                "Task {} ({}) wrote {} bytes:\n{}",
                task.pk, log.task_status, log.len, log.task_log
            );
        }
    }

    Ok(())
}
