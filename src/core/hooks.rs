//! Lifecycle hooks keyed by event name
//!
//! Hooks are registered on an explicit [`HookRegistry`] that is handed to the
//! components that fire them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::core::errors::{GuardError, Result};
use crate::model::Project;

pub const PROJECT_RESET_BEFORE: &str = "project.reset.before";
pub const PROJECT_RESET_AFTER: &str = "project.reset.after";

/// A callback fired at a named point in a project's lifecycle
#[async_trait]
pub trait ProjectHook: Send + Sync {
    async fn call(&self, event: &str, project: &Project) -> anyhow::Result<()>;
}

type HookFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Adapter turning a closure into a [`ProjectHook`]
pub struct FnHook<F>
where
    F: Fn(String, Project) -> HookFuture + Send + Sync,
{
    func: F,
}

impl<F> FnHook<F>
where
    F: Fn(String, Project) -> HookFuture + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> ProjectHook for FnHook<F>
where
    F: Fn(String, Project) -> HookFuture + Send + Sync,
{
    async fn call(&self, event: &str, project: &Project) -> anyhow::Result<()> {
        (self.func)(event.to_string(), project.clone()).await
    }
}

/// Box a hook body; shorthand for building [`FnHook`]s
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn ProjectHook>
where
    F: Fn(String, Project) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHook::new(move |event, project| -> HookFuture {
        Box::pin(f(event, project))
    }))
}

/// Ordered hooks per event name
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: Arc<DashMap<String, Vec<Arc<dyn ProjectHook>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `hook` to the hooks of `event`
    pub fn register(&self, event: &str, hook: Arc<dyn ProjectHook>) {
        self.hooks.entry(event.to_string()).or_default().push(hook);
    }

    pub fn count(&self, event: &str) -> usize {
        self.hooks.get(event).map(|h| h.len()).unwrap_or(0)
    }

    /// Run every hook of `event` in registration order, stopping at the first error
    pub async fn call(&self, event: &str, project: &Project) -> Result<()> {
        // Snapshot so no map shard is held across an await
        let hooks: Vec<Arc<dyn ProjectHook>> = match self.hooks.get(event) {
            Some(entry) => entry.value().clone(),
            None => return Ok(()),
        };

        debug!("Calling {} hooks for {} on project {}", hooks.len(), event, project.pk);
        for hook in hooks {
            if let Err(e) = hook.call(event, project).await {
                warn!("Hook {} failed for project {}: {:#}", event, project.pk, e);
                return Err(GuardError::hook(event, format!("{:#}", e)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_hooks_run_in_order_and_stop_on_error() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        registry.register(
            PROJECT_RESET_BEFORE,
            hook_fn(move |event, project| {
                let seen = first.clone();
                async move {
                    seen.lock().unwrap().push(format!("1:{}:{}", event, project.pk));
                    Ok(())
                }
            }),
        );
        registry.register(
            PROJECT_RESET_BEFORE,
            hook_fn(|_, _| async { Err(anyhow::anyhow!("nope")) }),
        );
        let third = seen.clone();
        registry.register(
            PROJECT_RESET_BEFORE,
            hook_fn(move |_, _| {
                let seen = third.clone();
                async move {
                    seen.lock().unwrap().push("3".to_string());
                    Ok(())
                }
            }),
        );

        let project = Project::new("p1", "demo");
        let result = registry.call(PROJECT_RESET_BEFORE, &project).await;

        assert!(matches!(result, Err(GuardError::Hook { .. })));
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["1:project.reset.before:p1".to_string()]
        );
        assert_eq!(registry.count(PROJECT_RESET_BEFORE), 3);
    }

    #[tokio::test]
    async fn test_unknown_event_is_noop() {
        let registry = HookRegistry::new();
        let project = Project::new("p1", "demo");
        assert!(registry.call(PROJECT_RESET_AFTER, &project).await.is_ok());
    }
}
