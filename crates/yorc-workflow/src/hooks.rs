//! Pre/post activity hooks (§4.6.5). Hook failures are logged and never
//! affect step status.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ActivityHookContext {
    pub task_id: String,
    pub deployment_id: String,
    pub step_name: String,
    pub node: String,
}

#[derive(Debug, Error)]
#[error("activity hook failed: {0}")]
pub struct HookError(pub String);

#[async_trait]
pub trait ActivityHook: Send + Sync {
    async fn before(&self, _ctx: &ActivityHookContext) -> Result<(), HookError> {
        Ok(())
    }
    async fn after(&self, _ctx: &ActivityHookContext) -> Result<(), HookError> {
        Ok(())
    }
}

pub(crate) async fn run_pre_hooks(hooks: &[Arc<dyn ActivityHook>], ctx: &ActivityHookContext) {
    for hook in hooks {
        if let Err(e) = hook.before(ctx).await {
            tracing::warn!(step = %ctx.step_name, "pre-hook failed: {e}");
        }
    }
}

pub(crate) async fn run_post_hooks(hooks: &[Arc<dyn ActivityHook>], ctx: &ActivityHookContext) {
    for hook in hooks {
        if let Err(e) = hook.after(ctx).await {
            tracing::warn!(step = %ctx.step_name, "post-hook failed: {e}");
        }
    }
}
