//! Ordered hook dispatch.

use std::sync::Arc;

use crate::error::HookError;
use crate::hooks::hook::{
    AgentHook, AgentResponse, HookContext, HookResult, ToolCallContext, ToolCallSummary,
};

/// A short-circuiting outcome from a *before* pipeline: which hook decided,
/// and what it decided.
#[derive(Debug, Clone)]
pub struct BeforeOutcome {
    pub hook_name: String,
    pub result: HookResult,
}

/// Immutable, ordered collection of hooks.
///
/// Disabled hooks are dropped and the rest sorted by `order()` once, at
/// construction. Dispatch order is therefore fixed for the registry's
/// lifetime.
pub struct HookRegistry {
    hooks: Vec<Arc<dyn AgentHook>>,
}

impl HookRegistry {
    pub fn new(mut hooks: Vec<Arc<dyn AgentHook>>) -> Self {
        hooks.retain(|h| h.enabled());
        hooks.sort_by_key(|h| h.order());
        Self { hooks }
    }

    /// Registry with no hooks; useful in tests and minimal deployments.
    pub fn empty() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Hook names in dispatch order.
    pub fn hook_names(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.name().to_string()).collect()
    }

    /// Run `before_agent_start` hooks in order.
    ///
    /// Returns the first non-`Continue` result, or `None` when every hook
    /// continued. Hook errors are logged and skipped (fail-open) unless the
    /// hook declares `fail_on_error`.
    pub async fn run_before_agent_start(
        &self,
        ctx: &HookContext,
    ) -> Result<Option<BeforeOutcome>, HookError> {
        for hook in &self.hooks {
            match hook.before_agent_start(ctx).await {
                Ok(HookResult::Continue) => {}
                Ok(result) => {
                    return Ok(Some(BeforeOutcome {
                        hook_name: hook.name().to_string(),
                        result,
                    }));
                }
                Err(e) => {
                    if hook.fail_on_error() {
                        return Err(e);
                    }
                    tracing::warn!(hook = hook.name(), error = %e, "before_agent_start hook failed, continuing");
                }
            }
        }
        Ok(None)
    }

    /// Run `before_tool_call` hooks in order; same short-circuit contract as
    /// [`Self::run_before_agent_start`].
    pub async fn run_before_tool_call(
        &self,
        ctx: &ToolCallContext,
    ) -> Result<Option<BeforeOutcome>, HookError> {
        for hook in &self.hooks {
            match hook.before_tool_call(ctx).await {
                Ok(HookResult::Continue) => {}
                Ok(result) => {
                    return Ok(Some(BeforeOutcome {
                        hook_name: hook.name().to_string(),
                        result,
                    }));
                }
                Err(e) => {
                    if hook.fail_on_error() {
                        return Err(e);
                    }
                    tracing::warn!(hook = hook.name(), error = %e, "before_tool_call hook failed, continuing");
                }
            }
        }
        Ok(None)
    }

    /// Run every `after_tool_call` hook. Errors are swallowed per hook
    /// unless it declares `fail_on_error`.
    pub async fn run_after_tool_call(
        &self,
        ctx: &ToolCallContext,
        result: &ToolCallSummary,
    ) -> Result<(), HookError> {
        for hook in &self.hooks {
            if let Err(e) = hook.after_tool_call(ctx, result).await {
                if hook.fail_on_error() {
                    return Err(e);
                }
                tracing::warn!(hook = hook.name(), error = %e, "after_tool_call hook failed, continuing");
            }
        }
        Ok(())
    }

    /// Run every `after_agent_complete` hook; same error contract as
    /// [`Self::run_after_tool_call`].
    pub async fn run_after_agent_complete(
        &self,
        ctx: &HookContext,
        response: &AgentResponse,
    ) -> Result<(), HookError> {
        for hook in &self.hooks {
            if let Err(e) = hook.after_agent_complete(ctx, response).await {
                if hook.fail_on_error() {
                    return Err(e);
                }
                tracing::warn!(hook = hook.name(), error = %e, "after_agent_complete hook failed, continuing");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.hook_names())
            .finish()
    }
}
