//! Tool broker: hook-wrapped tool execution for the agent core.
//!
//! The agent core never calls tools directly; it asks the broker, which
//! assigns the call index, runs the before/after tool hooks, and keeps the
//! shared run context up to date. Parallel batches are a structured join:
//! every branch runs to completion (so its after-hooks fire) before the
//! aggregate result is decided.

use std::sync::Arc;
use std::time::Instant;

use crate::error::HookError;
use crate::hooks::hook::{HookContext, HookResult, ToolCallContext, ToolCallSummary};
use crate::hooks::registry::HookRegistry;
use crate::tools::{ToolRegistry, is_tool_error};

/// Hook-wrapped tool dispatch for one run.
pub struct ToolBroker {
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookRegistry>,
    ctx: Arc<HookContext>,
}

impl ToolBroker {
    pub fn new(tools: Arc<ToolRegistry>, hooks: Arc<HookRegistry>, ctx: Arc<HookContext>) -> Self {
        Self { tools, hooks, ctx }
    }

    /// The shared run context.
    pub fn context(&self) -> &Arc<HookContext> {
        &self.ctx
    }

    /// Execute one tool call with its hook envelope.
    ///
    /// Business failures (including hook rejections and unknown tools) come
    /// back inside the summary; `Err` is reserved for `fail_on_error` hooks.
    pub async fn call_tool(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<ToolCallSummary, HookError> {
        let call_index = self.ctx.next_call_index();
        let mut tool_ctx = ToolCallContext {
            agent: Arc::clone(&self.ctx),
            tool_name: name.to_string(),
            tool_params: params,
            call_index,
        };

        match self.hooks.run_before_tool_call(&tool_ctx).await? {
            None => {}
            Some(outcome) => match outcome.result {
                HookResult::Continue => {}
                HookResult::Modify { modified_params } => {
                    tracing::debug!(
                        tool = name,
                        hook = %outcome.hook_name,
                        "Tool params modified by hook"
                    );
                    tool_ctx.tool_params = modified_params;
                }
                HookResult::Reject { reason } => {
                    // Skips only this call; the run continues.
                    tracing::info!(tool = name, hook = %outcome.hook_name, reason = %reason, "Tool call rejected by hook");
                    return self
                        .finish_skipped(tool_ctx, format!("rejected by hook: {reason}"))
                        .await;
                }
                HookResult::PendingApproval { message, .. } => {
                    return self
                        .finish_skipped(tool_ctx, format!("pending approval: {message}"))
                        .await;
                }
            },
        }

        let started = Instant::now();
        let output = match self.tools.get(name) {
            Some(tool) => tool.call(tool_ctx.tool_params.clone()).await,
            None => format!("Error: tool not found: {name}"),
        };
        let duration = started.elapsed();

        self.ctx.record_tool(name);
        self.ctx
            .add_metadata_u64("toolDurationMs", duration.as_millis() as u64);

        let success = !is_tool_error(&output);
        let summary = ToolCallSummary {
            success,
            error_message: if success { None } else { Some(output.clone()) },
            output,
            duration,
        };

        self.hooks.run_after_tool_call(&tool_ctx, &summary).await?;
        Ok(summary)
    }

    /// A skipped call still runs its after-hooks so the skip is observable.
    async fn finish_skipped(
        &self,
        tool_ctx: ToolCallContext,
        reason: String,
    ) -> Result<ToolCallSummary, HookError> {
        let summary = ToolCallSummary {
            success: false,
            output: String::new(),
            error_message: Some(format!("Error: {reason}")),
            duration: std::time::Duration::ZERO,
        };
        self.hooks.run_after_tool_call(&tool_ctx, &summary).await?;
        Ok(summary)
    }

    /// Execute a batch of tool calls concurrently.
    ///
    /// All branches complete (their after-hooks run) before this returns;
    /// if any branch failed with a hook error, the first such error is
    /// returned after the join.
    pub async fn call_parallel(
        &self,
        calls: Vec<(String, serde_json::Value)>,
    ) -> Result<Vec<ToolCallSummary>, HookError> {
        let futures = calls
            .into_iter()
            .map(|(name, params)| async move { self.call_tool(&name, params).await });
        let results = futures::future::join_all(futures).await;

        let mut summaries = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(summaries),
        }
    }
}

impl std::fmt::Debug for ToolBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBroker")
            .field("run_id", &self.ctx.run_id)
            .finish()
    }
}
