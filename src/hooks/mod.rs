//! Lifecycle hooks around agent execution and tool invocation.
//!
//! Four extension points:
//!
//! - **before_agent_start** — may reject, rewrite the prompt/metadata, or
//!   park the request pending approval
//! - **before_tool_call** — may skip or rewrite one tool invocation
//! - **after_tool_call** — observation only
//! - **after_agent_complete** — observation only; always runs, even when the
//!   request failed
//!
//! Hooks are filtered by `enabled` and sorted by `order` once at registry
//! construction. *Before* points short-circuit on the first non-`Continue`
//! result; *after* points run every handler and swallow errors unless the
//! handler declares `fail_on_error`.

pub mod hook;
pub mod registry;

pub use hook::{
    AgentHook, AgentResponse, HookContext, HookResult, PendingApproval, ToolCallContext,
    ToolCallSummary,
};
pub use registry::HookRegistry;
