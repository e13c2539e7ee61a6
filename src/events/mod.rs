//! Typed metric events.
//!
//! Every operational signal the platform records — agent executions, tool
//! calls, token usage, guard decisions, quota actions, HITL approvals, MCP
//! health — is one [`MetricEvent`]: a shared envelope (`event_id`,
//! `tenant_id`, `timestamp`) around a tagged payload. The envelope timestamp
//! is the authoring time, never the persist time. Adding a payload variant is
//! a compile error at every match site, which is the point.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error messages on events are truncated to this many characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Truncate a message to [`MAX_ERROR_MESSAGE_CHARS`] characters.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        message.to_string()
    } else {
        message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
    }
}

/// One recorded metric event with its tenant scope and authoring time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub event_id: Uuid,
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl MetricEvent {
    /// Create a new event authored now.
    pub fn new(tenant_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Stable payload type tag (`agent_execution`, `tool_call`, ...).
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// The run this event belongs to, when the payload carries one.
    pub fn run_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::AgentExecution(e) => Some(&e.run_id),
            EventPayload::ToolCall(e) => Some(&e.run_id),
            EventPayload::TokenUsage(e) => Some(&e.run_id),
            EventPayload::Hitl(e) => Some(&e.run_id),
            EventPayload::Guard(_) | EventPayload::Quota(_) | EventPayload::McpHealth(_) => None,
        }
    }
}

/// Tagged payload of a [`MetricEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    AgentExecution(AgentExecutionEvent),
    ToolCall(ToolCallEvent),
    TokenUsage(TokenUsageEvent),
    Guard(GuardEvent),
    Quota(QuotaEvent),
    Hitl(HitlEvent),
    McpHealth(McpHealthEvent),
}

impl EventPayload {
    /// Stable type tag used in the store schema and ingest routes.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::AgentExecution(_) => "agent_execution",
            EventPayload::ToolCall(_) => "tool_call",
            EventPayload::TokenUsage(_) => "token_usage",
            EventPayload::Guard(_) => "guard",
            EventPayload::Quota(_) => "quota",
            EventPayload::Hitl(_) => "hitl",
            EventPayload::McpHealth(_) => "mcp_health",
        }
    }
}

/// One agent execution, emitted on completion (success or failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecutionEvent {
    pub run_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub success: bool,
    pub tool_count: u32,
    pub duration_ms: u64,
    pub llm_duration_ms: u64,
    pub tool_duration_ms: u64,
    pub guard_duration_ms: u64,
    pub queue_wait_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_category: Option<String>,
}

/// Where a tool is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Local,
    Mcp,
}

/// One tool invocation within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub run_id: String,
    pub tool_name: String,
    pub tool_source: ToolSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_server_name: Option<String>,
    pub call_index: u32,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ToolCallEvent {
    /// Attach a truncated error message.
    pub fn with_error(mut self, class: impl Into<String>, message: &str) -> Self {
        self.error_class = Some(class.into());
        self.error_message = Some(truncate_message(message));
        self
    }
}

/// Token usage for one LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageEvent {
    pub run_id: String,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: Decimal,
}

impl TokenUsageEvent {
    /// Build a usage event; `total_tokens` is always derived, never passed.
    pub fn new(
        run_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            model: model.into(),
            provider: provider.into(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            estimated_cost_usd: Decimal::ZERO,
        }
    }
}

/// One guard stage decision worth recording (typically a rejection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardEvent {
    pub stage: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_detail: Option<String>,
    pub is_output_guard: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl GuardEvent {
    /// Attach a truncated reason detail.
    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason_detail = Some(truncate_message(reason));
        self
    }
}

/// Quota enforcement action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaAction {
    RejectedRequests,
    RejectedTokens,
    RejectedSuspended,
    Warning,
}

impl QuotaAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaAction::RejectedRequests => "rejected_requests",
            QuotaAction::RejectedTokens => "rejected_tokens",
            QuotaAction::RejectedSuspended => "rejected_suspended",
            QuotaAction::Warning => "warning",
        }
    }
}

/// A quota decision against a tenant's monthly window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaEvent {
    pub action: QuotaAction,
    pub current_requests: i64,
    pub current_tokens: i64,
    pub quota_requests: i64,
    pub quota_tokens: i64,
    pub usage_percent: f64,
}

/// A human-in-the-loop approval outcome for one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlEvent {
    pub run_id: String,
    pub tool_name: String,
    pub approved: bool,
    pub wait_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// Health probe result for an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpHealthEvent {
    pub server_name: String,
    pub status: String,
    pub response_time_ms: u64,
    pub tool_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
