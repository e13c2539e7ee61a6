//! Hook-driven metric emitters.
//!
//! Two after-hooks translate lifecycle callbacks into typed events on the
//! ring buffer. Both are strictly fail-open: a metrics problem is never a
//! request problem, so every publish failure just bumps the health monitor's
//! drop counter and every internal error is swallowed.

use std::sync::Arc;

use aho_corasick::AhoCorasick;
use async_trait::async_trait;

use crate::buffer::RingBuffer;
use crate::error::HookError;
use crate::events::{
    AgentExecutionEvent, EventPayload, HitlEvent, MetricEvent, ToolCallEvent, ToolSource,
    truncate_message,
};
use crate::health::PipelineHealth;
use crate::hooks::hook::{
    AgentHook, AgentResponse, HookContext, ToolCallContext, ToolCallSummary,
};

/// Classify a tool error message into a coarse error class.
///
/// Classes: `timeout`, `connection_error`, `permission_denied`, `not_found`,
/// `unknown`.
pub fn classify_error_class(message: &str) -> &'static str {
    const PATTERNS: &[(&str, &str)] = &[
        ("timeout", "timeout"),
        ("timed out", "timeout"),
        ("deadline", "timeout"),
        ("connection", "connection_error"),
        ("connect", "connection_error"),
        ("refused", "connection_error"),
        ("unreachable", "connection_error"),
        ("permission", "permission_denied"),
        ("unauthorized", "permission_denied"),
        ("forbidden", "permission_denied"),
        ("access denied", "permission_denied"),
        ("not found", "not_found"),
        ("404", "not_found"),
        ("no such", "not_found"),
    ];

    static MATCHER: std::sync::OnceLock<AhoCorasick> = std::sync::OnceLock::new();
    let matcher = MATCHER.get_or_init(|| {
        AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(PATTERNS.iter().map(|(p, _)| *p))
            .unwrap_or_else(|e| unreachable!("static keyword set failed to compile: {e}"))
    });

    matcher
        .find(message)
        .map(|m| PATTERNS[m.pattern().as_usize()].1)
        .unwrap_or("unknown")
}

/// Emits `AgentExecution` and `ToolCall` events from lifecycle callbacks.
pub struct MetricCollectionHook {
    buffer: Arc<RingBuffer<MetricEvent>>,
    health: Arc<PipelineHealth>,
}

impl MetricCollectionHook {
    pub fn new(buffer: Arc<RingBuffer<MetricEvent>>, health: Arc<PipelineHealth>) -> Self {
        Self { buffer, health }
    }

    fn publish(&self, event: MetricEvent) {
        if !self.buffer.publish(event) {
            self.health.record_drop(1);
        }
    }
}

#[async_trait]
impl AgentHook for MetricCollectionHook {
    fn name(&self) -> &str {
        "metrics:collection"
    }

    fn order(&self) -> i32 {
        200
    }

    async fn after_agent_complete(
        &self,
        ctx: &HookContext,
        response: &AgentResponse,
    ) -> Result<(), HookError> {
        let metadata_str = |key: &str| {
            ctx.metadata_value(key)
                .and_then(|v| v.as_str().map(str::to_string))
        };

        let event = AgentExecutionEvent {
            run_id: ctx.run_id.clone(),
            user_id: ctx.user_id.clone(),
            session_id: metadata_str("sessionId"),
            success: response.success,
            tool_count: ctx.tools_used().len() as u32,
            duration_ms: ctx.elapsed().as_millis() as u64,
            llm_duration_ms: ctx.metadata_u64("llmDurationMs").unwrap_or(0),
            tool_duration_ms: ctx.metadata_u64("toolDurationMs").unwrap_or(0),
            guard_duration_ms: ctx.metadata_u64("guardDurationMs").unwrap_or(0),
            queue_wait_ms: ctx.metadata_u64("queueWaitMs").unwrap_or(0),
            error_code: if response.success {
                None
            } else {
                response.error_code.map(|c| c.as_str().to_string())
            },
            persona_id: metadata_str("personaId"),
            intent_category: metadata_str("intentCategory"),
        };

        self.publish(MetricEvent::new(
            ctx.tenant_id(),
            EventPayload::AgentExecution(event),
        ));
        Ok(())
    }

    async fn after_tool_call(
        &self,
        ctx: &ToolCallContext,
        result: &ToolCallSummary,
    ) -> Result<(), HookError> {
        let agent = &ctx.agent;
        let source = agent
            .metadata_value(&format!("toolSource_{}", ctx.tool_name))
            .and_then(|v| v.as_str().map(str::to_string));
        let tool_source = match source.as_deref() {
            Some("mcp") => ToolSource::Mcp,
            _ => ToolSource::Local,
        };
        let mcp_server_name = agent
            .metadata_value(&format!("mcpServer_{}", ctx.tool_name))
            .and_then(|v| v.as_str().map(str::to_string));

        let mut event = ToolCallEvent {
            run_id: agent.run_id.clone(),
            tool_name: ctx.tool_name.clone(),
            tool_source,
            mcp_server_name,
            call_index: ctx.call_index,
            success: result.success,
            duration_ms: result.duration.as_millis() as u64,
            error_class: None,
            error_message: None,
        };
        if let Some(message) = &result.error_message {
            event = event.with_error(classify_error_class(message), message);
        }

        self.publish(MetricEvent::new(
            agent.tenant_id(),
            EventPayload::ToolCall(event),
        ));
        Ok(())
    }
}

/// Emits `Hitl` events from approval metadata left by the HITL layer.
///
/// Keys are `hitlWaitMs_<tool>_<index>`, `hitlApproved_<tool>_<index>`, and
/// `hitlRejectionReason_<tool>_<index>`; indexed keys win over the legacy
/// non-indexed variants. No wait key means no approval flow ran, so the
/// call is skipped silently. A missing approval flag records `false` — the
/// audit trail assumes the worst, never the best.
pub struct HitlEventHook {
    buffer: Arc<RingBuffer<MetricEvent>>,
    health: Arc<PipelineHealth>,
}

impl HitlEventHook {
    pub fn new(buffer: Arc<RingBuffer<MetricEvent>>, health: Arc<PipelineHealth>) -> Self {
        Self { buffer, health }
    }

    /// Read a metadata value preferring the indexed key.
    fn approval_value(
        ctx: &HookContext,
        prefix: &str,
        tool: &str,
        index: u32,
    ) -> Option<serde_json::Value> {
        ctx.metadata_value(&format!("{prefix}_{tool}_{index}"))
            .or_else(|| ctx.metadata_value(&format!("{prefix}_{tool}")))
    }

    fn as_u64(value: &serde_json::Value) -> Option<u64> {
        match value {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_bool(value: &serde_json::Value) -> Option<bool> {
        match value {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

#[async_trait]
impl AgentHook for HitlEventHook {
    fn name(&self) -> &str {
        "metrics:hitl"
    }

    fn order(&self) -> i32 {
        201
    }

    async fn after_tool_call(
        &self,
        ctx: &ToolCallContext,
        _result: &ToolCallSummary,
    ) -> Result<(), HookError> {
        let agent = &ctx.agent;

        let Some(wait_ms) =
            Self::approval_value(agent, "hitlWaitMs", &ctx.tool_name, ctx.call_index)
                .as_ref()
                .and_then(Self::as_u64)
        else {
            // No (numeric) wait time: this call had no approval flow.
            return Ok(());
        };

        let approved =
            Self::approval_value(agent, "hitlApproved", &ctx.tool_name, ctx.call_index)
                .as_ref()
                .and_then(Self::as_bool)
                .unwrap_or(false);

        let rejection_reason =
            Self::approval_value(agent, "hitlRejectionReason", &ctx.tool_name, ctx.call_index)
                .and_then(|v| v.as_str().map(|s| truncate_message(s)));

        let event = MetricEvent::new(
            agent.tenant_id(),
            EventPayload::Hitl(HitlEvent {
                run_id: agent.run_id.clone(),
                tool_name: ctx.tool_name.clone(),
                approved,
                wait_ms,
                rejection_reason,
            }),
        );
        if !self.buffer.publish(event) {
            self.health.record_drop(1);
        }
        Ok(())
    }
}
