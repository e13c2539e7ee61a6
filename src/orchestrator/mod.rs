//! Request orchestrator: guard + hook + metric wiring around the agent core.
//!
//! One `handle()` call is one run. The orchestrator resolves the tenant,
//! builds the shared hook context, runs the before-start hooks and the input
//! guard pipeline, hands control to the external agent core (with a
//! [`ToolBroker`] so every tool call is hook-wrapped), runs the output guard
//! over the response, and finally — on every exit path — runs the
//! after-complete hooks that emit the run's metric events.
//!
//! The whole request is wrapped in a wall-clock deadline. Deadline expiry
//! cancels the body (the future is dropped); the after-complete hooks still
//! run inside a short grace window so the failed run is recorded.

pub mod broker;

pub use broker::ToolBroker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use uuid::Uuid;

use crate::buffer::RingBuffer;
use crate::config::RequestConfig;
use crate::error::{ErrorCode, HookError, LlmError, MessageResolver};
use crate::events::{EventPayload, GuardEvent, MetricEvent};
use crate::guard::output::OutputGuardPipeline;
use crate::guard::{ChatTurn, GuardCommand, GuardPipeline, GuardResult};
use crate::health::PipelineHealth;
use crate::hooks::hook::{AgentResponse, HookContext, HookResult, TENANT_ID_KEY};
use crate::hooks::registry::HookRegistry;
use crate::tenant::{TenantResolver, UsageStore, month_key};
use crate::tools::ToolRegistry;

/// One inbound agent request, as handed over by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub text: String,
    pub channel: Option<String>,
    /// `X-Tenant-Id` header value, when present.
    pub tenant_header: Option<String>,
    /// Tenant attribute set by upstream middleware.
    pub ambient_tenant: Option<String>,
    pub session_id: Option<String>,
    pub prompt_template_id: Option<String>,
    pub conversation_history: Vec<ChatTurn>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant_header(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_header = Some(tenant.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// What the external agent core produced for a run.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub content: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl AgentOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: None,
            provider: None,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

/// Failures the agent core can surface.
#[derive(Debug, thiserror::Error)]
pub enum AgentCoreError {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Hook failure: {0}")]
    Hook(#[from] HookError),

    #[error("Tool failure: {message}")]
    Tool { message: String },

    #[error("Downstream circuit breaker open: {service}")]
    CircuitOpen { service: String },

    #[error("Agent core failure: {0}")]
    Internal(String),
}

impl AgentCoreError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AgentCoreError::Llm(e) => e.error_code(),
            AgentCoreError::Hook(_) => ErrorCode::HookRejected,
            AgentCoreError::Tool { .. } => ErrorCode::ToolError,
            AgentCoreError::CircuitOpen { .. } => ErrorCode::CircuitBreakerOpen,
            AgentCoreError::Internal(_) => ErrorCode::Unknown,
        }
    }
}

/// The external agent (ReAct loop, single-shot, whatever the deployment
/// uses). It receives the shared context and a broker for tool access.
#[async_trait]
pub trait AgentCore: Send + Sync {
    async fn execute(
        &self,
        ctx: &Arc<HookContext>,
        tools: &ToolBroker,
    ) -> Result<AgentOutput, AgentCoreError>;
}

/// Composes guards, hooks, tenancy, and metrics around the agent core.
pub struct RequestOrchestrator {
    core: Arc<dyn AgentCore>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookRegistry>,
    input_guard: Arc<GuardPipeline>,
    output_guard: Arc<OutputGuardPipeline>,
    buffer: Arc<RingBuffer<MetricEvent>>,
    health: Arc<PipelineHealth>,
    resolver: TenantResolver,
    usage: Option<Arc<dyn UsageStore>>,
    messages: Arc<dyn MessageResolver>,
    config: RequestConfig,
}

impl RequestOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: Arc<dyn AgentCore>,
        tools: Arc<ToolRegistry>,
        hooks: Arc<HookRegistry>,
        input_guard: Arc<GuardPipeline>,
        output_guard: Arc<OutputGuardPipeline>,
        buffer: Arc<RingBuffer<MetricEvent>>,
        health: Arc<PipelineHealth>,
        resolver: TenantResolver,
        messages: Arc<dyn MessageResolver>,
        config: RequestConfig,
    ) -> Self {
        Self {
            core,
            tools,
            hooks,
            input_guard,
            output_guard,
            buffer,
            health,
            resolver,
            usage: None,
            messages,
            config,
        }
    }

    /// Record successful runs against the tenant's monthly usage.
    pub fn with_usage_store(mut self, usage: Arc<dyn UsageStore>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Handle one request end to end.
    pub async fn handle(&self, request: AgentRequest) -> AgentResponse {
        let run_id = Uuid::new_v4().to_string();
        let ctx = Arc::new(self.build_context(&run_id, &request));

        let response = match tokio::time::timeout(
            self.config.timeout,
            self.run(&run_id, &ctx),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => {
                tracing::warn!(run_id = %run_id, timeout_ms = self.config.timeout.as_millis() as u64, "Request deadline expired");
                self.failure(&run_id, ErrorCode::Timeout, None)
            }
        };

        // After-complete hooks always run, even for failed or timed-out
        // runs, inside a grace window so a wedged hook cannot hold the
        // request open.
        let completion = tokio::time::timeout(
            self.config.completion_grace,
            self.hooks.run_after_agent_complete(&ctx, &response),
        )
        .await;
        match completion {
            Ok(Err(e)) => {
                tracing::warn!(run_id = %run_id, error = %e, "after_agent_complete hook failed")
            }
            Err(_) => {
                tracing::warn!(run_id = %run_id, "after_agent_complete hooks exceeded grace window")
            }
            Ok(Ok(())) => {}
        }

        if response.success {
            if let Some(usage) = &self.usage {
                let tokens = (response.prompt_tokens + response.completion_tokens) as i64;
                usage
                    .record_request(&ctx.tenant_id(), &month_key(chrono::Utc::now()), tokens)
                    .await;
            }
        }

        response
    }

    fn build_context(&self, run_id: &str, request: &AgentRequest) -> HookContext {
        let user_id = request
            .user_id
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());
        let ctx = HookContext::new(run_id, user_id, request.text.clone())
            .with_channel(request.channel.clone())
            .with_user_email(request.user_email.clone());

        ctx.merge_metadata(request.metadata.clone());

        let tenant_id = self.resolver.resolve(
            request.tenant_header.as_deref(),
            request.ambient_tenant.as_deref(),
        );
        ctx.set_metadata(TENANT_ID_KEY, serde_json::json!(tenant_id));
        if let Some(session_id) = &request.session_id {
            ctx.set_metadata("sessionId", serde_json::json!(session_id));
        }
        if let Some(template_id) = &request.prompt_template_id {
            ctx.set_metadata("promptTemplateId", serde_json::json!(template_id));
        }
        if !request.conversation_history.is_empty() {
            if let Ok(history) = serde_json::to_value(&request.conversation_history) {
                ctx.set_metadata("conversationHistory", history);
            }
        }
        ctx
    }

    async fn run(&self, run_id: &str, ctx: &Arc<HookContext>) -> AgentResponse {
        // 1. Before-start hooks (quota enforcement lives here at order 5).
        match self.hooks.run_before_agent_start(ctx).await {
            Ok(None) => {}
            Ok(Some(outcome)) => match outcome.result {
                HookResult::Continue => {}
                HookResult::Reject { reason } => {
                    let code =
                        if outcome.hook_name == crate::tenant::quota::QUOTA_ENFORCER_HOOK_NAME {
                            ErrorCode::QuotaExceeded
                        } else {
                            ErrorCode::HookRejected
                        };
                    return self.failure(run_id, code, Some(&reason));
                }
                HookResult::Modify { modified_params } => {
                    apply_start_modification(ctx, modified_params);
                }
                HookResult::PendingApproval {
                    approval_id,
                    message,
                } => {
                    let mut response = AgentResponse::success(run_id, "");
                    response.success = false;
                    response.pending_approval =
                        Some(crate::hooks::hook::PendingApproval {
                            approval_id,
                            message,
                        });
                    return response;
                }
            },
            Err(e) => {
                return self.failure(run_id, ErrorCode::HookRejected, Some(&e.to_string()));
            }
        }

        // 2. Input guard pipeline over the (possibly hook-modified) prompt.
        let command = GuardCommand {
            user_id: ctx.user_id.clone(),
            text: ctx.user_prompt(),
            channel: ctx.channel.clone(),
            metadata: ctx.metadata_snapshot(),
        };
        let guard_started = Instant::now();
        let verdict = self.input_guard.evaluate(&command).await;
        ctx.set_metadata(
            "guardDurationMs",
            serde_json::json!(guard_started.elapsed().as_millis() as u64),
        );

        match verdict.result {
            GuardResult::Allowed { .. } => {
                ctx.set_user_prompt(verdict.final_text);
            }
            GuardResult::Rejected {
                reason,
                category,
                stage,
            } => {
                self.emit_guard_event(ctx, &stage, category.as_str(), &reason, false);
                return self.failure(run_id, category.error_code(), Some(&reason));
            }
        }

        // 3. The agent core does its work through the broker.
        let broker = ToolBroker::new(
            Arc::clone(&self.tools),
            Arc::clone(&self.hooks),
            Arc::clone(ctx),
        );
        let output = match self.core.execute(ctx, &broker).await {
            Ok(output) => output,
            Err(e) => {
                let original = e.to_string();
                return self.failure(run_id, e.error_code(), Some(&original));
            }
        };

        // 4. Output guard over the response content. For streaming
        // transports this is the single post-completion pass over the
        // collected output.
        let output_verdict = self.output_guard.evaluate(&output.content).await;
        if let Some((reason, category, stage)) = output_verdict.rejection {
            self.emit_guard_event(ctx, &stage, category.as_str(), &reason, true);
            return self.failure(run_id, category.error_code(), Some(&reason));
        }

        let mut response = AgentResponse::success(run_id, output_verdict.content);
        response.model = output.model;
        response.provider = output.provider;
        response.prompt_tokens = output.prompt_tokens;
        response.completion_tokens = output.completion_tokens;
        response
    }

    fn failure(&self, run_id: &str, code: ErrorCode, original: Option<&str>) -> AgentResponse {
        AgentResponse::failure(run_id, code, self.messages.resolve(code, original))
    }

    fn emit_guard_event(
        &self,
        ctx: &HookContext,
        stage: &str,
        category: &str,
        reason: &str,
        is_output_guard: bool,
    ) {
        let event = MetricEvent::new(
            ctx.tenant_id(),
            EventPayload::Guard(
                GuardEvent {
                    stage: stage.to_string(),
                    category: category.to_string(),
                    reason_detail: None,
                    is_output_guard,
                    action: Some("rejected".to_string()),
                }
                .with_reason(reason),
            ),
        );
        if !self.buffer.publish(event) {
            self.health.record_drop(1);
        }
    }
}

impl std::fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("timeout", &self.config.timeout)
            .finish()
    }
}

/// Apply a before-start `Modify` payload: `userPrompt` replaces the prompt,
/// `metadata` merges into the context map.
fn apply_start_modification(ctx: &HookContext, modified: serde_json::Value) {
    if let Some(prompt) = modified.get("userPrompt").and_then(|v| v.as_str()) {
        ctx.set_user_prompt(prompt);
    }
    if let Some(serde_json::Value::Object(entries)) = modified.get("metadata") {
        ctx.merge_metadata(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
    }
}
