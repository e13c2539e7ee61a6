//! Guard pipelines: ordered safety checks around agent requests.
//!
//! The input pipeline runs every request through an ordered chain of stages
//! (normalization, rate limiting, validation, injection detection, optional
//! classification and topic-drift). The first rejection wins; a stage error
//! is itself a rejection (`SystemError`) — guards fail close, because a
//! programming error must never become a bypass.
//!
//! Stages communicate forward through hints: an `Allowed` result carrying a
//! `normalized:<text>` hint replaces the command text for later stages.
//!
//! The output pipeline (see [`output`]) applies the same discipline to LLM
//! responses, with an extra `Modified` outcome for masking.

pub mod classify;
pub mod injection;
pub mod output;
pub mod rate_limit;
pub mod rules;
pub mod topic_drift;
pub mod unicode;
pub mod validation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::buffer::RingBuffer;
use crate::error::{ErrorCode, GuardError};
use crate::events::{EventPayload, GuardEvent, MetricEvent};
use crate::health::PipelineHealth;

/// Hint prefix a stage uses to hand later stages a rewritten text.
pub const NORMALIZED_HINT_PREFIX: &str = "normalized:";

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCategory {
    RateLimited,
    InvalidInput,
    PromptInjection,
    OffTopic,
    Unauthorized,
    SystemError,
}

impl RejectCategory {
    /// Stable wire representation (`rate_limited`, `prompt_injection`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCategory::RateLimited => "rate_limited",
            RejectCategory::InvalidInput => "invalid_input",
            RejectCategory::PromptInjection => "prompt_injection",
            RejectCategory::OffTopic => "off_topic",
            RejectCategory::Unauthorized => "unauthorized",
            RejectCategory::SystemError => "system_error",
        }
    }

    /// Map a guard rejection onto the result error taxonomy.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RejectCategory::RateLimited => ErrorCode::RateLimited,
            _ => ErrorCode::GuardRejected,
        }
    }
}

impl std::fmt::Display for RejectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of prior conversation, as carried in command metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// The request under inspection.
#[derive(Debug, Clone)]
pub struct GuardCommand {
    pub user_id: String,
    pub text: String,
    pub channel: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl GuardCommand {
    /// New command for the given text; `user_id` defaults to `"anonymous"`.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            user_id: "anonymous".to_string(),
            text: text.into(),
            channel: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Tenant scope of this command, defaulting to `"default"`.
    pub fn tenant_id(&self) -> &str {
        self.metadata
            .get("tenantId")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
    }

    /// Prior conversation turns, when the caller provided them.
    pub fn conversation_history(&self) -> Vec<ChatTurn> {
        self.metadata
            .get("conversationHistory")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Outcome of one guard stage.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardResult {
    Allowed {
        hints: Vec<String>,
    },
    Rejected {
        reason: String,
        category: RejectCategory,
        /// Stamped by the pipeline with the rejecting stage's name.
        stage: String,
    },
}

impl GuardResult {
    pub fn allowed() -> Self {
        GuardResult::Allowed { hints: Vec::new() }
    }

    pub fn allowed_with_hint(hint: impl Into<String>) -> Self {
        GuardResult::Allowed {
            hints: vec![hint.into()],
        }
    }

    pub fn rejected(reason: impl Into<String>, category: RejectCategory) -> Self {
        GuardResult::Rejected {
            reason: reason.into(),
            category,
            stage: String::new(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardResult::Allowed { .. })
    }
}

/// One check in the input pipeline.
#[async_trait]
pub trait GuardStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Position in the pipeline; lower runs first.
    fn order(&self) -> i32;

    fn enabled(&self) -> bool {
        true
    }

    async fn check(&self, command: &GuardCommand) -> Result<GuardResult, GuardError>;
}

/// One audit record per stage invocation.
#[derive(Debug, Clone, Serialize)]
pub struct StageAudit {
    pub stage: String,
    /// `allowed`, `rejected`, or `error`.
    pub outcome: &'static str,
    pub category: Option<RejectCategory>,
    pub latency_ms: u64,
    pub is_output_guard: bool,
}

/// Receives one record per stage invocation.
pub trait GuardAuditSink: Send + Sync {
    fn record(&self, audit: &StageAudit);
}

/// Audit sink that logs structured events via `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl GuardAuditSink for TracingAuditSink {
    fn record(&self, audit: &StageAudit) {
        tracing::info!(
            stage = %audit.stage,
            outcome = audit.outcome,
            category = audit.category.map(|c| c.as_str()),
            latency_ms = audit.latency_ms,
            output_guard = audit.is_output_guard,
            "Guard stage evaluated"
        );
    }
}

/// Audit sink that publishes guard rejections as metric events.
///
/// Allowed stages are not published — one metric per stage per request would
/// drown the buffer; rejections are the signal.
pub struct BufferAuditSink {
    buffer: Arc<RingBuffer<MetricEvent>>,
    health: Arc<PipelineHealth>,
    tenant_id: String,
}

impl BufferAuditSink {
    pub fn new(
        buffer: Arc<RingBuffer<MetricEvent>>,
        health: Arc<PipelineHealth>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            buffer,
            health,
            tenant_id: tenant_id.into(),
        }
    }
}

impl GuardAuditSink for BufferAuditSink {
    fn record(&self, audit: &StageAudit) {
        if audit.outcome == "allowed" {
            return;
        }
        let event = MetricEvent::new(
            self.tenant_id.clone(),
            EventPayload::Guard(GuardEvent {
                stage: audit.stage.clone(),
                category: audit
                    .category
                    .unwrap_or(RejectCategory::SystemError)
                    .as_str()
                    .to_string(),
                reason_detail: None,
                is_output_guard: audit.is_output_guard,
                action: None,
            }),
        );
        if !self.buffer.publish(event) {
            self.health.record_drop(1);
        }
    }
}

/// Final verdict of an input pipeline evaluation.
#[derive(Debug, Clone)]
pub struct GuardVerdict {
    pub result: GuardResult,
    /// Command text after normalization hints were applied.
    pub final_text: String,
    pub total_latency_ms: u64,
}

/// Ordered, fail-close input guard pipeline.
pub struct GuardPipeline {
    stages: Vec<Arc<dyn GuardStage>>,
    audit: Option<Arc<dyn GuardAuditSink>>,
}

impl GuardPipeline {
    /// Build a pipeline: disabled stages are dropped and the rest sorted by
    /// `order()` once, here.
    pub fn new(stages: Vec<Arc<dyn GuardStage>>) -> Self {
        Self::with_audit_sink(stages, None)
    }

    pub fn with_audit_sink(
        mut stages: Vec<Arc<dyn GuardStage>>,
        audit: Option<Arc<dyn GuardAuditSink>>,
    ) -> Self {
        stages.retain(|s| s.enabled());
        stages.sort_by_key(|s| s.order());
        Self { stages, audit }
    }

    /// Names of active stages in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the command through every stage in order.
    ///
    /// The first `Rejected` is returned (stamped with the stage name) and no
    /// later stage runs. A stage error also rejects, as `SystemError`.
    pub async fn evaluate(&self, command: &GuardCommand) -> GuardVerdict {
        let started = Instant::now();
        let mut current = command.clone();

        for stage in &self.stages {
            let stage_started = Instant::now();
            let checked = stage.check(&current).await;
            let latency_ms = stage_started.elapsed().as_millis() as u64;

            match checked {
                Ok(GuardResult::Allowed { hints }) => {
                    self.record_audit(stage.name(), "allowed", None, latency_ms);
                    for hint in &hints {
                        if let Some(normalized) = hint.strip_prefix(NORMALIZED_HINT_PREFIX) {
                            current.text = normalized.to_string();
                        }
                    }
                }
                Ok(GuardResult::Rejected {
                    reason, category, ..
                }) => {
                    self.record_audit(stage.name(), "rejected", Some(category), latency_ms);
                    tracing::info!(
                        stage = stage.name(),
                        category = category.as_str(),
                        reason = %reason,
                        "Guard rejected request"
                    );
                    return GuardVerdict {
                        result: GuardResult::Rejected {
                            reason,
                            category,
                            stage: stage.name().to_string(),
                        },
                        final_text: current.text,
                        total_latency_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(e) => {
                    // Fail close: a broken stage must not become a bypass.
                    self.record_audit(
                        stage.name(),
                        "error",
                        Some(RejectCategory::SystemError),
                        latency_ms,
                    );
                    tracing::error!(stage = stage.name(), error = %e, "Guard stage failed");
                    return GuardVerdict {
                        result: GuardResult::Rejected {
                            reason: format!("guard stage failed: {e}"),
                            category: RejectCategory::SystemError,
                            stage: stage.name().to_string(),
                        },
                        final_text: current.text,
                        total_latency_ms: started.elapsed().as_millis() as u64,
                    };
                }
            }
        }

        GuardVerdict {
            result: GuardResult::allowed(),
            final_text: current.text,
            total_latency_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn record_audit(
        &self,
        stage: &str,
        outcome: &'static str,
        category: Option<RejectCategory>,
        latency_ms: u64,
    ) {
        if let Some(sink) = &self.audit {
            sink.record(&StageAudit {
                stage: stage.to_string(),
                outcome,
                category,
                latency_ms,
                is_output_guard: false,
            });
        }
    }
}

impl std::fmt::Debug for GuardPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardPipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StaticStage {
        name: &'static str,
        order: i32,
        enabled: bool,
        result: fn(&GuardCommand) -> Result<GuardResult, GuardError>,
    }

    #[async_trait]
    impl GuardStage for StaticStage {
        fn name(&self) -> &'static str {
            self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        async fn check(&self, command: &GuardCommand) -> Result<GuardResult, GuardError> {
            (self.result)(command)
        }
    }

    fn allow(_: &GuardCommand) -> Result<GuardResult, GuardError> {
        Ok(GuardResult::allowed())
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<StageAudit>>);

    impl GuardAuditSink for RecordingSink {
        fn record(&self, audit: &StageAudit) {
            self.0.lock().unwrap().push(audit.clone());
        }
    }

    #[tokio::test]
    async fn stages_run_in_order_and_first_reject_wins() {
        let pipeline = GuardPipeline::new(vec![
            Arc::new(StaticStage {
                name: "second",
                order: 10,
                enabled: true,
                result: |_| Ok(GuardResult::rejected("blocked", RejectCategory::OffTopic)),
            }),
            Arc::new(StaticStage {
                name: "first",
                order: 0,
                enabled: true,
                result: allow,
            }),
            Arc::new(StaticStage {
                name: "third",
                order: 20,
                enabled: true,
                result: |_| {
                    panic!("must not run after a rejection");
                },
            }),
        ]);

        assert_eq!(pipeline.stage_names(), vec!["first", "second", "third"]);

        let verdict = pipeline.evaluate(&GuardCommand::new("hello")).await;
        match verdict.result {
            GuardResult::Rejected {
                stage, category, ..
            } => {
                assert_eq!(stage, "second");
                assert_eq!(category, RejectCategory::OffTopic);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_stages_are_skipped() {
        let pipeline = GuardPipeline::new(vec![
            Arc::new(StaticStage {
                name: "disabled",
                order: 0,
                enabled: false,
                result: |_| Ok(GuardResult::rejected("no", RejectCategory::InvalidInput)),
            }),
            Arc::new(StaticStage {
                name: "active",
                order: 1,
                enabled: true,
                result: allow,
            }),
        ]);

        assert_eq!(pipeline.stage_names(), vec!["active"]);
        let verdict = pipeline.evaluate(&GuardCommand::new("hello")).await;
        assert!(verdict.result.is_allowed());
    }

    #[tokio::test]
    async fn normalized_hint_rewrites_text_for_later_stages() {
        let pipeline = GuardPipeline::new(vec![
            Arc::new(StaticStage {
                name: "normalizer",
                order: 0,
                enabled: true,
                result: |_| Ok(GuardResult::allowed_with_hint("normalized:cleaned text")),
            }),
            Arc::new(StaticStage {
                name: "checker",
                order: 1,
                enabled: true,
                result: |cmd| {
                    assert_eq!(cmd.text, "cleaned text");
                    Ok(GuardResult::allowed())
                },
            }),
        ]);

        let verdict = pipeline.evaluate(&GuardCommand::new("raw TEXT")).await;
        assert!(verdict.result.is_allowed());
        assert_eq!(verdict.final_text, "cleaned text");
    }

    #[tokio::test]
    async fn stage_error_fails_closed() {
        let pipeline = GuardPipeline::new(vec![Arc::new(StaticStage {
            name: "broken",
            order: 0,
            enabled: true,
            result: |_| {
                Err(GuardError::StageFailed {
                    reason: "boom".into(),
                })
            },
        })]);

        let verdict = pipeline.evaluate(&GuardCommand::new("hello")).await;
        match verdict.result {
            GuardResult::Rejected {
                category, stage, ..
            } => {
                assert_eq!(category, RejectCategory::SystemError);
                assert_eq!(stage, "broken");
            }
            other => panic!("expected SystemError rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn audit_sink_sees_every_invocation() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = GuardPipeline::with_audit_sink(
            vec![
                Arc::new(StaticStage {
                    name: "a",
                    order: 0,
                    enabled: true,
                    result: allow,
                }),
                Arc::new(StaticStage {
                    name: "b",
                    order: 1,
                    enabled: true,
                    result: |_| Ok(GuardResult::rejected("nope", RejectCategory::InvalidInput)),
                }),
            ],
            Some(Arc::clone(&sink) as Arc<dyn GuardAuditSink>),
        );

        pipeline.evaluate(&GuardCommand::new("hello")).await;
        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, "a");
        assert_eq!(records[0].outcome, "allowed");
        assert_eq!(records[1].stage, "b");
        assert_eq!(records[1].outcome, "rejected");
        assert_eq!(records[1].category, Some(RejectCategory::InvalidInput));
    }

    #[tokio::test]
    async fn buffer_audit_sink_publishes_rejections_only() {
        let buffer = Arc::new(RingBuffer::new(64));
        let sink = BufferAuditSink::new(
            Arc::clone(&buffer),
            Arc::new(PipelineHealth::new()),
            "acme",
        );
        let pipeline = GuardPipeline::with_audit_sink(
            vec![
                Arc::new(StaticStage {
                    name: "quiet",
                    order: 0,
                    enabled: true,
                    result: allow,
                }),
                Arc::new(StaticStage {
                    name: "loud",
                    order: 1,
                    enabled: true,
                    result: |_| {
                        Ok(GuardResult::rejected(
                            "bad",
                            RejectCategory::PromptInjection,
                        ))
                    },
                }),
            ],
            Some(Arc::new(sink) as Arc<dyn GuardAuditSink>),
        );

        pipeline.evaluate(&GuardCommand::new("hello")).await;

        let events = buffer.drain(10);
        assert_eq!(events.len(), 1, "allowed stages are not published");
        assert_eq!(events[0].tenant_id, "acme");
        match &events[0].payload {
            crate::events::EventPayload::Guard(g) => {
                assert_eq!(g.stage, "loud");
                assert_eq!(g.category, "prompt_injection");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn command_defaults() {
        let cmd = GuardCommand::new("hi");
        assert_eq!(cmd.user_id, "anonymous");
        assert_eq!(cmd.tenant_id(), "default");
        assert!(cmd.conversation_history().is_empty());

        let cmd = GuardCommand::new("hi")
            .with_user("u-1")
            .with_metadata("tenantId", serde_json::json!("acme"))
            .with_metadata(
                "conversationHistory",
                serde_json::json!([{"role": "user", "content": "hello"}]),
            );
        assert_eq!(cmd.tenant_id(), "acme");
        assert_eq!(cmd.conversation_history().len(), 1);
    }
}
