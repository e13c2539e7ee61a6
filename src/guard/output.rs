//! Output guard pipeline over LLM responses.
//!
//! Mirrors the input pipeline's ordering and fail-close discipline, with one
//! extra outcome: a stage may return `Modified` to rewrite the content (PII
//! masking, rule-driven redaction). Each stage sees the content as left by
//! the previous stage; the first rejection wins. For streamed responses the
//! orchestrator runs this pipeline once over the collected output.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;

use crate::error::GuardError;
use crate::guard::rules::{RuleAction, RuleCache, RuleStore};
use crate::guard::{GuardAuditSink, RejectCategory, StageAudit};

/// Outcome of one output guard stage.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputGuardResult {
    Allowed,
    Modified {
        content: String,
        reason: String,
    },
    Rejected {
        reason: String,
        category: RejectCategory,
    },
}

/// One check over response content.
#[async_trait]
pub trait OutputGuardStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn order(&self) -> i32;

    fn enabled(&self) -> bool {
        true
    }

    async fn inspect(&self, content: &str) -> Result<OutputGuardResult, GuardError>;
}

/// Final verdict over a response.
#[derive(Debug, Clone)]
pub struct OutputVerdict {
    /// Content after all modifications, valid when not rejected.
    pub content: String,
    pub modified: bool,
    /// `(reason, category, stage)` when some stage rejected.
    pub rejection: Option<(String, RejectCategory, String)>,
    pub total_latency_ms: u64,
}

impl OutputVerdict {
    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

/// Ordered, fail-close output pipeline.
pub struct OutputGuardPipeline {
    stages: Vec<Arc<dyn OutputGuardStage>>,
    audit: Option<Arc<dyn GuardAuditSink>>,
}

impl OutputGuardPipeline {
    pub fn new(stages: Vec<Arc<dyn OutputGuardStage>>) -> Self {
        Self::with_audit_sink(stages, None)
    }

    pub fn with_audit_sink(
        mut stages: Vec<Arc<dyn OutputGuardStage>>,
        audit: Option<Arc<dyn GuardAuditSink>>,
    ) -> Self {
        stages.retain(|s| s.enabled());
        stages.sort_by_key(|s| s.order());
        Self { stages, audit }
    }

    /// Run the content through every stage in order.
    pub async fn evaluate(&self, content: &str) -> OutputVerdict {
        let started = Instant::now();
        let mut current = content.to_string();
        let mut modified = false;

        for stage in &self.stages {
            let stage_started = Instant::now();
            let inspected = stage.inspect(&current).await;
            let latency_ms = stage_started.elapsed().as_millis() as u64;

            match inspected {
                Ok(OutputGuardResult::Allowed) => {
                    self.record_audit(stage.name(), "allowed", None, latency_ms);
                }
                Ok(OutputGuardResult::Modified { content, reason }) => {
                    self.record_audit(stage.name(), "modified", None, latency_ms);
                    tracing::info!(
                        stage = stage.name(),
                        reason = %reason,
                        "Output guard modified response"
                    );
                    current = content;
                    modified = true;
                }
                Ok(OutputGuardResult::Rejected { reason, category }) => {
                    self.record_audit(stage.name(), "rejected", Some(category), latency_ms);
                    tracing::info!(
                        stage = stage.name(),
                        category = category.as_str(),
                        reason = %reason,
                        "Output guard rejected response"
                    );
                    return OutputVerdict {
                        content: current,
                        modified,
                        rejection: Some((reason, category, stage.name().to_string())),
                        total_latency_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(e) => {
                    self.record_audit(
                        stage.name(),
                        "error",
                        Some(RejectCategory::SystemError),
                        latency_ms,
                    );
                    tracing::error!(stage = stage.name(), error = %e, "Output guard stage failed");
                    return OutputVerdict {
                        content: current,
                        modified,
                        rejection: Some((
                            format!("output guard stage failed: {e}"),
                            RejectCategory::SystemError,
                            stage.name().to_string(),
                        )),
                        total_latency_ms: started.elapsed().as_millis() as u64,
                    };
                }
            }
        }

        OutputVerdict {
            content: current,
            modified,
            rejection: None,
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
                is_output_guard: true,
            });
        }
    }
}

impl std::fmt::Debug for OutputGuardPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputGuardPipeline")
            .field("stages", &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Masks common PII shapes (emails, phone numbers, SSNs, card numbers).
pub struct PiiMaskingStage {
    patterns: Vec<(Regex, &'static str)>,
}

impl PiiMaskingStage {
    pub fn new() -> Self {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .unwrap_or_else(|e| unreachable!("built-in PII pattern failed to compile: {e}"))
        };
        Self {
            patterns: vec![
                (
                    compile(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"),
                    "[EMAIL]",
                ),
                (compile(r"\b\d{3}-\d{2}-\d{4}\b"), "[SSN]"),
                (compile(r"\b(?:\d[ -]?){13,16}\b"), "[CARD]"),
                (
                    compile(r"(?:\+\d{1,3}[ .-]?)?\(?\d{3}\)?[ .-]\d{3}[ .-]\d{4}"),
                    "[PHONE]",
                ),
            ],
        }
    }
}

impl Default for PiiMaskingStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutputGuardStage for PiiMaskingStage {
    fn name(&self) -> &'static str {
        "PiiMasking"
    }

    fn order(&self) -> i32 {
        0
    }

    async fn inspect(&self, content: &str) -> Result<OutputGuardResult, GuardError> {
        let mut current = content.to_string();
        let mut masked = 0usize;
        for (regex, replacement) in &self.patterns {
            let next = regex.replace_all(&current, *replacement);
            if let std::borrow::Cow::Owned(owned) = next {
                masked += 1;
                current = owned;
            }
        }

        if masked > 0 {
            Ok(OutputGuardResult::Modified {
                content: current,
                reason: "masked PII".to_string(),
            })
        } else {
            Ok(OutputGuardResult::Allowed)
        }
    }
}

/// Rejects responses that leak a canary token planted in the system prompt.
pub struct CanaryTokenStage {
    tokens: Vec<String>,
}

impl CanaryTokenStage {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl OutputGuardStage for CanaryTokenStage {
    fn name(&self) -> &'static str {
        "CanaryToken"
    }

    fn order(&self) -> i32 {
        1
    }

    fn enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    async fn inspect(&self, content: &str) -> Result<OutputGuardResult, GuardError> {
        if self.tokens.iter().any(|t| content.contains(t.as_str())) {
            return Ok(OutputGuardResult::Rejected {
                reason: "canary token leaked into output".to_string(),
                category: RejectCategory::PromptInjection,
            });
        }
        Ok(OutputGuardResult::Allowed)
    }
}

/// Applies admin-defined rules from the dynamic rule store.
pub struct RuleStoreStage {
    store: Arc<dyn RuleStore>,
    cache: RuleCache,
}

impl RuleStoreStage {
    pub fn new(store: Arc<dyn RuleStore>, refresh_interval: Duration) -> Self {
        Self {
            store,
            cache: RuleCache::new(refresh_interval),
        }
    }
}

#[async_trait]
impl OutputGuardStage for RuleStoreStage {
    fn name(&self) -> &'static str {
        "RuleStore"
    }

    fn order(&self) -> i32 {
        2
    }

    async fn inspect(&self, content: &str) -> Result<OutputGuardResult, GuardError> {
        let rules = self.cache.get(self.store.as_ref()).await?;
        let mut current = content.to_string();
        let mut masked_by: Vec<String> = Vec::new();

        for compiled in rules.iter() {
            if !compiled.regex.is_match(&current) {
                continue;
            }
            match &compiled.rule.action {
                RuleAction::Block => {
                    return Ok(OutputGuardResult::Rejected {
                        reason: format!("blocked by rule: {}", compiled.rule.name),
                        category: RejectCategory::Unauthorized,
                    });
                }
                RuleAction::Mask { replacement } => {
                    current = compiled
                        .regex
                        .replace_all(&current, replacement.as_str())
                        .into_owned();
                    masked_by.push(compiled.rule.name.clone());
                }
            }
        }

        if masked_by.is_empty() {
            Ok(OutputGuardResult::Allowed)
        } else {
            Ok(OutputGuardResult::Modified {
                content: current,
                reason: format!("masked by rules: {}", masked_by.join(", ")),
            })
        }
    }
}

/// Static block patterns compiled at construction.
pub struct StaticPatternStage {
    patterns: Vec<(String, Regex)>,
}

impl StaticPatternStage {
    /// Invalid patterns are dropped with a warning.
    pub fn new(patterns: Vec<(String, String)>) -> Self {
        let patterns = patterns
            .into_iter()
            .filter_map(|(name, pattern)| match Regex::new(&pattern) {
                Ok(regex) => Some((name, regex)),
                Err(e) => {
                    tracing::warn!(name = %name, error = %e, "Skipping invalid static pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }
}

#[async_trait]
impl OutputGuardStage for StaticPatternStage {
    fn name(&self) -> &'static str {
        "StaticPatterns"
    }

    fn order(&self) -> i32 {
        3
    }

    fn enabled(&self) -> bool {
        !self.patterns.is_empty()
    }

    async fn inspect(&self, content: &str) -> Result<OutputGuardResult, GuardError> {
        for (name, regex) in &self.patterns {
            if regex.is_match(content) {
                return Ok(OutputGuardResult::Rejected {
                    reason: format!("static pattern matched: {name}"),
                    category: RejectCategory::Unauthorized,
                });
            }
        }
        Ok(OutputGuardResult::Allowed)
    }
}
