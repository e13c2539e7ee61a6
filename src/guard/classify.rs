//! Request classification guard stage (opt-in).
//!
//! Two layers: a rule-based keyword scan that always runs and blocks on
//! match, and an optional LLM verdict for the grey zone. The LLM layer is
//! fail-open — a provider outage must not take request processing down with
//! it; the rule layer still stands.

use std::sync::Arc;

use aho_corasick::AhoCorasick;
use async_trait::async_trait;

use crate::error::GuardError;
use crate::guard::{GuardCommand, GuardResult, GuardStage, RejectCategory};
use crate::llm::{ChatMessage, LlmProvider, LlmRequest};

/// Combined rule-based and LLM-based topic classifier.
pub struct ClassificationStage {
    blocked_keywords: Vec<String>,
    matcher: Option<AhoCorasick>,
    llm: Option<LlmClassifier>,
    enabled: bool,
}

struct LlmClassifier {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl ClassificationStage {
    /// Disabled stage with no keywords; use the builder methods to arm it.
    pub fn new() -> Self {
        Self {
            blocked_keywords: Vec::new(),
            matcher: None,
            llm: None,
            enabled: false,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Keywords whose presence always blocks, case-insensitively.
    pub fn with_blocked_keywords(mut self, keywords: Vec<String>) -> Self {
        self.matcher = if keywords.is_empty() {
            None
        } else {
            AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .build(&keywords)
                .ok()
        };
        self.blocked_keywords = keywords;
        self
    }

    /// Arm the LLM verdict layer.
    pub fn with_llm(mut self, provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        self.llm = Some(LlmClassifier {
            provider,
            model: model.into(),
        });
        self
    }

    async fn llm_verdict(&self, text: &str) -> Option<bool> {
        let classifier = self.llm.as_ref()?;
        let request = LlmRequest {
            provider: classifier.provider.name().to_string(),
            model: classifier.model.clone(),
            messages: vec![
                ChatMessage::new(
                    "system",
                    "You are a strict request classifier for an enterprise assistant. \
                     Answer with exactly one word: ALLOW if the request is on-policy, \
                     BLOCK if it is off-policy.",
                ),
                ChatMessage::new("user", text),
            ],
            max_tokens: Some(4),
            temperature: Some(0.0),
        };

        match classifier.provider.call(&request).await {
            Ok(response) => Some(!response.content.trim().eq_ignore_ascii_case("block")),
            Err(e) => {
                // Fail open: classification outages never block requests.
                tracing::warn!(error = %e, "LLM classification failed, allowing request");
                None
            }
        }
    }
}

impl Default for ClassificationStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GuardStage for ClassificationStage {
    fn name(&self) -> &'static str {
        "Classification"
    }

    fn order(&self) -> i32 {
        4
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn check(&self, command: &GuardCommand) -> Result<GuardResult, GuardError> {
        if let Some(matcher) = &self.matcher {
            if let Some(found) = matcher.find(&command.text) {
                let keyword = &self.blocked_keywords[found.pattern().as_usize()];
                return Ok(GuardResult::rejected(
                    format!("blocked keyword: {keyword}"),
                    RejectCategory::OffTopic,
                ));
            }
        }

        if let Some(false) = self.llm_verdict(&command.text).await {
            return Ok(GuardResult::rejected(
                "classified as off-policy",
                RejectCategory::OffTopic,
            ));
        }

        Ok(GuardResult::allowed())
    }
}
