//! LLM provider contract and retry policy.
//!
//! Provider clients live outside the core; this module defines the calling
//! contract, classifies provider failures into the result error taxonomy by
//! keyword, and wraps calls in exponential backoff with jitter. Cancellation
//! (dropping the future, e.g. on deadline expiry) terminates a retry loop
//! immediately — a cancelled call is never retried or reported as a failure.

use std::time::Duration;

use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use rand::Rng;

use crate::config::RetryConfig;
use crate::error::{ErrorCode, LlmError};

/// One chat message in a provider request.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A provider-agnostic completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// A provider response. Token counts default to zero when the provider does
/// not surface usage.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// External LLM provider client.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Classify a provider failure message into the result error taxonomy.
///
/// Keyword matching is deliberately loose: providers disagree on error
/// shapes, but their messages converge on a small vocabulary.
pub fn classify_failure(message: &str) -> ErrorCode {
    const PATTERNS: &[(&str, ErrorCode)] = &[
        ("rate limit", ErrorCode::RateLimited),
        ("rate_limit", ErrorCode::RateLimited),
        ("too many requests", ErrorCode::RateLimited),
        ("429", ErrorCode::RateLimited),
        ("timeout", ErrorCode::Timeout),
        ("timed out", ErrorCode::Timeout),
        ("deadline", ErrorCode::Timeout),
        ("context length", ErrorCode::ContextTooLong),
        ("context_length", ErrorCode::ContextTooLong),
        ("maximum context", ErrorCode::ContextTooLong),
        ("too many tokens", ErrorCode::ContextTooLong),
    ];

    // Compiled once; AhoCorasick::new over a static set cannot fail.
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
        .unwrap_or(ErrorCode::Unknown)
}

impl LlmError {
    /// The taxonomy code this error surfaces as.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LlmError::RateLimited { .. } => ErrorCode::RateLimited,
            LlmError::Timeout { .. } => ErrorCode::Timeout,
            LlmError::ContextTooLong { .. } => ErrorCode::ContextTooLong,
            LlmError::RequestFailed { reason, .. } => classify_failure(reason),
            LlmError::InvalidResponse { .. } => ErrorCode::Unknown,
        }
    }

    /// Whether retrying could help (429/5xx/timeout-shaped failures).
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout { .. } => true,
            LlmError::ContextTooLong { .. } | LlmError::InvalidResponse { .. } => false,
            LlmError::RequestFailed { reason, .. } => {
                let lower = reason.to_lowercase();
                ["500", "502", "503", "504", "overloaded", "unavailable", "connection"]
                    .iter()
                    .any(|needle| lower.contains(needle))
            }
        }
    }

    /// Server-suggested retry delay, when the provider sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Exponential backoff with ±25% jitter, capped at `max_delay`.
fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base_ms = config.initial_delay.as_millis() as f64;
    let exp_ms = base_ms * config.multiplier.powi(attempt as i32);
    let capped_ms = exp_ms.min(config.max_delay.as_millis() as f64);

    let jitter_factor = rand::thread_rng().gen_range(-0.25..=0.25);
    let delay_ms = (capped_ms * (1.0 + jitter_factor)).max(1.0) as u64;
    Duration::from_millis(delay_ms)
}

/// Call the provider, retrying transient failures up to
/// `config.max_attempts` total attempts.
///
/// Permanent errors return immediately. A server-suggested `retry_after`
/// overrides the computed backoff. Dropping this future (cancellation)
/// stops the loop mid-sleep.
pub async fn call_with_retry(
    provider: &dyn LlmProvider,
    request: &LlmRequest,
    config: &RetryConfig,
) -> Result<LlmResponse, LlmError> {
    let attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match provider.call(request).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                if !err.is_transient() || attempt + 1 == attempts {
                    return Err(err);
                }
                let delay = err.retry_after().unwrap_or_else(|| backoff_delay(config, attempt));
                tracing::warn!(
                    provider = provider.name(),
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying LLM call after transient error"
                );
                last_error = Some(err);
                tokio::time::sleep(delay).await;
            }
        }
    }

    // Unreachable in practice: the loop returns on the last attempt.
    Err(last_error.unwrap_or(LlmError::RequestFailed {
        provider: provider.name().to_string(),
        reason: "retry loop exhausted without an attempt".to_string(),
    }))
}
