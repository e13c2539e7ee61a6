//! Error types for the Aegis core.

use std::time::Duration;

/// Top-level error type for the core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Guard error: {0}")]
    Guard(#[from] GuardError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tenant error: {0}")]
    Tenant(#[from] TenantError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Guard stage execution errors.
///
/// Any error from a stage is converted by the pipeline into a
/// `Rejected { category: SystemError }` result — guards fail close.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Guard stage failed: {reason}")]
    StageFailed { reason: String },

    #[error("Guard stage dependency unavailable: {reason}")]
    DependencyUnavailable { reason: String },
}

/// Hook execution errors.
///
/// Hooks fail open: the registry logs and swallows these unless the hook
/// declares `fail_on_error`.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Hook execution failed: {reason}")]
    ExecutionFailed { reason: String },

    #[error("Hook timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

/// Event store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Batch insert failed: {0}")]
    Insert(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {elapsed:?}")]
    Timeout { provider: String, elapsed: Duration },

    #[error("Context length exceeded: {detail}")]
    ContextTooLong { detail: String },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Tenant store errors.
#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("Invalid tenant slug: {slug}")]
    InvalidSlug { slug: String },

    #[error("Tenant not found: {id}")]
    NotFound { id: String },

    #[error("Invalid quota for tenant {id}: {message}")]
    InvalidQuota { id: String, message: String },
}

/// The fixed taxonomy surfaced as `error_code` on agent results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    Timeout,
    ContextTooLong,
    ToolError,
    GuardRejected,
    HookRejected,
    QuotaExceeded,
    CircuitBreakerOpen,
    Unknown,
}

impl ErrorCode {
    /// Stable wire representation (`RATE_LIMITED`, `TIMEOUT`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ContextTooLong => "CONTEXT_TOO_LONG",
            ErrorCode::ToolError => "TOOL_ERROR",
            ErrorCode::GuardRejected => "GUARD_REJECTED",
            ErrorCode::HookRejected => "HOOK_REJECTED",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Canonical human-readable message for this code.
    pub fn canonical_message(&self) -> &'static str {
        match self {
            ErrorCode::RateLimited => {
                "You are sending requests too quickly. Please wait and try again."
            }
            ErrorCode::Timeout => "The request took too long to complete. Please try again.",
            ErrorCode::ContextTooLong => {
                "The conversation is too long for the model. Start a new session."
            }
            ErrorCode::ToolError => "A tool failed while handling your request.",
            ErrorCode::GuardRejected => "Your request was blocked by a safety check.",
            ErrorCode::HookRejected => "Your request was rejected before processing.",
            ErrorCode::QuotaExceeded => {
                "Your organization's monthly usage quota has been reached."
            }
            ErrorCode::CircuitBreakerOpen => "A downstream service is temporarily unavailable.",
            ErrorCode::Unknown => "Something went wrong while handling your request.",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps `(error_code, original_message)` to a user-visible string.
///
/// Pluggable so transports can localize. The default resolver returns the
/// code's canonical message; for `TOOL_ERROR` it appends the original tool
/// message so the user sees what actually failed.
pub trait MessageResolver: Send + Sync {
    fn resolve(&self, code: ErrorCode, original: Option<&str>) -> String;
}

/// Default English message resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMessageResolver;

impl MessageResolver for DefaultMessageResolver {
    fn resolve(&self, code: ErrorCode, original: Option<&str>) -> String {
        match (code, original) {
            (ErrorCode::ToolError, Some(detail)) => {
                format!("{} ({detail})", code.canonical_message())
            }
            _ => code.canonical_message().to_string(),
        }
    }
}

/// Result type alias for the core.
pub type Result<T> = std::result::Result<T, Error>;
