//! Core hook types and the `AgentHook` trait.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ErrorCode, HookError};

/// Metadata key carrying the resolved tenant id.
///
/// Tenant scope travels inside the context metadata, never in a thread- or
/// task-local: cooperative schedulers move work between threads and a local
/// would silently lose the value.
pub const TENANT_ID_KEY: &str = "tenantId";

/// Substrings that mark a tool parameter as sensitive.
const SENSITIVE_KEY_MARKERS: &[&str] = &[
    "password",
    "token",
    "secret",
    "key",
    "credential",
    "apikey",
];

/// The result of a *before*-type hook.
#[derive(Debug, Clone, PartialEq)]
pub enum HookResult {
    /// Proceed to the next hook.
    Continue,
    /// Stop the request (agent level) or skip the call (tool level).
    Reject { reason: String },
    /// Replace the prompt/metadata (agent level) or params (tool level).
    Modify { modified_params: serde_json::Value },
    /// Park the request until a human decides.
    PendingApproval { approval_id: String, message: String },
}

/// A request parked for human approval.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PendingApproval {
    pub approval_id: String,
    pub message: String,
}

/// Shared, concurrency-safe context for one agent run.
///
/// `tools_used` is append-only and `metadata` is read via snapshots, so
/// emitters never hold a lock while publishing. All concurrent tool branches
/// of a run share this one context.
#[derive(Debug)]
pub struct HookContext {
    pub run_id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub channel: Option<String>,
    pub started_at: DateTime<Utc>,
    started_instant: Instant,
    user_prompt: RwLock<String>,
    tools_used: RwLock<Vec<String>>,
    metadata: RwLock<HashMap<String, serde_json::Value>>,
    call_counter: AtomicU32,
}

impl HookContext {
    pub fn new(run_id: impl Into<String>, user_id: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            user_id: user_id.into(),
            user_email: None,
            channel: None,
            started_at: Utc::now(),
            started_instant: Instant::now(),
            user_prompt: RwLock::new(user_prompt.into()),
            tools_used: RwLock::new(Vec::new()),
            metadata: RwLock::new(HashMap::new()),
            call_counter: AtomicU32::new(0),
        }
    }

    pub fn with_channel(mut self, channel: Option<String>) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_user_email(mut self, email: Option<String>) -> Self {
        self.user_email = email;
        self
    }

    /// Current prompt text (hooks may have rewritten it).
    pub fn user_prompt(&self) -> String {
        self.user_prompt
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_user_prompt(&self, prompt: impl Into<String>) {
        *self
            .user_prompt
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = prompt.into();
    }

    /// Append a tool name to the run's usage list.
    pub fn record_tool(&self, name: impl Into<String>) {
        self.tools_used
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(name.into());
    }

    /// Snapshot of tools used so far, in append order.
    pub fn tools_used(&self) -> Vec<String> {
        self.tools_used
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.into(), value);
    }

    /// Bulk-merge metadata entries.
    pub fn merge_metadata(&self, entries: HashMap<String, serde_json::Value>) {
        self.metadata
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(entries);
    }

    pub fn metadata_value(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    /// Snapshot copy of the whole metadata map.
    pub fn metadata_snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.metadata
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Resolved tenant id, defaulting to `"default"`.
    pub fn tenant_id(&self) -> String {
        self.metadata_value(TENANT_ID_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "default".to_string())
    }

    /// Read a metadata value as u64, accepting both numbers and numeric
    /// strings (transport layers disagree on which they send).
    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        match self.metadata_value(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Add to a numeric metadata value (used for duration accumulation
    /// across concurrent tool branches).
    pub fn add_metadata_u64(&self, key: &str, delta: u64) {
        let mut metadata = self
            .metadata
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = match metadata.get(key) {
            Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        };
        metadata.insert(key.to_string(), serde_json::json!(current + delta));
    }

    /// Claim the next tool call index for this run.
    pub fn next_call_index(&self) -> u32 {
        self.call_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Wall-clock time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started_instant.elapsed()
    }
}

/// Context for one tool invocation within a run.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub agent: std::sync::Arc<HookContext>,
    pub tool_name: String,
    pub tool_params: serde_json::Value,
    /// Zero-based position of this invocation in the run.
    pub call_index: u32,
}

impl ToolCallContext {
    /// Copy of the params with sensitive values redacted, for logging and
    /// audit. Any key containing `password|token|secret|key|credential|
    /// apikey` (case-insensitive) is replaced, recursively.
    pub fn masked_params(&self) -> serde_json::Value {
        mask_value(&self.tool_params)
    }
}

fn mask_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let lower = key.to_lowercase();
                    if SENSITIVE_KEY_MARKERS.iter().any(|m| lower.contains(m)) {
                        (key.clone(), serde_json::Value::String("***".to_string()))
                    } else {
                        (key.clone(), mask_value(val))
                    }
                })
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(mask_value).collect())
        }
        other => other.clone(),
    }
}

/// Result of one tool invocation, as observed by after-hooks.
#[derive(Debug, Clone)]
pub struct ToolCallSummary {
    pub success: bool,
    pub output: String,
    pub error_message: Option<String>,
    pub duration: Duration,
}

/// Final response of one agent run, as observed by after-hooks.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub run_id: String,
    pub success: bool,
    pub content: String,
    pub error_code: Option<ErrorCode>,
    /// User-visible message resolved from the error code.
    pub error_message: Option<String>,
    pub pending_approval: Option<PendingApproval>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl AgentResponse {
    /// Successful response with the given content.
    pub fn success(run_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            success: true,
            content: content.into(),
            error_code: None,
            error_message: None,
            pending_approval: None,
            model: None,
            provider: None,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    /// Failed response carrying an error code.
    pub fn failure(
        run_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            success: false,
            content: String::new(),
            error_code: Some(code),
            error_message: Some(message.into()),
            pending_approval: None,
            model: None,
            provider: None,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

/// A lifecycle hook.
///
/// All methods default to no-ops so implementations only override the
/// points they care about.
#[async_trait]
pub trait AgentHook: Send + Sync {
    fn name(&self) -> &str;

    /// Position among hooks; lower runs first.
    fn order(&self) -> i32 {
        100
    }

    fn enabled(&self) -> bool {
        true
    }

    /// When true, errors from this hook propagate instead of being logged
    /// and swallowed.
    fn fail_on_error(&self) -> bool {
        false
    }

    async fn before_agent_start(&self, _ctx: &HookContext) -> Result<HookResult, HookError> {
        Ok(HookResult::Continue)
    }

    async fn before_tool_call(&self, _ctx: &ToolCallContext) -> Result<HookResult, HookError> {
        Ok(HookResult::Continue)
    }

    async fn after_tool_call(
        &self,
        _ctx: &ToolCallContext,
        _result: &ToolCallSummary,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_agent_complete(
        &self,
        _ctx: &HookContext,
        _response: &AgentResponse,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn masked_params_redacts_sensitive_keys() {
        let ctx = ToolCallContext {
            agent: Arc::new(HookContext::new("r", "u", "p")),
            tool_name: "send_email".into(),
            tool_params: serde_json::json!({
                "to": "bob@example.com",
                "apiKey": "sk-12345",
                "smtp_password": "hunter2",
                "nested": { "authToken": "abc", "subject": "hi" },
                "attachments": [{ "signing_secret": "x", "name": "a.txt" }]
            }),
            call_index: 0,
        };

        let masked = ctx.masked_params();
        assert_eq!(masked["to"], "bob@example.com");
        assert_eq!(masked["apiKey"], "***");
        assert_eq!(masked["smtp_password"], "***");
        assert_eq!(masked["nested"]["authToken"], "***");
        assert_eq!(masked["nested"]["subject"], "hi");
        assert_eq!(masked["attachments"][0]["signing_secret"], "***");
        assert_eq!(masked["attachments"][0]["name"], "a.txt");
    }

    #[test]
    fn context_call_indices_are_unique_and_ordered() {
        let ctx = HookContext::new("r", "u", "p");
        assert_eq!(ctx.next_call_index(), 0);
        assert_eq!(ctx.next_call_index(), 1);
        assert_eq!(ctx.next_call_index(), 2);
    }

    #[test]
    fn metadata_u64_accepts_numbers_and_strings() {
        let ctx = HookContext::new("r", "u", "p");
        ctx.set_metadata("asNumber", serde_json::json!(1500));
        ctx.set_metadata("asString", serde_json::json!("2300"));
        ctx.set_metadata("junk", serde_json::json!("not a number"));

        assert_eq!(ctx.metadata_u64("asNumber"), Some(1500));
        assert_eq!(ctx.metadata_u64("asString"), Some(2300));
        assert_eq!(ctx.metadata_u64("junk"), None);
        assert_eq!(ctx.metadata_u64("absent"), None);
    }

    #[test]
    fn tenant_id_defaults_when_unset() {
        let ctx = HookContext::new("r", "u", "p");
        assert_eq!(ctx.tenant_id(), "default");
        ctx.set_metadata(TENANT_ID_KEY, serde_json::json!("acme"));
        assert_eq!(ctx.tenant_id(), "acme");
    }

    #[test]
    fn concurrent_tool_recording() {
        let ctx = Arc::new(HookContext::new("r", "u", "p"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        ctx.record_tool(format!("tool-{i}-{j}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ctx.tools_used().len(), 800);
    }
}
