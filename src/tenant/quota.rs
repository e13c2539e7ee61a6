//! Quota enforcement hook.
//!
//! Runs early in the before-start chain (order 5): suspended tenants and
//! exhausted quotas reject the request before any model work happens. Every
//! decision that matters — rejection or the 90% warning — is emitted as a
//! `Quota` metric event. The warning fires at most once per (tenant, month);
//! a concurrent set keeps the dedup cheap and lock-light.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::buffer::RingBuffer;
use crate::error::HookError;
use crate::events::{EventPayload, MetricEvent, QuotaAction, QuotaEvent};
use crate::health::PipelineHealth;
use crate::hooks::hook::{AgentHook, HookContext, HookResult};
use crate::tenant::{MonthlyUsage, Tenant, TenantStore, UsageStore, month_key};

/// Registry name of the quota enforcer; the orchestrator maps rejections
/// from this hook to `QUOTA_EXCEEDED`.
pub const QUOTA_ENFORCER_HOOK_NAME: &str = "tenant:quota_enforcer";

/// Before-start hook enforcing per-tenant monthly quotas.
pub struct QuotaEnforcerHook {
    tenants: Arc<dyn TenantStore>,
    usage: Arc<dyn UsageStore>,
    buffer: Arc<RingBuffer<MetricEvent>>,
    health: Arc<PipelineHealth>,
    warning_percent: f64,
    warned: Mutex<HashSet<String>>,
}

impl QuotaEnforcerHook {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        usage: Arc<dyn UsageStore>,
        buffer: Arc<RingBuffer<MetricEvent>>,
        health: Arc<PipelineHealth>,
        warning_percent: f64,
    ) -> Self {
        Self {
            tenants,
            usage,
            buffer,
            health,
            warning_percent,
            warned: Mutex::new(HashSet::new()),
        }
    }

    fn emit(&self, tenant: &Tenant, action: QuotaAction, usage: MonthlyUsage) {
        let quota_requests = tenant.quota.max_requests_per_month;
        let usage_percent = if quota_requests > 0 && quota_requests != i64::MAX {
            (usage.requests as f64 / quota_requests as f64) * 100.0
        } else {
            0.0
        };
        let event = MetricEvent::new(
            tenant.id.clone(),
            EventPayload::Quota(QuotaEvent {
                action,
                current_requests: usage.requests,
                current_tokens: usage.tokens,
                quota_requests,
                quota_tokens: tenant.quota.max_tokens_per_month,
                usage_percent,
            }),
        );
        if !self.buffer.publish(event) {
            self.health.record_drop(1);
        }
    }

    /// True exactly once per (tenant, month).
    fn first_warning_for(&self, tenant_id: &str, month: &str) -> bool {
        self.warned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(format!("{tenant_id}:{month}"))
    }
}

#[async_trait]
impl AgentHook for QuotaEnforcerHook {
    fn name(&self) -> &str {
        QUOTA_ENFORCER_HOOK_NAME
    }

    fn order(&self) -> i32 {
        5
    }

    async fn before_agent_start(&self, ctx: &HookContext) -> Result<HookResult, HookError> {
        let tenant_id = ctx.tenant_id();
        let Some(tenant) = self.tenants.get(&tenant_id).await else {
            // Fail close: an explicitly scoped request for a tenant we do
            // not know is not billable and not servable.
            tracing::warn!(tenant = %tenant_id, "Rejecting request for unknown tenant");
            return Ok(HookResult::Reject {
                reason: format!("unknown tenant: {tenant_id}"),
            });
        };

        let month = month_key(Utc::now());
        let usage = self.usage.monthly_usage(&tenant_id, &month).await;

        if !tenant.is_active() {
            self.emit(&tenant, QuotaAction::RejectedSuspended, usage);
            return Ok(HookResult::Reject {
                reason: format!("tenant {tenant_id} is suspended"),
            });
        }

        if usage.requests >= tenant.quota.max_requests_per_month {
            self.emit(&tenant, QuotaAction::RejectedRequests, usage);
            return Ok(HookResult::Reject {
                reason: format!(
                    "monthly request quota exhausted ({}/{})",
                    usage.requests, tenant.quota.max_requests_per_month
                ),
            });
        }

        if usage.tokens >= tenant.quota.max_tokens_per_month {
            self.emit(&tenant, QuotaAction::RejectedTokens, usage);
            return Ok(HookResult::Reject {
                reason: format!(
                    "monthly token quota exhausted ({}/{})",
                    usage.tokens, tenant.quota.max_tokens_per_month
                ),
            });
        }

        let threshold =
            (tenant.quota.max_requests_per_month as f64 * self.warning_percent) as i64;
        if tenant.quota.max_requests_per_month != i64::MAX
            && usage.requests >= threshold
            && self.first_warning_for(&tenant_id, &month)
        {
            self.emit(&tenant, QuotaAction::Warning, usage);
        }

        Ok(HookResult::Continue)
    }
}
