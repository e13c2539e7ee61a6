//! End-to-end regression scenarios for the metric pipeline.
//!
//! Each test wires real components (ring buffer, writer, emitters, quota
//! enforcer, orchestrator) with in-memory stores and asserts the observable
//! events, exactly as a deployment would see them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use aegis::buffer::RingBuffer;
use aegis::config::{RequestConfig, WriterConfig};
use aegis::cost::{CostCalculator, InMemoryPricingStore, PricingRecord};
use aegis::emitters::{HitlEventHook, MetricCollectionHook};
use aegis::error::{DefaultMessageResolver, StoreError};
use aegis::events::{
    AgentExecutionEvent, EventPayload, MetricEvent, QuotaAction, TokenUsageEvent,
};
use aegis::guard::GuardPipeline;
use aegis::guard::output::OutputGuardPipeline;
use aegis::health::PipelineHealth;
use aegis::hooks::hook::{AgentHook, HookContext};
use aegis::hooks::registry::HookRegistry;
use aegis::orchestrator::{
    AgentCore, AgentCoreError, AgentOutput, AgentRequest, RequestOrchestrator, ToolBroker,
};
use aegis::store::{EventStore, MemoryEventStore};
use aegis::tenant::quota::QuotaEnforcerHook;
use aegis::tenant::{
    InMemoryTenantStore, InMemoryUsageStore, MonthlyUsage, Tenant, TenantPlan, TenantQuota,
    TenantResolver, TenantStore, UsageStore, month_key,
};
use aegis::tools::{Tool, ToolRegistry};
use aegis::writer::MetricWriter;

fn exec_event(run_id: &str) -> MetricEvent {
    MetricEvent::new(
        "default",
        EventPayload::AgentExecution(AgentExecutionEvent {
            run_id: run_id.to_string(),
            user_id: "u".into(),
            session_id: None,
            success: true,
            tool_count: 0,
            duration_ms: 1,
            llm_duration_ms: 0,
            tool_duration_ms: 0,
            guard_duration_ms: 0,
            queue_wait_ms: 0,
            error_code: None,
            persona_id: None,
            intent_category: None,
        }),
    )
}

/// Scenario: buffer saturation. 64 events fit, the 65th is dropped and
/// counted, and the drain returns the 64 survivors in publication order.
#[test]
fn buffer_saturation_drops_the_overflow_event() {
    let buffer: RingBuffer<MetricEvent> = RingBuffer::new(64);

    for i in 0..64 {
        assert!(buffer.publish(exec_event(&format!("r-{i}"))), "event {i} must fit");
    }
    assert!(!buffer.publish(exec_event("r-64")), "65th event must be dropped");
    assert_eq!(buffer.dropped_count(), 1);

    let drained = buffer.drain(1000);
    assert_eq!(drained.len(), 64);
    let run_ids: Vec<&str> = drained.iter().filter_map(|e| e.run_id()).collect();
    let expected: Vec<String> = (0..64).map(|i| format!("r-{i}")).collect();
    assert_eq!(run_ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
}

/// Scenario: cost enrichment. An unpriced token-usage event gets its cost
/// filled in by the writer before persistence; the health monitor records
/// one write of one event.
#[tokio::test]
async fn cost_enrichment_prices_the_stored_event() {
    let buffer = Arc::new(RingBuffer::new(64));
    let store = Arc::new(MemoryEventStore::new());
    let health = Arc::new(PipelineHealth::new());

    let pricing = InMemoryPricingStore::new();
    pricing.upsert(PricingRecord {
        provider: "google".into(),
        model: "gemini-2.0-flash".into(),
        valid_from: chrono::DateTime::UNIX_EPOCH,
        valid_to: None,
        prompt_per_1k: dec!(0.02),
        cached_per_1k: Decimal::ZERO,
        completion_per_1k: dec!(0.01),
        reasoning_per_1k: Decimal::ZERO,
    });

    let writer = Arc::new(
        MetricWriter::new(
            Arc::clone(&buffer),
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::clone(&health),
            WriterConfig {
                batch_size: 10,
                flush_interval: Duration::from_secs(3600),
                threads: 1,
            },
        )
        .with_cost_model(Arc::new(CostCalculator::new(pricing))),
    );

    let usage = TokenUsageEvent::new("r-1", "google", "gemini-2.0-flash", 100, 50);
    assert_eq!(usage.estimated_cost_usd, Decimal::ZERO);
    assert!(buffer.publish(MetricEvent::new("t1", EventPayload::TokenUsage(usage))));

    writer.start();
    writer.stop().await;

    let inserted = store.inserted().await;
    assert_eq!(inserted.len(), 1);
    match &inserted[0].payload {
        EventPayload::TokenUsage(u) => assert_eq!(u.estimated_cost_usd, dec!(0.0025)),
        other => panic!("unexpected payload {other:?}"),
    }
    assert_eq!(health.written_total(), 1);
    assert_eq!(health.write_errors_total(), 0);
}

struct FailingStore;

#[async_trait]
impl EventStore for FailingStore {
    async fn batch_insert(&self, _events: &[MetricEvent]) -> Result<(), StoreError> {
        Err(StoreError::Insert("injected store outage".into()))
    }
}

/// Scenario: a store outage never reaches the request path. The batch is
/// counted as a write error and discarded; nothing is re-queued.
#[tokio::test]
async fn writer_failure_is_contained_and_lossy() {
    let buffer = Arc::new(RingBuffer::new(64));
    let health = Arc::new(PipelineHealth::new());
    let writer = MetricWriter::new(
        Arc::clone(&buffer),
        Arc::new(FailingStore),
        Arc::clone(&health),
        WriterConfig {
            batch_size: 10,
            flush_interval: Duration::from_secs(3600),
            threads: 1,
        },
    );

    assert!(buffer.publish(exec_event("r-1")));
    writer.flush().await;

    assert_eq!(health.write_errors_total(), 1);
    assert_eq!(buffer.size(), 0, "failed batch must not be re-queued");
    writer.flush().await;
    assert_eq!(health.write_errors_total(), 1, "nothing left to fail on");
}

// ---------------------------------------------------------------------------
// Orchestrated scenarios
// ---------------------------------------------------------------------------

struct EchoCore;

#[async_trait]
impl AgentCore for EchoCore {
    async fn execute(
        &self,
        ctx: &Arc<HookContext>,
        _tools: &ToolBroker,
    ) -> Result<AgentOutput, AgentCoreError> {
        Ok(AgentOutput::text(format!("ok: {}", ctx.user_prompt())))
    }
}

/// Core that makes two sequential `send_email` tool calls.
struct EmailTwiceCore;

#[async_trait]
impl AgentCore for EmailTwiceCore {
    async fn execute(
        &self,
        _ctx: &Arc<HookContext>,
        tools: &ToolBroker,
    ) -> Result<AgentOutput, AgentCoreError> {
        for recipient in ["a@example.test", "b@example.test"] {
            tools
                .call_tool("send_email", serde_json::json!({"to": recipient}))
                .await
                .map_err(|e| AgentCoreError::Internal(e.to_string()))?;
        }
        Ok(AgentOutput::text("emails handled"))
    }
}

struct SendEmailTool;

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        "send_email"
    }
    fn description(&self) -> &str {
        "Sends an email"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "to": { "type": "string" } },
            "required": ["to"]
        })
    }
    async fn call(&self, _arguments: serde_json::Value) -> String {
        "sent".to_string()
    }
}

struct Fixture {
    orchestrator: RequestOrchestrator,
    buffer: Arc<RingBuffer<MetricEvent>>,
}

async fn orchestrated_fixture(core: Arc<dyn AgentCore>, with_quota_tenant: bool) -> Fixture {
    let buffer = Arc::new(RingBuffer::new(256));
    let health = Arc::new(PipelineHealth::new());

    let tenants = Arc::new(InMemoryTenantStore::new());
    let usage = Arc::new(InMemoryUsageStore::new());
    if with_quota_tenant {
        tenants
            .upsert(
                Tenant::new(
                    "t1",
                    "Tenant One",
                    TenantPlan::Pro,
                    TenantQuota::new(100, 1_000_000, 10),
                )
                .unwrap(),
            )
            .await
            .unwrap();
        usage
            .set_usage(
                "t1",
                &month_key(chrono::Utc::now()),
                MonthlyUsage {
                    requests: 90,
                    tokens: 0,
                },
            )
            .await;
    }

    let hooks: Vec<Arc<dyn AgentHook>> = vec![
        Arc::new(QuotaEnforcerHook::new(
            Arc::clone(&tenants) as Arc<dyn TenantStore>,
            Arc::clone(&usage) as Arc<dyn UsageStore>,
            Arc::clone(&buffer),
            Arc::clone(&health),
            0.9,
        )),
        Arc::new(MetricCollectionHook::new(
            Arc::clone(&buffer),
            Arc::clone(&health),
        )),
        Arc::new(HitlEventHook::new(Arc::clone(&buffer), Arc::clone(&health))),
    ];

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SendEmailTool));

    let orchestrator = RequestOrchestrator::new(
        core,
        Arc::new(tools),
        Arc::new(HookRegistry::new(hooks)),
        Arc::new(GuardPipeline::new(vec![])),
        Arc::new(OutputGuardPipeline::new(vec![])),
        Arc::clone(&buffer),
        Arc::clone(&health),
        TenantResolver::default(),
        Arc::new(DefaultMessageResolver),
        RequestConfig {
            timeout: Duration::from_secs(10),
            completion_grace: Duration::from_secs(2),
        },
    );

    Fixture {
        orchestrator,
        buffer,
    }
}

/// Scenario: HITL approval capture. Two `send_email` calls with indexed
/// approval metadata produce two `Hitl` events, in call order, with the
/// fail-close default for the missing rejection reason on the second.
#[tokio::test]
async fn hitl_approvals_are_captured_per_call() {
    let fixture = orchestrated_fixture(Arc::new(EmailTwiceCore), false).await;

    let request = AgentRequest::new("send those emails")
        .with_user("u-1")
        .with_tenant_header("default")
        .with_metadata("hitlWaitMs_send_email_0", serde_json::json!("1500"))
        .with_metadata("hitlApproved_send_email_0", serde_json::json!("false"))
        .with_metadata(
            "hitlRejectionReason_send_email_0",
            serde_json::json!("first denied"),
        )
        .with_metadata("hitlWaitMs_send_email_1", serde_json::json!("2300"))
        .with_metadata("hitlApproved_send_email_1", serde_json::json!("true"));

    let response = fixture.orchestrator.handle(request).await;
    assert!(response.success, "{:?}", response.error_message);

    let hitl: Vec<_> = fixture
        .buffer
        .drain(256)
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::Hitl(h) => Some(h),
            _ => None,
        })
        .collect();

    assert_eq!(hitl.len(), 2);
    assert!(!hitl[0].approved);
    assert_eq!(hitl[0].wait_ms, 1500);
    assert_eq!(hitl[0].rejection_reason.as_deref(), Some("first denied"));
    assert!(hitl[1].approved);
    assert_eq!(hitl[1].wait_ms, 2300);
    assert_eq!(hitl[1].rejection_reason, None);
}

/// Scenario: quota warning dedup. Five requests at 90% usage emit exactly
/// one warning event and five successful execution events.
#[tokio::test]
async fn quota_warning_fires_once_for_five_requests() {
    let fixture = orchestrated_fixture(Arc::new(EchoCore), true).await;

    for i in 0..5 {
        let response = fixture
            .orchestrator
            .handle(
                AgentRequest::new(format!("request number {i}"))
                    .with_user("u-1")
                    .with_tenant_header("t1"),
            )
            .await;
        assert!(response.success, "request {i} failed: {:?}", response.error_message);
    }

    let events = fixture.buffer.drain(256);
    let warnings = events
        .iter()
        .filter(|e| {
            matches!(
                &e.payload,
                EventPayload::Quota(q) if q.action == QuotaAction::Warning
            )
        })
        .count();
    let successes = events
        .iter()
        .filter(|e| {
            matches!(
                &e.payload,
                EventPayload::AgentExecution(x) if x.success
            )
        })
        .count();

    assert_eq!(warnings, 1, "exactly one warning per (tenant, month)");
    assert_eq!(successes, 5);
}

/// A suspended tenant is rejected with a `rejected_suspended` event, and the
/// failed run still produces an execution event via the after-complete hook.
#[tokio::test]
async fn suspended_tenant_rejection_is_observable() {
    let fixture = orchestrated_fixture(Arc::new(EchoCore), true).await;
    // Re-register t1 as suspended.
    let tenants = InMemoryTenantStore::new();
    let mut tenant = Tenant::new(
        "t2",
        "Tenant Two",
        TenantPlan::Free,
        TenantQuota::new(10, 1000, 1),
    )
    .unwrap();
    tenant.status = aegis::tenant::TenantStatus::Suspended;
    tenants.upsert(tenant).await.unwrap();

    // Build a dedicated fixture around the suspended tenant.
    let buffer = Arc::new(RingBuffer::new(64));
    let health = Arc::new(PipelineHealth::new());
    let usage = Arc::new(InMemoryUsageStore::new());
    let hooks: Vec<Arc<dyn AgentHook>> = vec![
        Arc::new(QuotaEnforcerHook::new(
            Arc::new(tenants) as Arc<dyn TenantStore>,
            usage,
            Arc::clone(&buffer),
            Arc::clone(&health),
            0.9,
        )),
        Arc::new(MetricCollectionHook::new(
            Arc::clone(&buffer),
            Arc::clone(&health),
        )),
    ];
    let orchestrator = RequestOrchestrator::new(
        Arc::new(EchoCore),
        Arc::new(ToolRegistry::new()),
        Arc::new(HookRegistry::new(hooks)),
        Arc::new(GuardPipeline::new(vec![])),
        Arc::new(OutputGuardPipeline::new(vec![])),
        Arc::clone(&buffer),
        health,
        TenantResolver::default(),
        Arc::new(DefaultMessageResolver),
        RequestConfig {
            timeout: Duration::from_secs(5),
            completion_grace: Duration::from_secs(2),
        },
    );

    let response = orchestrator
        .handle(AgentRequest::new("hello").with_tenant_header("t2"))
        .await;
    assert!(!response.success);
    assert_eq!(
        response.error_code,
        Some(aegis::error::ErrorCode::QuotaExceeded)
    );

    let events = buffer.drain(64);
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::Quota(q) if q.action == QuotaAction::RejectedSuspended
    )));
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::AgentExecution(x) if !x.success
    )));

    // The unused first fixture should see no traffic.
    assert_eq!(fixture.buffer.drain(10).len(), 0);
}

/// Execution events carry the run's tenant scope and tool count end to end.
#[tokio::test]
async fn execution_events_carry_tenant_and_tool_count() {
    let fixture = orchestrated_fixture(Arc::new(EmailTwiceCore), false).await;

    let response = fixture
        .orchestrator
        .handle(AgentRequest::new("go").with_tenant_header("default"))
        .await;
    assert!(response.success);

    let events = fixture.buffer.drain(256);
    let exec = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::AgentExecution(x) => Some((e.tenant_id.clone(), x.clone())),
            _ => None,
        })
        .expect("execution event emitted");
    assert_eq!(exec.0, "default");
    assert_eq!(exec.1.tool_count, 2);
    assert!(exec.1.success);

    let tool_events = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::ToolCall(_)))
        .count();
    assert_eq!(tool_events, 2);
}
