//! Admin HTTP surface for metric ingest and platform health.
//!
//! The transport layer mounts this router wherever it serves operators.
//! Ingest endpoints publish externally produced events into the same ring
//! buffer the in-process emitters use, so one writer and one store see
//! everything.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::buffer::RingBuffer;
use crate::events::{EventPayload, MetricEvent};
use crate::health::{HealthSnapshot, PipelineHealth};

/// Max items accepted by the batched ingest endpoints.
pub const MAX_BATCH_ITEMS: usize = 1000;

/// Shared state behind the admin routes.
pub struct AdminState {
    pub buffer: Arc<RingBuffer<MetricEvent>>,
    pub health: Arc<PipelineHealth>,
}

/// Build the admin router.
pub fn admin_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/admin/metrics/ingest/batch", post(ingest_batch_handler))
        .route(
            "/admin/metrics/ingest/eval-results",
            post(ingest_batch_handler),
        )
        .route("/admin/metrics/ingest/{type}", post(ingest_event_handler))
        .route("/admin/platform/health", get(platform_health_handler))
        .with_state(state)
}

/// Summary returned by the batched ingest endpoints.
#[derive(Debug, Serialize)]
struct IngestSummary {
    accepted: usize,
    dropped: usize,
}

#[derive(Debug, Serialize)]
struct BufferStatus {
    capacity: usize,
    size: usize,
    usage_percent: f64,
    dropped_count: u64,
}

#[derive(Debug, Serialize)]
struct PlatformHealth {
    pipeline: HealthSnapshot,
    buffer: BufferStatus,
}

/// Build a [`MetricEvent`] from an ingest body. The payload type comes from
/// the path; `tenantId` in the body scopes the event (default tenant
/// otherwise).
fn event_from_body(
    event_type: &str,
    mut body: serde_json::Value,
) -> Result<MetricEvent, String> {
    let Some(map) = body.as_object_mut() else {
        return Err("body must be a JSON object".to_string());
    };
    let tenant_id = map
        .remove("tenantId")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "default".to_string());
    map.insert(
        "type".to_string(),
        serde_json::Value::String(event_type.to_string()),
    );

    let payload: EventPayload =
        serde_json::from_value(body).map_err(|e| format!("invalid {event_type} payload: {e}"))?;
    Ok(MetricEvent::new(tenant_id, payload))
}

async fn ingest_event_handler(
    State(state): State<Arc<AdminState>>,
    Path(event_type): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let event = match event_from_body(&event_type, body) {
        Ok(event) => event,
        Err(reason) => {
            tracing::debug!(event_type = %event_type, reason = %reason, "Rejecting ingest request");
            return StatusCode::BAD_REQUEST;
        }
    };

    if state.buffer.publish(event) {
        StatusCode::ACCEPTED
    } else {
        state.health.record_drop(1);
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn ingest_batch_handler(
    State(state): State<Arc<AdminState>>,
    Json(items): Json<Vec<serde_json::Value>>,
) -> Result<Json<IngestSummary>, StatusCode> {
    if items.len() > MAX_BATCH_ITEMS {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut accepted = 0;
    let mut dropped = 0;
    for mut item in items {
        let event_type = item
            .get("type")
            .and_then(|v| v.as_str().map(str::to_string));
        let Some(event_type) = event_type else {
            dropped += 1;
            continue;
        };
        if let Some(map) = item.as_object_mut() {
            map.remove("type");
        }
        match event_from_body(&event_type, item) {
            Ok(event) => {
                if state.buffer.publish(event) {
                    accepted += 1;
                } else {
                    state.health.record_drop(1);
                    dropped += 1;
                }
            }
            Err(_) => dropped += 1,
        }
    }

    Ok(Json(IngestSummary { accepted, dropped }))
}

async fn platform_health_handler(
    State(state): State<Arc<AdminState>>,
) -> Json<PlatformHealth> {
    state
        .health
        .update_buffer_usage(state.buffer.usage_percent());
    Json(PlatformHealth {
        pipeline: state.health.snapshot(),
        buffer: BufferStatus {
            capacity: state.buffer.capacity(),
            size: state.buffer.size(),
            usage_percent: state.buffer.usage_percent(),
            dropped_count: state.buffer.dropped_count(),
        },
    })
}
