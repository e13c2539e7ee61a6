//! PostgreSQL event store backend.
//!
//! Persists events into a single `metric_events` time-series table with the
//! typed payload as `jsonb`. One transaction per batch keeps the
//! all-or-nothing contract. Retention (the default deployment uses 90 days,
//! dropped in 7-day chunks by an operator job) is deliberately outside this
//! module.

use async_trait::async_trait;
use deadpool_postgres::Pool;

use crate::error::StoreError;
use crate::events::MetricEvent;

/// DDL for the backing table. Applied by deployment tooling, kept here so
/// the schema and the insert statement evolve together.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS metric_events (
    event_id    UUID PRIMARY KEY,
    tenant_id   TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    run_id      TEXT,
    recorded_at TIMESTAMPTZ NOT NULL,
    payload     JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS metric_events_tenant_time_idx
    ON metric_events (tenant_id, recorded_at DESC);
CREATE INDEX IF NOT EXISTS metric_events_type_time_idx
    ON metric_events (event_type, recorded_at DESC);
"#;

/// PostgreSQL-backed [`crate::store::EventStore`].
pub struct PgEventStore {
    pool: Pool,
}

impl PgEventStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create the backing table and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA_SQL).await?;
        Ok(())
    }
}

#[async_trait]
impl crate::store::EventStore for PgEventStore {
    async fn batch_insert(&self, events: &[MetricEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        let statement = tx
            .prepare(
                "INSERT INTO metric_events \
                 (event_id, tenant_id, event_type, run_id, recorded_at, payload) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .await?;

        for event in events {
            let payload = serde_json::to_value(&event.payload)
                .map_err(|e| StoreError::Insert(format!("payload serialization: {e}")))?;
            tx.execute(
                &statement,
                &[
                    &event.event_id,
                    &event.tenant_id,
                    &event.kind(),
                    &event.run_id(),
                    &event.timestamp,
                    &payload,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for PgEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEventStore").finish()
    }
}
