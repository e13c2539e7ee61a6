//! Metric event persistence.
//!
//! The writer talks to a time-series store through [`EventStore`]; the batch
//! is all-or-nothing per call. [`MemoryEventStore`] backs tests and
//! single-process deployments; the PostgreSQL backend lives behind the
//! `postgres` feature.

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::events::MetricEvent;

/// Sink for drained metric batches.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist the batch. Must be all-or-nothing within one call; the list
    /// order is the only ordering guarantee callers get.
    async fn batch_insert(&self, events: &[MetricEvent]) -> Result<(), StoreError>;
}

/// In-memory event store.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<MetricEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything inserted so far.
    pub async fn inserted(&self) -> Vec<MetricEvent> {
        self.events.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn batch_insert(&self, events: &[MetricEvent]) -> Result<(), StoreError> {
        self.events.lock().await.extend_from_slice(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, TokenUsageEvent};

    #[tokio::test]
    async fn memory_store_appends_in_order() {
        let store = MemoryEventStore::new();
        let batch: Vec<MetricEvent> = (0..3)
            .map(|i| {
                MetricEvent::new(
                    "t",
                    EventPayload::TokenUsage(TokenUsageEvent::new(
                        format!("r-{i}"),
                        "openai",
                        "gpt-4o",
                        10,
                        5,
                    )),
                )
            })
            .collect();

        store.batch_insert(&batch).await.unwrap();
        store.batch_insert(&batch[..1]).await.unwrap();

        let inserted = store.inserted().await;
        assert_eq!(inserted.len(), 4);
        assert_eq!(inserted[0].run_id(), Some("r-0"));
        assert_eq!(inserted[2].run_id(), Some("r-2"));
    }
}
