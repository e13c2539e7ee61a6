//! Batching metric writer.
//!
//! Drains the ring buffer on a schedule, enriches token-usage events with
//! cost, and batch-inserts into the event store. The request path never
//! waits on any of this: a failed insert is counted and the batch discarded
//! (the buffer is already drained, and re-queueing would risk unbounded
//! growth), so metric loss is bounded and explicit.
//!
//! Lifecycle: `start()` schedules the recurring flush exactly once no matter
//! how many times it is called; `stop()` cancels the schedule, waits for any
//! in-flight flush, then performs one final synchronous flush. Both are
//! idempotent. A single flush mutex serializes timer ticks, extra writer
//! tasks, and the final stop-flush; ticks that fire while a flush is running
//! are skipped rather than queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rust_decimal::Decimal;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::buffer::RingBuffer;
use crate::config::WriterConfig;
use crate::cost::CostModel;
use crate::events::{EventPayload, MetricEvent};
use crate::health::PipelineHealth;
use crate::store::EventStore;

/// Background writer that moves events from the ring buffer to the store.
pub struct MetricWriter {
    buffer: Arc<RingBuffer<MetricEvent>>,
    store: Arc<dyn EventStore>,
    cost_model: Option<Arc<dyn CostModel>>,
    health: Arc<PipelineHealth>,
    config: WriterConfig,
    flush_lock: Mutex<()>,
    started: AtomicBool,
    /// Sends `true` exactly once, on shutdown. `watch` keeps the value, so
    /// a task that was mid-flush when `stop()` ran still observes it.
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MetricWriter {
    pub fn new(
        buffer: Arc<RingBuffer<MetricEvent>>,
        store: Arc<dyn EventStore>,
        health: Arc<PipelineHealth>,
        config: WriterConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            buffer,
            store,
            cost_model: None,
            health,
            config,
            flush_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Enable cost enrichment for token-usage events.
    pub fn with_cost_model(mut self, model: Arc<dyn CostModel>) -> Self {
        self.cost_model = Some(model);
        self
    }

    /// Start the recurring flush tasks. Idempotent: repeat calls while
    /// running are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let task_count = self.config.threads.max(1);
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for _ in 0..task_count {
            let writer = Arc::clone(self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                writer.run_flush_loop(shutdown_rx).await;
            }));
        }
        tracing::debug!(
            tasks = task_count,
            interval_ms = self.config.flush_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Metric writer started"
        );
    }

    /// Stop the writer: cancel future flushes, wait for in-flight flushes,
    /// then run exactly one final flush. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        // Final synchronous flush of whatever remains. Taking the flush lock
        // also waits out any flush still releasing it.
        self.flush().await;
        tracing::debug!("Metric writer stopped");
    }

    async fn run_flush_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; consume it so
        // the loop flushes on the configured period.
        interval.tick().await;

        while !*shutdown_rx.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    // A tick overlapping a running flush is dropped; the next
                    // tick picks the events up.
                    if let Ok(guard) = self.flush_lock.try_lock() {
                        self.flush_under_lock().await;
                        drop(guard);
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    /// Drain, enrich, and persist one batch under the flush mutex.
    ///
    /// Returns the number of events persisted (zero on empty batch or
    /// store failure).
    pub async fn flush(&self) -> usize {
        let _guard = self.flush_lock.lock().await;
        self.flush_under_lock().await
    }

    async fn flush_under_lock(&self) -> usize {
        let mut events = self.buffer.drain(self.config.batch_size);
        self.health.update_buffer_usage(self.buffer.usage_percent());
        if events.is_empty() {
            return 0;
        }

        if let Some(cost_model) = &self.cost_model {
            for event in &mut events {
                enrich_cost(event, cost_model.as_ref());
            }
        }

        let count = events.len();
        let started = Instant::now();
        match self.store.batch_insert(&events).await {
            Ok(()) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.health.record_write(count, latency_ms);
                tracing::trace!(count, latency_ms, "Metric batch persisted");
                count
            }
            Err(e) => {
                // Lossy by design: the batch is already out of the buffer and
                // re-queueing would risk unbounded growth.
                self.health.record_write_error();
                tracing::warn!(count, error = %e, "Metric batch insert failed, discarding batch");
                0
            }
        }
    }
}

impl std::fmt::Debug for MetricWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricWriter")
            .field("batch_size", &self.config.batch_size)
            .field("flush_interval", &self.config.flush_interval)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

/// Fill in `estimated_cost_usd` for token-usage events that arrive unpriced.
///
/// Events that already carry a non-zero cost are left untouched. A cost
/// model error keeps the original event — enrichment must never lose data.
fn enrich_cost(event: &mut MetricEvent, cost_model: &dyn CostModel) {
    let EventPayload::TokenUsage(usage) = &mut event.payload else {
        return;
    };
    if usage.estimated_cost_usd != Decimal::ZERO {
        return;
    }

    match cost_model.estimate(
        &usage.provider,
        &usage.model,
        event.timestamp,
        usage.prompt_tokens,
        0,
        usage.completion_tokens,
        0,
    ) {
        Ok(cost) if cost > Decimal::ZERO => {
            usage.estimated_cost_usd = cost;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(
                provider = %usage.provider,
                model = %usage.model,
                error = %e,
                "Cost enrichment failed, keeping original event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    use crate::cost::CostError;
    use crate::error::StoreError;
    use crate::events::TokenUsageEvent;
    use crate::store::MemoryEventStore;

    struct FixedCost(Decimal);

    impl CostModel for FixedCost {
        fn estimate(
            &self,
            _provider: &str,
            _model: &str,
            _at: DateTime<Utc>,
            _prompt: u64,
            _cached: u64,
            _completion: u64,
            _reasoning: u64,
        ) -> Result<Decimal, CostError> {
            Ok(self.0)
        }
    }

    struct FailingCost;

    impl CostModel for FailingCost {
        fn estimate(
            &self,
            _provider: &str,
            _model: &str,
            _at: DateTime<Utc>,
            _prompt: u64,
            _cached: u64,
            _completion: u64,
            _reasoning: u64,
        ) -> Result<Decimal, CostError> {
            Err(CostError::Lookup("pricing backend down".into()))
        }
    }

    struct FailingStore;

    #[async_trait]
    impl EventStore for FailingStore {
        async fn batch_insert(&self, _events: &[MetricEvent]) -> Result<(), StoreError> {
            Err(StoreError::Insert("injected failure".into()))
        }
    }

    /// Counts how many times the cost model was consulted.
    struct CountingCost(std::sync::atomic::AtomicUsize);

    impl CostModel for CountingCost {
        fn estimate(
            &self,
            _provider: &str,
            _model: &str,
            _at: DateTime<Utc>,
            _prompt: u64,
            _cached: u64,
            _completion: u64,
            _reasoning: u64,
        ) -> Result<Decimal, CostError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(dec!(0.001))
        }
    }

    fn usage_event(run_id: &str, cost: Decimal) -> MetricEvent {
        let mut usage = TokenUsageEvent::new(run_id, "google", "gemini-2.0-flash", 100, 50);
        usage.estimated_cost_usd = cost;
        MetricEvent::new("t1", EventPayload::TokenUsage(usage))
    }

    fn slow_interval_config(batch_size: usize) -> WriterConfig {
        WriterConfig {
            batch_size,
            flush_interval: Duration::from_secs(3600),
            threads: 1,
        }
    }

    #[tokio::test]
    async fn flush_enriches_zero_cost_events() {
        let buffer = Arc::new(RingBuffer::new(64));
        let store = Arc::new(MemoryEventStore::new());
        let health = Arc::new(PipelineHealth::new());
        let writer = Arc::new(
            MetricWriter::new(
                Arc::clone(&buffer),
                Arc::clone(&store) as Arc<dyn EventStore>,
                Arc::clone(&health),
                slow_interval_config(10),
            )
            .with_cost_model(Arc::new(FixedCost(dec!(0.0025)))),
        );

        assert!(buffer.publish(usage_event("r-1", Decimal::ZERO)));
        writer.start();
        writer.stop().await;

        let inserted = store.inserted().await;
        assert_eq!(inserted.len(), 1);
        match &inserted[0].payload {
            EventPayload::TokenUsage(u) => assert_eq!(u.estimated_cost_usd, dec!(0.0025)),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(health.written_total(), 1);
    }

    #[tokio::test]
    async fn pre_priced_events_skip_the_cost_model() {
        let buffer = Arc::new(RingBuffer::new(64));
        let store = Arc::new(MemoryEventStore::new());
        let health = Arc::new(PipelineHealth::new());
        let counting = Arc::new(CountingCost(std::sync::atomic::AtomicUsize::new(0)));
        let writer = MetricWriter::new(
            Arc::clone(&buffer),
            Arc::clone(&store) as Arc<dyn EventStore>,
            health,
            slow_interval_config(10),
        )
        .with_cost_model(Arc::clone(&counting) as Arc<dyn CostModel>);

        buffer.publish(usage_event("r-1", dec!(0.5)));
        writer.flush().await;

        assert_eq!(counting.0.load(Ordering::SeqCst), 0);
        match &store.inserted().await[0].payload {
            EventPayload::TokenUsage(u) => assert_eq!(u.estimated_cost_usd, dec!(0.5)),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn cost_model_failure_keeps_original_event() {
        let buffer = Arc::new(RingBuffer::new(64));
        let store = Arc::new(MemoryEventStore::new());
        let writer = MetricWriter::new(
            Arc::clone(&buffer),
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::new(PipelineHealth::new()),
            slow_interval_config(10),
        )
        .with_cost_model(Arc::new(FailingCost));

        buffer.publish(usage_event("r-1", Decimal::ZERO));
        assert_eq!(writer.flush().await, 1);

        match &store.inserted().await[0].payload {
            EventPayload::TokenUsage(u) => assert_eq!(u.estimated_cost_usd, Decimal::ZERO),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_failure_discards_batch_and_counts_error() {
        let buffer = Arc::new(RingBuffer::new(64));
        let health = Arc::new(PipelineHealth::new());
        let writer = MetricWriter::new(
            Arc::clone(&buffer),
            Arc::new(FailingStore),
            Arc::clone(&health),
            slow_interval_config(10),
        );

        buffer.publish(usage_event("r-1", Decimal::ZERO));
        assert_eq!(writer.flush().await, 0);

        assert_eq!(health.write_errors_total(), 1);
        assert_eq!(health.written_total(), 0);
        assert_eq!(buffer.size(), 0, "failed batch is not re-queued");
        // A later flush has nothing to re-deliver.
        assert_eq!(writer.flush().await, 0);
        assert_eq!(health.write_errors_total(), 1, "empty batch skips the store");
    }

    #[tokio::test]
    async fn empty_flush_skips_the_store() {
        let buffer = Arc::new(RingBuffer::new(64));
        let health = Arc::new(PipelineHealth::new());
        let writer = MetricWriter::new(
            Arc::clone(&buffer),
            Arc::new(FailingStore),
            Arc::clone(&health),
            slow_interval_config(10),
        );

        assert_eq!(writer.flush().await, 0);
        assert_eq!(health.write_errors_total(), 0);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let buffer = Arc::new(RingBuffer::new(64));
        let store = Arc::new(MemoryEventStore::new());
        let writer = Arc::new(MetricWriter::new(
            Arc::clone(&buffer),
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::new(PipelineHealth::new()),
            slow_interval_config(10),
        ));

        writer.start();
        writer.start();
        {
            let tasks = writer.tasks.lock().unwrap();
            assert_eq!(tasks.len(), 1, "second start must not spawn more tasks");
        }

        buffer.publish(usage_event("r-1", Decimal::ZERO));
        writer.stop().await;
        writer.stop().await;

        assert_eq!(store.len().await, 1, "exactly one final flush");
    }

    #[tokio::test]
    async fn interval_flush_delivers_without_stop() {
        let buffer = Arc::new(RingBuffer::new(64));
        let store = Arc::new(MemoryEventStore::new());
        let writer = Arc::new(MetricWriter::new(
            Arc::clone(&buffer),
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::new(PipelineHealth::new()),
            WriterConfig {
                batch_size: 10,
                flush_interval: Duration::from_millis(20),
                threads: 2,
            },
        ));

        writer.start();
        buffer.publish(usage_event("r-1", Decimal::ZERO));

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.is_empty().await {
            assert!(Instant::now() < deadline, "interval flush never delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        writer.stop().await;
        assert_eq!(store.len().await, 1);
    }
}
