//! Pipeline health monitor.
//!
//! Pure atomic counters and gauges describing the metric pipeline itself:
//! how much was persisted, how much was shed, and how the buffer is doing.
//! Updated by the writer and the emitters, read by the admin surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters and gauges for the metric pipeline.
#[derive(Debug, Default)]
pub struct PipelineHealth {
    written_total: AtomicU64,
    dropped_total: AtomicU64,
    write_errors_total: AtomicU64,
    /// Gauge: latency of the most recent successful write, in milliseconds.
    write_latency_ms: AtomicU64,
    /// Gauge: buffer fill percentage, stored as f64 bits.
    buffer_usage_percent: AtomicU64,
}

/// Consistent point-in-time copy of [`PipelineHealth`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub written_total: u64,
    pub dropped_total: u64,
    pub write_errors_total: u64,
    pub write_latency_ms: u64,
    pub buffer_usage_percent: f64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful batch write of `count` events.
    pub fn record_write(&self, count: usize, latency_ms: u64) {
        self.written_total.fetch_add(count as u64, Ordering::Relaxed);
        self.write_latency_ms.store(latency_ms, Ordering::Relaxed);
    }

    /// Record `count` events shed before reaching the store.
    pub fn record_drop(&self, count: usize) {
        self.dropped_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a failed batch insert.
    pub fn record_write_error(&self) {
        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the buffer usage gauge.
    pub fn update_buffer_usage(&self, percent: f64) {
        self.buffer_usage_percent
            .store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn written_total(&self) -> u64 {
        self.written_total.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    /// Snapshot all counters and gauges.
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            written_total: self.written_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            write_errors_total: self.write_errors_total.load(Ordering::Relaxed),
            write_latency_ms: self.write_latency_ms.load(Ordering::Relaxed),
            buffer_usage_percent: f64::from_bits(
                self.buffer_usage_percent.load(Ordering::Relaxed),
            ),
        }
    }
}
