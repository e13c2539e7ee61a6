//! Cost calculation for LLM token usage.
//!
//! Pricing is time-ranged per `(provider, model)` and looked up at the
//! event's authoring time, so repricing a model never rewrites history.
//! Unknown models cost zero rather than erroring — cost enrichment must
//! never fail a flush.
//!
//! The calculator sits on the writer's enrichment path and keeps a small
//! in-process cache per `(provider, model)`, invalidated by age or by the
//! store's revision counter (bumped on every mutation, so a stale pointer
//! can never be revalidated by accident).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Per-1k-token prices for one `(provider, model)` over a validity window.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingRecord {
    pub provider: String,
    pub model: String,
    pub valid_from: DateTime<Utc>,
    /// `None` means open-ended.
    pub valid_to: Option<DateTime<Utc>>,
    pub prompt_per_1k: Decimal,
    pub cached_per_1k: Decimal,
    pub completion_per_1k: Decimal,
    pub reasoning_per_1k: Decimal,
}

impl PricingRecord {
    /// Whether this record applies at the given instant.
    pub fn applies_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.valid_from && self.valid_to.map_or(true, |end| at < end)
    }
}

/// Read-heavy store of pricing records with a monotonic revision.
pub trait PricingStore: Send + Sync {
    /// All records for one `(provider, model)`.
    fn records_for(&self, provider: &str, model: &str) -> Vec<PricingRecord>;

    /// Monotonically increasing revision, bumped on every mutation.
    fn revision(&self) -> u64;
}

/// In-memory pricing store seeded with a built-in table, mutable at runtime.
#[derive(Debug)]
pub struct InMemoryPricingStore {
    records: std::sync::RwLock<Vec<PricingRecord>>,
    revision: AtomicU64,
}

impl InMemoryPricingStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            records: std::sync::RwLock::new(Vec::new()),
            revision: AtomicU64::new(0),
        }
    }

    /// Store seeded with the built-in pricing table.
    pub fn with_default_table() -> Self {
        let store = Self::new();
        for record in default_pricing_table() {
            store.upsert(record);
        }
        store
    }

    /// Insert or replace the record with the same `(provider, model,
    /// valid_from)` key. Bumps the revision.
    pub fn upsert(&self, record: PricingRecord) {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.retain(|r| {
            !(r.provider == record.provider
                && r.model == record.model
                && r.valid_from == record.valid_from)
        });
        records.push(record);
        self.revision.fetch_add(1, Ordering::Release);
    }
}

impl Default for InMemoryPricingStore {
    fn default() -> Self {
        Self::with_default_table()
    }
}

impl PricingStore for InMemoryPricingStore {
    fn records_for(&self, provider: &str, model: &str) -> Vec<PricingRecord> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|r| r.provider == provider && r.model == model)
            .cloned()
            .collect()
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

/// Cost estimation errors.
///
/// Unknown models are not an error (they price at zero); errors here mean
/// the pricing backend itself misbehaved. The writer catches them and keeps
/// the un-enriched event.
#[derive(Debug, thiserror::Error)]
pub enum CostError {
    #[error("Pricing lookup failed: {0}")]
    Lookup(String),
}

/// Anything the writer can use to price a token usage event.
pub trait CostModel: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn estimate(
        &self,
        provider: &str,
        model: &str,
        at: DateTime<Utc>,
        prompt_tokens: u64,
        cached_tokens: u64,
        completion_tokens: u64,
        reasoning_tokens: u64,
    ) -> Result<Decimal, CostError>;
}

struct CachedPricing {
    cached_at: Instant,
    revision: u64,
    records: Vec<PricingRecord>,
}

/// Time-ranged cost calculator with a revision-validated cache.
pub struct CostCalculator<S: PricingStore> {
    store: S,
    refresh_interval: Duration,
    cache: Mutex<HashMap<(String, String), CachedPricing>>,
}

impl<S: PricingStore> CostCalculator<S> {
    pub fn new(store: S) -> Self {
        Self::with_refresh_interval(store, Duration::from_secs(60))
    }

    pub fn with_refresh_interval(store: S, refresh_interval: Duration) -> Self {
        Self {
            store,
            refresh_interval,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Compute the cost in USD for one call's token buckets.
    ///
    /// Returns zero for unknown models or when no record covers `at`.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate(
        &self,
        provider: &str,
        model: &str,
        at: DateTime<Utc>,
        prompt_tokens: u64,
        cached_tokens: u64,
        completion_tokens: u64,
        reasoning_tokens: u64,
    ) -> Decimal {
        let records = self.cached_records(provider, model);
        let Some(record) = records.iter().find(|r| r.applies_at(at)) else {
            return Decimal::ZERO;
        };

        let per_1k = |price: Decimal, tokens: u64| price * Decimal::from(tokens) / dec!(1000);
        per_1k(record.prompt_per_1k, prompt_tokens)
            + per_1k(record.cached_per_1k, cached_tokens)
            + per_1k(record.completion_per_1k, completion_tokens)
            + per_1k(record.reasoning_per_1k, reasoning_tokens)
    }

    fn cached_records(&self, provider: &str, model: &str) -> Vec<PricingRecord> {
        let key = (provider.to_string(), model.to_string());
        let current_revision = self.store.revision();
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Re-check under the lock: valid iff fresh AND the store revision
        // has not moved since the entry was cached.
        if let Some(entry) = cache.get(&key) {
            if entry.cached_at.elapsed() <= self.refresh_interval
                && entry.revision == current_revision
            {
                return entry.records.clone();
            }
        }

        let mut records = self.store.records_for(provider, model);
        records.sort_by_key(|r| std::cmp::Reverse(r.valid_from));
        cache.insert(
            key,
            CachedPricing {
                cached_at: Instant::now(),
                revision: current_revision,
                records: records.clone(),
            },
        );
        records
    }
}

impl<S: PricingStore> CostModel for CostCalculator<S> {
    fn estimate(
        &self,
        provider: &str,
        model: &str,
        at: DateTime<Utc>,
        prompt_tokens: u64,
        cached_tokens: u64,
        completion_tokens: u64,
        reasoning_tokens: u64,
    ) -> Result<Decimal, CostError> {
        Ok(self.calculate(
            provider,
            model,
            at,
            prompt_tokens,
            cached_tokens,
            completion_tokens,
            reasoning_tokens,
        ))
    }
}

/// Built-in pricing table (USD per 1k tokens), open-ended validity.
///
/// Operators replace or extend this via the store; it exists so a default
/// deployment prices the common models out of the box.
fn default_pricing_table() -> Vec<PricingRecord> {
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    let record = |provider: &str,
                  model: &str,
                  prompt: Decimal,
                  cached: Decimal,
                  completion: Decimal| PricingRecord {
        provider: provider.to_string(),
        model: model.to_string(),
        valid_from: epoch,
        valid_to: None,
        prompt_per_1k: prompt,
        cached_per_1k: cached,
        completion_per_1k: completion,
        reasoning_per_1k: completion,
    };

    vec![
        // OpenAI
        record("openai", "gpt-4o", dec!(0.0025), dec!(0.00125), dec!(0.01)),
        record("openai", "gpt-4o-mini", dec!(0.00015), dec!(0.000075), dec!(0.0006)),
        record("openai", "o1", dec!(0.015), dec!(0.0075), dec!(0.06)),
        record("openai", "o3-mini", dec!(0.0011), dec!(0.00055), dec!(0.0044)),
        // Anthropic
        record("anthropic", "claude-3-5-sonnet-latest", dec!(0.003), dec!(0.0003), dec!(0.015)),
        record("anthropic", "claude-3-5-haiku-latest", dec!(0.0008), dec!(0.00008), dec!(0.004)),
        // Google
        record("google", "gemini-2.0-flash", dec!(0.0001), dec!(0.000025), dec!(0.0004)),
        record("google", "gemini-1.5-pro", dec!(0.00125), dec!(0.0003125), dec!(0.005)),
    ]
}
