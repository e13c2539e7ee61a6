//! Dynamic guard rules with revision-validated caching.
//!
//! Output-guard rules are admin-mutable at runtime, so each consuming stage
//! caches the compiled rule list and revalidates with two keys: cache age
//! against a refresh interval, and the store's monotonic revision counter.
//! The revision only ever grows, so a pointer that was ever stale can never
//! be revalidated by a later mutation (no ABA).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::error::GuardError;

/// What to do when a rule's pattern matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    /// Reject the content outright.
    Block,
    /// Replace every match with the given text.
    Mask { replacement: String },
}

/// One admin-defined content rule.
#[derive(Debug, Clone)]
pub struct GuardRule {
    pub id: Uuid,
    pub name: String,
    pub pattern: String,
    pub action: RuleAction,
    pub priority: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl GuardRule {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, action: RuleAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            pattern: pattern.into(),
            action,
            priority: 100,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Admin-mutable rule store with a monotonic revision.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list(&self) -> Vec<GuardRule>;

    /// Bumped on every mutation.
    fn revision(&self) -> u64;
}

/// In-memory rule store.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: std::sync::RwLock<Vec<GuardRule>>,
    revision: AtomicU64,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, rule: GuardRule) {
        self.rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(rule);
        self.revision.fetch_add(1, Ordering::Release);
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut rules = self
            .rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = rules.len();
        rules.retain(|r| r.id != id);
        let removed = rules.len() != before;
        if removed {
            self.revision.fetch_add(1, Ordering::Release);
        }
        removed
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> bool {
        let mut rules = self
            .rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(rule) = rules.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        rule.enabled = enabled;
        drop(rules);
        self.revision.fetch_add(1, Ordering::Release);
        true
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn list(&self) -> Vec<GuardRule> {
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

/// A rule with its compiled pattern.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: GuardRule,
    pub regex: Regex,
}

struct CachedRules {
    cached_at: Instant,
    revision: u64,
    rules: Arc<Vec<CompiledRule>>,
}

/// Per-stage cache over a [`RuleStore`].
pub struct RuleCache {
    refresh_interval: Duration,
    state: tokio::sync::Mutex<Option<CachedRules>>,
}

impl RuleCache {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Current enabled rules, sorted by `(priority asc, created_at asc)`,
    /// compiled. Rules with invalid patterns are dropped with a warning —
    /// one bad admin rule must not disable the rest.
    pub async fn get(&self, store: &dyn RuleStore) -> Result<Arc<Vec<CompiledRule>>, GuardError> {
        let current_revision = store.revision();
        let mut state = self.state.lock().await;

        // Double-checked under the per-stage mutex.
        if let Some(cached) = state.as_ref() {
            if cached.cached_at.elapsed() <= self.refresh_interval
                && cached.revision == current_revision
            {
                return Ok(Arc::clone(&cached.rules));
            }
        }

        let mut rules = store.list().await;
        rules.retain(|r| r.enabled);
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let compiled: Vec<CompiledRule> = rules
            .into_iter()
            .filter_map(|rule| match Regex::new(&rule.pattern) {
                Ok(regex) => Some(CompiledRule { rule, regex }),
                Err(e) => {
                    tracing::warn!(
                        rule = %rule.name,
                        pattern = %rule.pattern,
                        error = %e,
                        "Skipping rule with invalid pattern"
                    );
                    None
                }
            })
            .collect();

        let rules = Arc::new(compiled);
        *state = Some(CachedRules {
            cached_at: Instant::now(),
            revision: current_revision,
            rules: Arc::clone(&rules),
        });
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_serves_until_revision_bump() {
        let store = InMemoryRuleStore::new();
        store.insert(GuardRule::new("a", "aaa", RuleAction::Block));

        let cache = RuleCache::new(Duration::from_secs(3600));
        let first = cache.get(&store).await.unwrap();
        assert_eq!(first.len(), 1);

        // Same revision: same Arc comes back.
        let second = cache.get(&store).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        store.insert(GuardRule::new("b", "bbb", RuleAction::Block));
        let third = cache.get(&store).await.unwrap();
        assert_eq!(third.len(), 2, "revision bump must refetch");
    }

    #[tokio::test]
    async fn disabled_rules_are_filtered() {
        let store = InMemoryRuleStore::new();
        let rule = GuardRule::new("off", "xxx", RuleAction::Block);
        let id = rule.id;
        store.insert(rule);
        store.insert(GuardRule::new("on", "yyy", RuleAction::Block));
        store.set_enabled(id, false);

        let cache = RuleCache::new(Duration::from_secs(3600));
        let rules = cache.get(&store).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule.name, "on");
    }

    #[tokio::test]
    async fn rules_sorted_by_priority_then_age() {
        let store = InMemoryRuleStore::new();
        store.insert(GuardRule::new("late-low", "a", RuleAction::Block).with_priority(10));
        store.insert(GuardRule::new("high", "b", RuleAction::Block).with_priority(1));
        store.insert(GuardRule::new("mid", "c", RuleAction::Block).with_priority(5));

        let cache = RuleCache::new(Duration::from_secs(3600));
        let rules = cache.get(&store).await.unwrap();
        let names: Vec<&str> = rules.iter().map(|r| r.rule.name.as_str()).collect();
        assert_eq!(names, vec!["high", "mid", "late-low"]);
    }

    #[tokio::test]
    async fn invalid_patterns_are_skipped_not_fatal() {
        let store = InMemoryRuleStore::new();
        store.insert(GuardRule::new("bad", "([unclosed", RuleAction::Block));
        store.insert(GuardRule::new("good", "fine", RuleAction::Block));

        let cache = RuleCache::new(Duration::from_secs(3600));
        let rules = cache.get(&store).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule.name, "good");
    }

    #[tokio::test]
    async fn removal_bumps_revision() {
        let store = InMemoryRuleStore::new();
        let rule = GuardRule::new("gone", "zzz", RuleAction::Block);
        let id = rule.id;
        store.insert(rule);
        let rev_before = store.revision();
        assert!(store.remove(id));
        assert!(store.revision() > rev_before);
        assert!(!store.remove(id), "second removal is a no-op");
    }
}
