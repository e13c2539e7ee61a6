//! Sliding-window rate limiting guard stage.
//!
//! Two rolling windows (one minute, one hour) per `(tenant, user)` key.
//! Tenant overrides replace the global defaults. Windows are pruned lazily
//! on access and idle keys are evicted in bulk to bound memory.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::GuardError;
use crate::guard::{GuardCommand, GuardResult, GuardStage, RejectCategory};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Evict idle keys once the map grows past this many entries.
const EVICTION_THRESHOLD: usize = 10_000;

#[derive(Default)]
struct Windows {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl Windows {
    fn prune(&mut self, now: Instant) {
        while self
            .minute
            .front()
            .is_some_and(|t| now.duration_since(*t) > MINUTE)
        {
            self.minute.pop_front();
        }
        while self
            .hour
            .front()
            .is_some_and(|t| now.duration_since(*t) > HOUR)
        {
            self.hour.pop_front();
        }
    }
}

/// Per-(tenant, user) sliding-window rate limiter.
pub struct RateLimitStage {
    per_minute: u32,
    per_hour: u32,
    tenant_overrides: HashMap<String, (u32, u32)>,
    windows: Mutex<HashMap<String, Windows>>,
}

impl RateLimitStage {
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        Self {
            per_minute,
            per_hour,
            tenant_overrides: HashMap::new(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_tenant_overrides(mut self, overrides: HashMap<String, (u32, u32)>) -> Self {
        self.tenant_overrides = overrides;
        self
    }

    fn limits_for(&self, tenant_id: &str) -> (u32, u32) {
        self.tenant_overrides
            .get(tenant_id)
            .copied()
            .unwrap_or((self.per_minute, self.per_hour))
    }
}

#[async_trait]
impl GuardStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "RateLimit"
    }

    fn order(&self) -> i32 {
        1
    }

    async fn check(&self, command: &GuardCommand) -> Result<GuardResult, GuardError> {
        let tenant_id = command.tenant_id().to_string();
        let (per_minute, per_hour) = self.limits_for(&tenant_id);
        let key = format!("{tenant_id}:{}", command.user_id);
        let now = Instant::now();

        let mut windows = self.windows.lock().await;
        if windows.len() > EVICTION_THRESHOLD {
            windows.retain(|_, w| !w.minute.is_empty() || !w.hour.is_empty());
        }

        let entry = windows.entry(key).or_default();
        entry.prune(now);

        if entry.minute.len() >= per_minute as usize {
            return Ok(GuardResult::rejected(
                format!("rate limit exceeded: {per_minute} requests per minute"),
                RejectCategory::RateLimited,
            ));
        }
        if entry.hour.len() >= per_hour as usize {
            return Ok(GuardResult::rejected(
                format!("rate limit exceeded: {per_hour} requests per hour"),
                RejectCategory::RateLimited,
            ));
        }

        entry.minute.push_back(now);
        entry.hour.push_back(now);
        Ok(GuardResult::allowed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(tenant: &str, user: &str) -> GuardCommand {
        GuardCommand::new("hello")
            .with_user(user)
            .with_metadata("tenantId", serde_json::json!(tenant))
    }

    #[tokio::test]
    async fn allows_under_both_windows() {
        let stage = RateLimitStage::new(5, 100);
        for _ in 0..5 {
            let result = stage.check(&command("t1", "u1")).await.unwrap();
            assert!(result.is_allowed());
        }
    }

    #[tokio::test]
    async fn rejects_over_minute_window() {
        let stage = RateLimitStage::new(3, 100);
        for _ in 0..3 {
            assert!(stage.check(&command("t1", "u1")).await.unwrap().is_allowed());
        }
        match stage.check(&command("t1", "u1")).await.unwrap() {
            GuardResult::Rejected { category, .. } => {
                assert_eq!(category, RejectCategory::RateLimited);
            }
            other => panic!("expected rate limit rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_over_hour_window() {
        // Minute window wide open; hour window is the binding constraint.
        let stage = RateLimitStage::new(1000, 2);
        assert!(stage.check(&command("t1", "u1")).await.unwrap().is_allowed());
        assert!(stage.check(&command("t1", "u1")).await.unwrap().is_allowed());
        let result = stage.check(&command("t1", "u1")).await.unwrap();
        assert!(!result.is_allowed());
    }

    #[tokio::test]
    async fn users_are_limited_independently() {
        let stage = RateLimitStage::new(1, 100);
        assert!(stage.check(&command("t1", "u1")).await.unwrap().is_allowed());
        assert!(stage.check(&command("t1", "u2")).await.unwrap().is_allowed());
        assert!(!stage.check(&command("t1", "u1")).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn same_user_in_different_tenants_is_independent() {
        let stage = RateLimitStage::new(1, 100);
        assert!(stage.check(&command("t1", "u1")).await.unwrap().is_allowed());
        assert!(stage.check(&command("t2", "u1")).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn tenant_override_replaces_defaults() {
        let stage = RateLimitStage::new(1, 1).with_tenant_overrides(
            [("vip".to_string(), (100, 1000))].into_iter().collect(),
        );

        // Default tenant hits the 1/minute limit immediately.
        assert!(stage.check(&command("t1", "u1")).await.unwrap().is_allowed());
        assert!(!stage.check(&command("t1", "u1")).await.unwrap().is_allowed());

        // Overridden tenant sails past it.
        for _ in 0..10 {
            assert!(stage.check(&command("vip", "u1")).await.unwrap().is_allowed());
        }
    }
}
