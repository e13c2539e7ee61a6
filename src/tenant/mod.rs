//! Tenants: identity, plans, quotas, resolution, and usage tracking.
//!
//! Tenant scope is resolved once per request and then travels inside the
//! hook context metadata (see [`crate::hooks::hook::TENANT_ID_KEY`]). A
//! `default` tenant always exists so unscoped requests still land somewhere
//! accountable.

pub mod quota;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TenantError;

/// Reserved id of the tenant that always exists.
pub const DEFAULT_TENANT_ID: &str = "default";

/// Subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantPlan {
    Free,
    Pro,
    Enterprise,
}

/// Whether the tenant may currently make requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    Active,
    Suspended,
}

/// Monthly usage ceilings. Enterprise tenants typically use
/// [`TenantQuota::unbounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQuota {
    pub max_requests_per_month: i64,
    pub max_tokens_per_month: i64,
    pub max_users: i64,
}

impl TenantQuota {
    pub fn new(max_requests_per_month: i64, max_tokens_per_month: i64, max_users: i64) -> Self {
        Self {
            max_requests_per_month,
            max_tokens_per_month,
            max_users,
        }
    }

    /// Effectively no limits.
    pub fn unbounded() -> Self {
        Self {
            max_requests_per_month: i64::MAX,
            max_tokens_per_month: i64::MAX,
            max_users: i64::MAX,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_requests_per_month < 0 || self.max_tokens_per_month < 0 || self.max_users < 0 {
            return Err("quota fields must be non-negative".to_string());
        }
        Ok(())
    }
}

/// One tenant record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub display_name: String,
    pub plan: TenantPlan,
    pub status: TenantStatus,
    pub quota: TenantQuota,
}

impl Tenant {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        plan: TenantPlan,
        quota: TenantQuota,
    ) -> Result<Self, TenantError> {
        let id = id.into();
        if !is_valid_slug(&id) {
            return Err(TenantError::InvalidSlug { slug: id });
        }
        quota
            .validate()
            .map_err(|message| TenantError::InvalidQuota {
                id: id.clone(),
                message,
            })?;
        Ok(Self {
            id,
            display_name: display_name.into(),
            plan,
            status: TenantStatus::Active,
            quota,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

/// Validate a tenant slug: lowercase alphanumerics and dashes, no leading or
/// trailing dash, at least two characters.
pub fn is_valid_slug(slug: &str) -> bool {
    let bytes = slug.as_bytes();
    if bytes.len() < 2 {
        return false;
    }
    let inner_ok = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
    let edge = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    inner_ok && edge(&bytes[0]) && edge(&bytes[bytes.len() - 1])
}

/// Read-heavy tenant store with a monotonic revision bumped on mutation.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get(&self, id: &str) -> Option<Tenant>;

    async fn upsert(&self, tenant: Tenant) -> Result<(), TenantError>;

    async fn list(&self) -> Vec<Tenant>;

    fn revision(&self) -> u64;
}

/// In-memory tenant store, seeded with the `default` tenant.
#[derive(Debug)]
pub struct InMemoryTenantStore {
    tenants: tokio::sync::RwLock<HashMap<String, Tenant>>,
    revision: AtomicU64,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        let default_tenant = Tenant {
            id: DEFAULT_TENANT_ID.to_string(),
            display_name: "Default".to_string(),
            plan: TenantPlan::Enterprise,
            status: TenantStatus::Active,
            quota: TenantQuota::unbounded(),
        };
        let mut tenants = HashMap::new();
        tenants.insert(default_tenant.id.clone(), default_tenant);
        Self {
            tenants: tokio::sync::RwLock::new(tenants),
            revision: AtomicU64::new(0),
        }
    }

    /// Change a tenant's status. Returns false for unknown tenants.
    pub async fn set_status(&self, id: &str, status: TenantStatus) -> bool {
        let mut tenants = self.tenants.write().await;
        let Some(tenant) = tenants.get_mut(id) else {
            return false;
        };
        tenant.status = status;
        drop(tenants);
        self.revision.fetch_add(1, Ordering::Release);
        true
    }
}

impl Default for InMemoryTenantStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn get(&self, id: &str) -> Option<Tenant> {
        self.tenants.read().await.get(id).cloned()
    }

    async fn upsert(&self, tenant: Tenant) -> Result<(), TenantError> {
        if !is_valid_slug(&tenant.id) {
            return Err(TenantError::InvalidSlug {
                slug: tenant.id.clone(),
            });
        }
        self.tenants
            .write()
            .await
            .insert(tenant.id.clone(), tenant);
        self.revision.fetch_add(1, Ordering::Release);
        Ok(())
    }

    async fn list(&self) -> Vec<Tenant> {
        self.tenants.read().await.values().cloned().collect()
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

/// Resolves the tenant id for one request.
///
/// Order: explicit header value, then the ambient request attribute set by
/// upstream middleware, then the configured default.
#[derive(Debug, Clone)]
pub struct TenantResolver {
    default_tenant: String,
}

impl TenantResolver {
    pub fn new(default_tenant: impl Into<String>) -> Self {
        Self {
            default_tenant: default_tenant.into(),
        }
    }

    pub fn resolve(&self, header: Option<&str>, ambient: Option<&str>) -> String {
        let non_empty = |s: Option<&str>| {
            s.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        non_empty(header)
            .or_else(|| non_empty(ambient))
            .unwrap_or_else(|| self.default_tenant.clone())
    }
}

impl Default for TenantResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT_ID)
    }
}

/// A tenant's consumption within one calendar month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonthlyUsage {
    pub requests: i64,
    pub tokens: i64,
}

/// Month key (`yyyy-mm`) for a timestamp; the quota window is the calendar
/// month.
pub fn month_key(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

/// Usage counters per (tenant, month). Reads may be served from a periodic
/// refresh; a single over-quota request slipping through is acceptable.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn monthly_usage(&self, tenant_id: &str, month: &str) -> MonthlyUsage;

    async fn record_request(&self, tenant_id: &str, month: &str, tokens: i64);
}

/// In-memory usage store with exact counts.
#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    usage: tokio::sync::RwLock<HashMap<(String, String), MonthlyUsage>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/bootstrap helper: overwrite a tenant's usage for a month.
    pub async fn set_usage(&self, tenant_id: &str, month: &str, usage: MonthlyUsage) {
        self.usage
            .write()
            .await
            .insert((tenant_id.to_string(), month.to_string()), usage);
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn monthly_usage(&self, tenant_id: &str, month: &str) -> MonthlyUsage {
        self.usage
            .read()
            .await
            .get(&(tenant_id.to_string(), month.to_string()))
            .copied()
            .unwrap_or_default()
    }

    async fn record_request(&self, tenant_id: &str, month: &str, tokens: i64) {
        let mut usage = self.usage.write().await;
        let entry = usage
            .entry((tenant_id.to_string(), month.to_string()))
            .or_default();
        entry.requests += 1;
        entry.tokens += tokens;
    }
}
