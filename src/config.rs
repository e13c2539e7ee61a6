//! Configuration for the Aegis core.
//!
//! Every tunable documented in the platform contract is resolved here from
//! environment variables with sensible defaults, so a bare `Config::default()`
//! yields a working in-process pipeline and `Config::from_env()` picks up
//! operator overrides.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;

/// Main configuration for the core.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub buffer: BufferConfig,
    pub writer: WriterConfig,
    pub guard: GuardConfig,
    pub quota: QuotaConfig,
    pub request: RequestConfig,
    pub retry: RetryConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            buffer: BufferConfig::from_env()?,
            writer: WriterConfig::from_env()?,
            guard: GuardConfig::from_env()?,
            quota: QuotaConfig::from_env()?,
            request: RequestConfig::from_env()?,
            retry: RetryConfig::from_env()?,
        })
    }
}

/// Ring buffer sizing.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Requested capacity; the buffer rounds to a power of two, minimum 64.
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { capacity: 8192 }
    }
}

impl BufferConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            capacity: parse_env("AEGIS_BUFFER_CAPACITY", Self::default().capacity)?,
        })
    }
}

/// Metric writer scheduling.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Max events per flush.
    pub batch_size: usize,
    /// Flush period.
    pub flush_interval: Duration,
    /// Number of writer tasks. All share one flush mutex, so extra tasks only
    /// add tick redundancy, not parallel flushes.
    pub threads: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_millis(1000),
            threads: 1,
        }
    }
}

impl WriterConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            batch_size: parse_env("AEGIS_WRITER_BATCH_SIZE", defaults.batch_size)?,
            flush_interval: Duration::from_millis(parse_env(
                "AEGIS_WRITER_FLUSH_INTERVAL_MS",
                defaults.flush_interval.as_millis() as u64,
            )?),
            threads: parse_env("AEGIS_WRITER_THREADS", defaults.threads)?,
        })
    }
}

/// Guard pipeline tunables.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Default requests per rolling minute per (tenant, user).
    pub rate_per_minute: u32,
    /// Default requests per rolling hour per (tenant, user).
    pub rate_per_hour: u32,
    /// Per-tenant `(per_minute, per_hour)` overrides.
    pub tenant_rate_limits: HashMap<String, (u32, u32)>,
    /// Minimum input length in characters.
    pub input_min_chars: usize,
    /// Maximum input length in characters.
    pub input_max_chars: usize,
    /// Optional bound on system prompt length.
    pub system_prompt_max_chars: Option<usize>,
    /// Reject input when this fraction of characters is zero-width.
    pub unicode_max_zero_width_ratio: f64,
    /// Topic drift rejection threshold.
    pub topic_drift_threshold: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            rate_per_minute: 30,
            rate_per_hour: 600,
            tenant_rate_limits: HashMap::new(),
            input_min_chars: 1,
            input_max_chars: 10_000,
            system_prompt_max_chars: None,
            unicode_max_zero_width_ratio: 0.1,
            topic_drift_threshold: 0.7,
        }
    }
}

impl GuardConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            rate_per_minute: parse_env("AEGIS_GUARD_RATE_PER_MINUTE", defaults.rate_per_minute)?,
            rate_per_hour: parse_env("AEGIS_GUARD_RATE_PER_HOUR", defaults.rate_per_hour)?,
            tenant_rate_limits: parse_tenant_rate_limits("AEGIS_GUARD_TENANT_RATE_LIMITS")?,
            input_min_chars: parse_env("AEGIS_GUARD_INPUT_MIN_CHARS", defaults.input_min_chars)?,
            input_max_chars: parse_env("AEGIS_GUARD_INPUT_MAX_CHARS", defaults.input_max_chars)?,
            system_prompt_max_chars: optional_env("AEGIS_GUARD_SYSTEM_PROMPT_MAX_CHARS")?
                .map(|s| parse_value("AEGIS_GUARD_SYSTEM_PROMPT_MAX_CHARS", &s))
                .transpose()?,
            unicode_max_zero_width_ratio: parse_env(
                "AEGIS_GUARD_UNICODE_MAX_ZERO_WIDTH_RATIO",
                defaults.unicode_max_zero_width_ratio,
            )?,
            topic_drift_threshold: parse_env(
                "AEGIS_GUARD_TOPIC_DRIFT_THRESHOLD",
                defaults.topic_drift_threshold,
            )?,
        })
    }
}

/// Quota enforcement tunables.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Fraction of the request quota at which a warning event is emitted.
    pub warning_percent: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            warning_percent: 0.9,
        }
    }
}

impl QuotaConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            warning_percent: parse_env(
                "AEGIS_QUOTA_WARNING_PERCENT",
                Self::default().warning_percent,
            )?,
        })
    }
}

/// Per-request lifecycle bounds.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Wall-clock deadline for one agent request.
    pub timeout: Duration,
    /// Grace window for after-complete hooks once the deadline has expired.
    pub completion_grace: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            completion_grace: Duration::from_secs(5),
        }
    }
}

impl RequestConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            timeout: Duration::from_millis(parse_env(
                "AEGIS_REQUEST_TIMEOUT_MS",
                defaults.timeout.as_millis() as u64,
            )?),
            completion_grace: Duration::from_millis(parse_env(
                "AEGIS_REQUEST_COMPLETION_GRACE_MS",
                defaults.completion_grace.as_millis() as u64,
            )?),
        })
    }
}

/// LLM retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_attempts: parse_env("AEGIS_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
            initial_delay: Duration::from_millis(parse_env(
                "AEGIS_RETRY_INITIAL_DELAY_MS",
                defaults.initial_delay.as_millis() as u64,
            )?),
            multiplier: parse_env("AEGIS_RETRY_MULTIPLIER", defaults.multiplier)?,
            max_delay: Duration::from_millis(parse_env(
                "AEGIS_RETRY_MAX_DELAY_MS",
                defaults.max_delay.as_millis() as u64,
            )?),
        })
    }
}

/// Read an optional environment variable, treating empty strings as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "not valid unicode".to_string(),
        }),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{e}"),
    })
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

/// Parse `tenant=per_minute:per_hour` pairs separated by commas, e.g.
/// `acme=120:2000,globex=10:100`.
fn parse_tenant_rate_limits(key: &str) -> Result<HashMap<String, (u32, u32)>, ConfigError> {
    let mut limits = HashMap::new();
    let Some(raw) = optional_env(key)? else {
        return Ok(limits);
    };
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (tenant, rates) = entry.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected tenant=per_minute:per_hour, got '{entry}'"),
        })?;
        let (minute, hour) = rates.split_once(':').ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected per_minute:per_hour, got '{rates}'"),
        })?;
        limits.insert(
            tenant.trim().to_string(),
            (parse_value(key, minute)?, parse_value(key, hour)?),
        );
    }
    Ok(limits)
}
