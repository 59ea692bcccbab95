//! Engine configuration structures.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::QueueClass;

/// Root engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool and job limits
    #[serde(default)]
    pub engine: EngineConfig,

    /// HTTP client settings shared by all adapters
    #[serde(default)]
    pub http: HttpConfig,

    /// Retry/backoff policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-source circuit breaker thresholds
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Fetch cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Health and readiness thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Default cadences per queue class
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Dead-letter sweep settings
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Persistence backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Sources to ingest
    #[serde(default = "defaults::sources")]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.engine.workers == 0 {
            return Err(AppError::validation("engine.workers must be > 0"));
        }
        if self.engine.job_hard_limit_secs == 0 {
            return Err(AppError::validation(
                "engine.job_hard_limit_secs must be > 0",
            ));
        }
        if self.engine.job_soft_limit_secs > self.engine.job_hard_limit_secs {
            return Err(AppError::validation(
                "engine.job_soft_limit_secs must be <= engine.job_hard_limit_secs",
            ));
        }
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::validation("http.timeout_secs must be > 0"));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(AppError::validation("retry.base_delay_ms must be > 0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(AppError::validation(
                "retry.max_delay_ms must be >= retry.base_delay_ms",
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_fraction) {
            return Err(AppError::validation(
                "retry.jitter_fraction must be in [0, 1)",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::validation(
                "circuit_breaker.failure_threshold must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.health.failure_rate_threshold) {
            return Err(AppError::validation(
                "health.failure_rate_threshold must be in [0, 1]",
            ));
        }
        if self.sources.is_empty() {
            return Err(AppError::validation("No sources defined"));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(AppError::validation("source id is empty"));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
            source.rate_limit.validate(&source.id)?;
        }
        Ok(())
    }

    /// Look up a source by id.
    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            http: HttpConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            scheduler: SchedulerConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            storage: StorageConfig::default(),
            sources: defaults::sources(),
        }
    }
}

/// Worker pool and job time limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent workers
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Backlog above which the engine reports not ready
    #[serde(default = "defaults::queue_backlog_limit")]
    pub queue_backlog_limit: usize,

    /// After this long the job's in-flight call is cancelled
    #[serde(default = "defaults::job_soft_limit")]
    pub job_soft_limit_secs: u64,

    /// Absolute bound on a job's total duration
    #[serde(default = "defaults::job_hard_limit")]
    pub job_hard_limit_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: defaults::workers(),
            queue_backlog_limit: defaults::queue_backlog_limit(),
            job_soft_limit_secs: defaults::job_soft_limit(),
            job_hard_limit_secs: defaults::job_hard_limit(),
        }
    }
}

impl EngineConfig {
    pub fn soft_limit(&self) -> Duration {
        Duration::from_secs(self.job_soft_limit_secs)
    }

    pub fn hard_limit(&self) -> Duration {
        Duration::from_secs(self.job_hard_limit_secs)
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Per-call timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    #[serde(default = "defaults::base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "defaults::max_delay")]
    pub max_delay_ms: u64,

    /// Relative jitter applied to each delay, e.g. 0.1 for ±10%
    #[serde(default = "defaults::jitter_fraction")]
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_ms: defaults::base_delay(),
            max_delay_ms: defaults::max_delay(),
            jitter_fraction: defaults::jitter_fraction(),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before allowing a trial call
    #[serde(default = "defaults::recovery_timeout")]
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::failure_threshold(),
            recovery_timeout_secs: defaults::recovery_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Fetch cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds a fetched body is reused; 0 disables caching
    #[serde(default = "defaults::cache_ttl")]
    pub ttl_secs: u64,

    /// Upper bound on cached entries
    #[serde(default = "defaults::cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::cache_ttl(),
            max_entries: defaults::cache_max_entries(),
        }
    }
}

/// Health and readiness thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Failure rate over the window above which a source is degraded
    #[serde(default = "defaults::failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Number of recent outcomes considered per source
    #[serde(default = "defaults::health_window")]
    pub window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: defaults::failure_rate_threshold(),
            window: defaults::health_window(),
        }
    }
}

/// Default cadences and priorities per queue class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "defaults::high_interval")]
    pub high_interval_secs: u64,

    #[serde(default = "defaults::regular_interval")]
    pub regular_interval_secs: u64,

    #[serde(default = "defaults::maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// How often the scheduler checks for due sources
    #[serde(default = "defaults::tick")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            high_interval_secs: defaults::high_interval(),
            regular_interval_secs: defaults::regular_interval(),
            maintenance_interval_secs: defaults::maintenance_interval(),
            tick_secs: defaults::tick(),
        }
    }
}

impl SchedulerConfig {
    /// Default cadence for a queue class.
    pub fn interval_for(&self, class: QueueClass) -> Duration {
        let secs = match class {
            QueueClass::High => self.high_interval_secs,
            QueueClass::Regular => self.regular_interval_secs,
            QueueClass::Maintenance => self.maintenance_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    /// Default priority for a queue class.
    pub fn priority_for(class: QueueClass) -> u8 {
        match class {
            QueueClass::High => 9,
            QueueClass::Regular => 5,
            QueueClass::Maintenance => 1,
        }
    }
}

/// Scheduled reprocessing of dead-lettered jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Seconds between sweeps; 0 disables the sweep
    #[serde(default)]
    pub sweep_interval_secs: u64,

    /// Entries younger than this are left alone
    #[serde(default = "defaults::dead_letter_min_age")]
    pub min_age_secs: u64,

    /// Automatic replays per job before it is left for manual handling
    #[serde(default = "defaults::dead_letter_max_reprocess")]
    pub max_reprocess: u32,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 0,
            min_age_secs: defaults::dead_letter_min_age(),
            max_reprocess: defaults::dead_letter_max_reprocess(),
        }
    }
}

/// Persistence backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-process only; state is lost on exit
    #[default]
    Memory,
    /// JSON files under a directory
    Local { root_dir: String },
}

/// One source to ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source identifier
    pub id: String,

    /// Registered adapter implementing this source; defaults to `id`
    #[serde(default)]
    pub adapter: Option<String>,

    #[serde(default)]
    pub queue_class: QueueClass,

    /// Overrides the queue class cadence
    #[serde(default)]
    pub cadence_secs: Option<u64>,

    /// Overrides the queue class priority
    #[serde(default)]
    pub priority: Option<u8>,

    /// Countries to schedule individually; empty schedules one all-countries job
    #[serde(default)]
    pub countries: Vec<String>,

    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, queue_class: QueueClass) -> Self {
        Self {
            id: id.into(),
            adapter: None,
            queue_class,
            cadence_secs: None,
            priority: None,
            countries: Vec::new(),
            enabled: true,
            rate_limit: RateLimitConfig::default(),
        }
    }

    pub fn adapter_id(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.id)
    }

    pub fn cadence(&self, scheduler: &SchedulerConfig) -> Duration {
        self.cadence_secs
            .map(|s| Duration::from_secs(s.max(1)))
            .unwrap_or_else(|| scheduler.interval_for(self.queue_class))
    }

    pub fn effective_priority(&self) -> u8 {
        self.priority
            .unwrap_or_else(|| SchedulerConfig::priority_for(self.queue_class))
    }
}

/// Per-source request pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum admitted requests in any rolling hour
    #[serde(default = "defaults::hourly_cap")]
    pub hourly_cap: u32,

    /// Maximum admitted requests in any burst interval
    #[serde(default = "defaults::burst_limit")]
    pub burst_limit: u32,

    #[serde(default = "defaults::burst_interval")]
    pub burst_interval_secs: u64,

    /// Minimum spacing between consecutive requests
    #[serde(default = "defaults::min_delay")]
    pub min_delay_ms: u64,

    #[serde(default)]
    pub respectful_hours: Option<RespectfulHours>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_cap: defaults::hourly_cap(),
            burst_limit: defaults::burst_limit(),
            burst_interval_secs: defaults::burst_interval(),
            min_delay_ms: defaults::min_delay(),
            respectful_hours: None,
        }
    }
}

impl RateLimitConfig {
    fn validate(&self, source_id: &str) -> Result<()> {
        if self.hourly_cap == 0 {
            return Err(AppError::validation(format!(
                "{source_id}: rate_limit.hourly_cap must be > 0"
            )));
        }
        if self.burst_limit == 0 {
            return Err(AppError::validation(format!(
                "{source_id}: rate_limit.burst_limit must be > 0"
            )));
        }
        if self.burst_interval_secs == 0 {
            return Err(AppError::validation(format!(
                "{source_id}: rate_limit.burst_interval_secs must be > 0"
            )));
        }
        if let Some(hours) = &self.respectful_hours {
            if hours.start_hour > 23 || hours.end_hour > 23 {
                return Err(AppError::validation(format!(
                    "{source_id}: respectful_hours must be within 0..=23"
                )));
            }
        }
        Ok(())
    }
}

/// Window during which extra delay is added between requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RespectfulHours {
    /// First hour of the window (inclusive)
    pub start_hour: u32,

    /// Hour the window ends (exclusive); may be below `start_hour` to wrap midnight
    pub end_hour: u32,

    /// Extra delay added to the minimum spacing inside the window
    pub extra_delay_ms: u64,

    /// Offset of the source's local time from UTC
    #[serde(default)]
    pub utc_offset_hours: i32,
}

impl RespectfulHours {
    /// Whether a local hour falls inside the window.
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour == self.end_hour {
            return false;
        }
        if self.start_hour < self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

mod defaults {
    use super::{QueueClass, RateLimitConfig, RespectfulHours, SourceConfig};

    // Engine defaults
    pub fn workers() -> usize {
        4
    }
    pub fn queue_backlog_limit() -> usize {
        500
    }
    pub fn job_soft_limit() -> u64 {
        120
    }
    pub fn job_hard_limit() -> u64 {
        180
    }

    // HTTP defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; AdvisoryEngine/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }

    // Retry defaults
    pub fn max_retries() -> u32 {
        3
    }
    pub fn base_delay() -> u64 {
        1_000
    }
    pub fn max_delay() -> u64 {
        60_000
    }
    pub fn jitter_fraction() -> f64 {
        0.1
    }

    // Breaker defaults
    pub fn failure_threshold() -> u32 {
        5
    }
    pub fn recovery_timeout() -> u64 {
        60
    }

    // Cache defaults
    pub fn cache_ttl() -> u64 {
        300
    }
    pub fn cache_max_entries() -> usize {
        1_024
    }

    // Health defaults
    pub fn failure_rate_threshold() -> f64 {
        0.5
    }
    pub fn health_window() -> usize {
        20
    }

    // Scheduler defaults
    pub fn high_interval() -> u64 {
        3_600
    }
    pub fn regular_interval() -> u64 {
        6 * 3_600
    }
    pub fn maintenance_interval() -> u64 {
        24 * 3_600
    }
    pub fn tick() -> u64 {
        30
    }

    // Dead-letter defaults
    pub fn dead_letter_min_age() -> u64 {
        3_600
    }
    pub fn dead_letter_max_reprocess() -> u32 {
        3
    }

    // Source defaults
    pub fn enabled() -> bool {
        true
    }
    pub fn hourly_cap() -> u32 {
        60
    }
    pub fn burst_limit() -> u32 {
        10
    }
    pub fn burst_interval() -> u64 {
        10
    }
    pub fn min_delay() -> u64 {
        1_000
    }

    pub fn sources() -> Vec<SourceConfig> {
        let business_hours = RespectfulHours {
            start_hour: 9,
            end_hour: 17,
            extra_delay_ms: 2_000,
            utc_offset_hours: -5,
        };
        vec![
            SourceConfig {
                countries: vec!["France".into(), "Mexico".into(), "Japan".into()],
                rate_limit: RateLimitConfig {
                    respectful_hours: Some(business_hours),
                    ..RateLimitConfig::default()
                },
                ..SourceConfig::new("us_state_dept", QueueClass::High)
            },
            SourceConfig {
                countries: vec!["France".into(), "Mexico".into(), "Japan".into()],
                ..SourceConfig::new("uk_fcdo", QueueClass::High)
            },
            SourceConfig::new("smartraveller", QueueClass::Regular),
        ]
    }
}
