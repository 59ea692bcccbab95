// src/models/mod.rs

//! Domain models for the advisory engine.
//!
//! This module contains all data structures used throughout the engine,
//! organized by their primary purpose.

mod advisory;
mod change;
mod config;
mod job;
mod risk;

// Re-export all public types
pub use advisory::{AdvisoryKey, AdvisoryRecord, RawContent};
pub use change::{ChangeEvent, ChangeType};
pub use config::{
    CacheConfig, CircuitBreakerConfig, Config, DeadLetterConfig, EngineConfig, HealthConfig,
    HttpConfig, RateLimitConfig, RespectfulHours, RetryConfig, SchedulerConfig, SourceConfig,
    StorageConfig,
};
pub use job::{
    DeadLetterEntry, JobIds, JobStatus, JobTrigger, QueueClass, ScrapeJob, StatusChange,
};
pub use risk::RiskLevel;
