//! Ingestion pipeline.
//!
//! - `scheduler` / `queue`: decide what runs and in which order
//! - `executor` / `worker`: run jobs through the limiter, breaker and adapters
//! - `change_detector`: turn parsed records into change events
//! - `retry`: retry, deferral and dead-letter decisions
//! - `metrics`: counters, source health and readiness

pub mod change_detector;
pub mod circuit_breaker;
pub mod executor;
pub mod metrics;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use change_detector::{ChangeDetector, ChangeOutcome};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
pub use executor::{JobExecutor, JobReport};
pub use metrics::{MetricsAggregator, MetricsSnapshot, Readiness, SourceHealth};
pub use queue::{JobQueue, QueueStatus};
pub use rate_limiter::{RateLimitState, RateLimiter};
pub use retry::{Disposition, RetryManager, RetryPolicy};
pub use scheduler::Scheduler;
pub use worker::WorkerPool;
