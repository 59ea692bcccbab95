//! Retry and dead-letter decisions.
//!
//! [`RetryManager::disposition`] is pure: it looks at a failed job and the
//! error it hit and says what should happen next. The executor applies it.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::error::{AppError, ErrorKind};
use crate::models::{DeadLetterEntry, JobStatus, RetryConfig, ScrapeJob};

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random, within 0..=1
    pub jitter_fraction: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_fraction: config.jitter_fraction.clamp(0.0, 1.0),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// `min(max_delay, base_delay * 2^attempt)`, before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff scaled by `1 + sample * jitter_fraction`, `sample` in `-1.0..=1.0`.
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let sample = sample.clamp(-1.0, 1.0);
        self.backoff(attempt)
            .mul_f64((1.0 + sample * self.jitter_fraction).max(0.0))
    }

    /// Randomized delay before retry number `attempt + 1`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample = rand::rng().random_range(-1.0..=1.0);
        self.delay_with_jitter(attempt, sample)
    }
}

/// What to do with a job whose execution just failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disposition {
    /// Consume one attempt and run again after the delay
    Retry(Duration),
    /// Run again after the delay without consuming an attempt
    Defer(Duration),
    /// Retry budget exhausted
    DeadLetter,
    /// Not fixable by waiting
    Fail,
    /// Engine shutting down; back to pending with the attempt not counted
    Interrupted,
}

#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

/// Shortest deferral while a breaker is open.
const MIN_DEFER: Duration = Duration::from_secs(1);

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide the fate of `job` after `err`.
    ///
    /// `job.attempt_count` must not yet include this failure.
    pub fn disposition(&self, job: &ScrapeJob, err: &AppError) -> Disposition {
        match err.kind() {
            ErrorKind::Network | ErrorKind::Persistence => {
                if job.attempt_count < self.policy.max_retries {
                    Disposition::Retry(self.policy.next_delay(job.attempt_count))
                } else {
                    Disposition::DeadLetter
                }
            }
            ErrorKind::CircuitOpen => {
                let wait = match err {
                    AppError::CircuitOpen { retry_after, .. } => *retry_after,
                    _ => MIN_DEFER,
                };
                Disposition::Defer(wait.max(MIN_DEFER))
            }
            ErrorKind::RateLimitDeferred => {
                let wait = match err {
                    AppError::RateLimitDeferred { wait, .. } => *wait,
                    _ => MIN_DEFER,
                };
                Disposition::Defer(wait.max(MIN_DEFER))
            }
            ErrorKind::Interrupted => Disposition::Interrupted,
            ErrorKind::Parse | ErrorKind::Validation | ErrorKind::Internal => Disposition::Fail,
        }
    }

    /// Snapshot a dead-lettered job.
    pub fn dead_letter_entry(&self, job: &ScrapeJob, reason: &str) -> DeadLetterEntry {
        let now = Utc::now();
        // First failure of the current run, i.e. since the last replay.
        let run_start = job
            .history
            .iter()
            .rposition(|h| {
                h.status == JobStatus::Pending && h.note.as_deref() == Some(REPROCESS_NOTE)
            })
            .unwrap_or(0);
        let first_failed_at = job.history[run_start..]
            .iter()
            .find(|h| matches!(h.status, JobStatus::Retrying | JobStatus::DeadLetter))
            .map(|h| h.at)
            .unwrap_or(now);

        DeadLetterEntry {
            id: job.id.clone(),
            job_snapshot: job.clone(),
            reason: reason.to_string(),
            attempt_count: job.attempt_count,
            first_failed_at,
            last_attempted_at: job.started_at.unwrap_or(now),
            reprocess_count: reprocess_count(job),
        }
    }
}

/// Status note recorded when a dead letter is replayed.
pub const REPROCESS_NOTE: &str = "reprocessed from dead letter";

/// Times `job` has been replayed out of the dead-letter store.
pub fn reprocess_count(job: &ScrapeJob) -> u32 {
    job.history
        .windows(2)
        .filter(|w| w[0].status == JobStatus::DeadLetter && w[1].status == JobStatus::Pending)
        .count() as u32
}
