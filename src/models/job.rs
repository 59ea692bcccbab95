//! Scrape jobs and dead-letter entries.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Lifecycle status of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure,
    Retrying,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Retrying => "retrying",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    /// Terminal statuses are never left except by reprocessing a dead letter.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::DeadLetter
        )
    }

    fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Retrying)
                | (Running, DeadLetter)
                // circuit-open deferral
                | (Running, Pending)
                | (Retrying, Pending)
                | (Retrying, Running)
                // reprocessing
                | (DeadLetter, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue partition a job is dispatched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    High,
    #[default]
    Regular,
    Maintenance,
}

impl QueueClass {
    /// Dispatch order, most urgent first.
    pub const ORDER: [QueueClass; 3] = [
        QueueClass::High,
        QueueClass::Regular,
        QueueClass::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::High => "high",
            QueueClass::Regular => "regular",
            QueueClass::Maintenance => "maintenance",
        }
    }
}

/// What caused a job to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    #[default]
    Scheduled,
    Manual,
    DeadLetterReplay,
}

/// One entry in a job's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A unit of ingestion work for one source and optionally one country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: String,
    pub source_id: String,

    /// `None` means every country the source covers
    #[serde(default)]
    pub country_code: Option<String>,

    /// Larger runs first within a queue class
    pub priority: u8,
    pub queue_class: QueueClass,
    #[serde(default)]
    pub trigger: JobTrigger,
    pub status: JobStatus,

    /// Executions that ended in a retryable error
    pub attempt_count: u32,

    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub history: Vec<StatusChange>,
}

impl ScrapeJob {
    /// Create a pending job.
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        country_code: Option<String>,
        queue_class: QueueClass,
        priority: u8,
        trigger: JobTrigger,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source_id: source_id.into(),
            country_code,
            priority,
            queue_class,
            trigger,
            status: JobStatus::Pending,
            attempt_count: 0,
            scheduled_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            history: vec![StatusChange {
                status: JobStatus::Pending,
                at: now,
                note: None,
            }],
        }
    }

    /// Move to `next`, recording the change in the history.
    pub fn transition(&mut self, next: JobStatus, note: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            JobStatus::Running => {
                self.started_at = Some(now);
                self.finished_at = None;
            }
            JobStatus::Pending => self.scheduled_at = now,
            status if status.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }

        self.status = next;
        self.history.push(StatusChange {
            status: next,
            at: now,
            note,
        });
        Ok(())
    }

    /// Human label, e.g. `us_state_dept/France` or `uk_fcdo/*`.
    pub fn target(&self) -> String {
        format!(
            "{}/{}",
            self.source_id,
            self.country_code.as_deref().unwrap_or("*")
        )
    }
}

/// A job that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Same as the job id
    pub id: String,
    pub job_snapshot: ScrapeJob,
    pub reason: String,
    pub attempt_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_attempted_at: DateTime<Utc>,
    /// How many times this job has already been replayed from the dead-letter store
    #[serde(default)]
    pub reprocess_count: u32,
}

/// Generates unique, sortable job identifiers.
#[derive(Debug, Default)]
pub struct JobIds {
    next: AtomicU64,
}

impl JobIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self, source_id: &str) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{:06}",
            source_id,
            Utc::now().format("%Y%m%d%H%M%S"),
            seq
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ScrapeJob {
        ScrapeJob::new(
            "j1",
            "us_state_dept",
            Some("France".into()),
            QueueClass::High,
            9,
            JobTrigger::Scheduled,
        )
    }

    #[test]
    fn happy_path_transitions() {
        let mut j = job();
        j.transition(JobStatus::Running, None).unwrap();
        assert!(j.started_at.is_some());
        j.transition(JobStatus::Success, None).unwrap();
        assert!(j.finished_at.is_some());
        let statuses: Vec<_> = j.history.iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Pending, JobStatus::Running, JobStatus::Success]
        );
    }

    #[test]
    fn retry_loop_transitions() {
        let mut j = job();
        j.transition(JobStatus::Running, None).unwrap();
        j.transition(JobStatus::Retrying, Some("timeout".into()))
            .unwrap();
        j.transition(JobStatus::Pending, None).unwrap();
        j.transition(JobStatus::Running, None).unwrap();
        j.transition(JobStatus::DeadLetter, None).unwrap();
        j.transition(JobStatus::Pending, Some("reprocess".into()))
            .unwrap();
        assert_eq!(j.status, JobStatus::Pending);
    }

    #[test]
    fn rejects_illegal_transitions() {
        let mut j = job();
        assert!(j.transition(JobStatus::Success, None).is_err());
        j.transition(JobStatus::Running, None).unwrap();
        j.transition(JobStatus::Success, None).unwrap();
        assert!(matches!(
            j.transition(JobStatus::Running, None),
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn job_ids_are_unique() {
        let ids = JobIds::new();
        let a = ids.next_id("x");
        let b = ids.next_id("x");
        assert_ne!(a, b);
        assert!(a.starts_with("x-"));
    }
}
