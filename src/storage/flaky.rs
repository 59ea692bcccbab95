//! Memory store whose job writes can be made to fail.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::{
    AdvisoryKey, AdvisoryRecord, ChangeEvent, DeadLetterEntry, JobStatus, ScrapeJob,
};
use crate::storage::{AdvisoryStore, MemoryStore};
use crate::utils::lock;

#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_saves: Mutex<HashMap<JobStatus, u32>>,
    failing_dead_letters: Mutex<u32>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` saves of a job in `status`.
    pub fn fail_saves(&self, status: JobStatus, times: u32) {
        *lock(&self.failing_saves).entry(status).or_default() += times;
    }

    /// Fail the next `times` dead-letter writes.
    pub fn fail_dead_letters(&self, times: u32) {
        *lock(&self.failing_dead_letters) += times;
    }

    fn take_failure(&self, status: JobStatus) -> bool {
        let mut failing = lock(&self.failing_saves);
        match failing.get_mut(&status) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl AdvisoryStore for FlakyStore {
    async fn replace_advisory(&self, record: AdvisoryRecord) -> Result<Option<AdvisoryRecord>> {
        self.inner.replace_advisory(record).await
    }

    async fn advisory(&self, key: &AdvisoryKey) -> Result<Option<AdvisoryRecord>> {
        self.inner.advisory(key).await
    }

    async fn advisories(
        &self,
        country: &str,
        source: Option<&str>,
    ) -> Result<Vec<AdvisoryRecord>> {
        self.inner.advisories(country, source).await
    }

    async fn append_change(&self, event: ChangeEvent) -> Result<ChangeEvent> {
        self.inner.append_change(event).await
    }

    async fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeEvent>> {
        self.inner.changes_since(since).await
    }

    async fn save_job(&self, job: &ScrapeJob) -> Result<()> {
        if self.take_failure(job.status) {
            return Err(AppError::persistence(format!("disk unavailable saving {}", job.id)));
        }
        self.inner.save_job(job).await
    }

    async fn job(&self, id: &str) -> Result<Option<ScrapeJob>> {
        self.inner.job(id).await
    }

    async fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<ScrapeJob>> {
        self.inner.jobs(status).await
    }

    async fn put_dead_letter(&self, entry: DeadLetterEntry) -> Result<()> {
        {
            let mut left = lock(&self.failing_dead_letters);
            if *left > 0 {
                *left -= 1;
                return Err(AppError::persistence("disk unavailable"));
            }
        }
        self.inner.put_dead_letter(entry).await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        self.inner.dead_letters().await
    }

    async fn take_dead_letter(&self, id: &str) -> Result<Option<DeadLetterEntry>> {
        self.inner.take_dead_letter(id).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}
