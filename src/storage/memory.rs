//! In-process storage backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    AdvisoryKey, AdvisoryRecord, ChangeEvent, DeadLetterEntry, JobStatus, ScrapeJob,
};
use crate::services::normalizer;
use crate::storage::{AdvisoryStore, sort_jobs};
use crate::utils::lock;

#[derive(Default)]
struct ChangeLog {
    events: Vec<ChangeEvent>,
    next_id: u64,
}

/// Map-backed store. Each table has its own lock.
#[derive(Default)]
pub struct MemoryStore {
    advisories: Mutex<HashMap<AdvisoryKey, AdvisoryRecord>>,
    changes: Mutex<ChangeLog>,
    jobs: Mutex<HashMap<String, ScrapeJob>>,
    dead_letters: Mutex<BTreeMap<String, DeadLetterEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdvisoryStore for MemoryStore {
    async fn replace_advisory(&self, record: AdvisoryRecord) -> Result<Option<AdvisoryRecord>> {
        Ok(lock(&self.advisories).insert(record.key(), record))
    }

    async fn advisory(&self, key: &AdvisoryKey) -> Result<Option<AdvisoryRecord>> {
        Ok(lock(&self.advisories).get(key).cloned())
    }

    async fn advisories(
        &self,
        country: &str,
        source: Option<&str>,
    ) -> Result<Vec<AdvisoryRecord>> {
        let country = normalizer::normalize_country(country);
        let mut out: Vec<AdvisoryRecord> = lock(&self.advisories)
            .values()
            .filter(|r| r.country_code == country)
            .filter(|r| source.is_none_or(|s| r.source_id == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(out)
    }

    async fn append_change(&self, mut event: ChangeEvent) -> Result<ChangeEvent> {
        let mut log = lock(&self.changes);
        log.next_id += 1;
        event.id = log.next_id;
        log.events.push(event.clone());
        Ok(event)
    }

    async fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeEvent>> {
        Ok(lock(&self.changes)
            .events
            .iter()
            .filter(|e| e.detected_at >= since)
            .cloned()
            .collect())
    }

    async fn save_job(&self, job: &ScrapeJob) -> Result<()> {
        lock(&self.jobs).insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn job(&self, id: &str) -> Result<Option<ScrapeJob>> {
        Ok(lock(&self.jobs).get(id).cloned())
    }

    async fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<ScrapeJob>> {
        let mut out: Vec<ScrapeJob> = lock(&self.jobs)
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        sort_jobs(&mut out);
        Ok(out)
    }

    async fn put_dead_letter(&self, entry: DeadLetterEntry) -> Result<()> {
        lock(&self.dead_letters).insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        Ok(lock(&self.dead_letters).values().cloned().collect())
    }

    async fn take_dead_letter(&self, id: &str) -> Result<Option<DeadLetterEntry>> {
        Ok(lock(&self.dead_letters).remove(id))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
