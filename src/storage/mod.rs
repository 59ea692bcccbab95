//! Persistence for advisories, change events, jobs and dead letters.
//!
//! The engine talks to storage through [`AdvisoryStore`] only, so the
//! backend can be swapped without touching the pipeline.
//!
//! ## Backends
//!
//! - [`MemoryStore`]: process-local maps, used by tests and one-off runs
//! - [`LocalStorage`]: JSON files under a root directory
//!
//! ```text
//! {root}/
//! ├── advisories/{source}/{country}.json   # latest record per key
//! ├── changes.jsonl                        # append-only change log
//! ├── jobs/{id}.json                       # job table with history
//! └── dead_letters/{id}.json               # dead-letter table
//! ```

pub mod cache;
#[cfg(test)]
pub(crate) mod flaky;
pub mod local;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    AdvisoryKey, AdvisoryRecord, ChangeEvent, DeadLetterEntry, JobStatus, ScrapeJob,
    StorageConfig,
};

pub use cache::{CacheKey, TtlCache};
pub use local::LocalStorage;
pub use memory::MemoryStore;

/// Durable state shared by every worker.
///
/// Writes are last-writer-wins per key. `replace_advisory` is the only
/// read-modify-write and must be atomic per key.
#[async_trait]
pub trait AdvisoryStore: Send + Sync {
    /// Store `record` as the latest for its key and return the record it replaced.
    async fn replace_advisory(&self, record: AdvisoryRecord) -> Result<Option<AdvisoryRecord>>;

    async fn advisory(&self, key: &AdvisoryKey) -> Result<Option<AdvisoryRecord>>;

    /// Latest records for a country, optionally from one source only.
    async fn advisories(&self, country: &str, source: Option<&str>)
    -> Result<Vec<AdvisoryRecord>>;

    /// Append to the change log, returning the event with its sequence id.
    async fn append_change(&self, event: ChangeEvent) -> Result<ChangeEvent>;

    /// Events detected at or after `since`, in append order.
    async fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeEvent>>;

    async fn save_job(&self, job: &ScrapeJob) -> Result<()>;

    async fn job(&self, id: &str) -> Result<Option<ScrapeJob>>;

    /// Jobs ordered by `scheduled_at`, optionally filtered by status.
    async fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<ScrapeJob>>;

    async fn put_dead_letter(&self, entry: DeadLetterEntry) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>>;

    /// Remove and return a dead-letter entry.
    async fn take_dead_letter(&self, id: &str) -> Result<Option<DeadLetterEntry>>;

    /// Cheap reachability check for readiness.
    async fn ping(&self) -> Result<()>;
}

/// Build the configured backend.
pub fn open(config: &StorageConfig) -> Arc<dyn AdvisoryStore> {
    match config {
        StorageConfig::Memory => Arc::new(MemoryStore::new()),
        StorageConfig::Local { root_dir } => {
            log::info!("Using local storage at {}", root_dir);
            Arc::new(LocalStorage::new(root_dir))
        }
    }
}

/// Sort helper shared by backends.
pub(crate) fn sort_jobs(jobs: &mut [ScrapeJob]) {
    jobs.sort_by(|a, b| {
        a.scheduled_at
            .cmp(&b.scheduled_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
