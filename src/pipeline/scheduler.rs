//! Recurring job scheduler.
//!
//! Each enabled source has a cadence derived from its queue class (or its own
//! `cadence_secs`). On every tick the scheduler creates jobs for the sources
//! that are due, persists them as pending and pushes them onto the queue.
//! It never performs network I/O.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{JobIds, JobTrigger, SchedulerConfig, ScrapeJob, SourceConfig};
use crate::pipeline::queue::JobQueue;
use crate::storage::AdvisoryStore;

struct Entry {
    source: SourceConfig,
    cadence: Duration,
    next_due: Instant,
}

pub struct Scheduler {
    entries: Vec<Entry>,
    tick: Duration,
    ids: Arc<JobIds>,
    store: Arc<dyn AdvisoryStore>,
    queue: Arc<JobQueue>,
    /// Due jobs not yet persisted and queued.
    backlog: VecDeque<ScrapeJob>,
}

impl Scheduler {
    /// Every enabled source becomes due at `start`.
    pub fn new(
        sources: &[SourceConfig],
        config: &SchedulerConfig,
        start: Instant,
        ids: Arc<JobIds>,
        store: Arc<dyn AdvisoryStore>,
        queue: Arc<JobQueue>,
    ) -> Self {
        let entries = sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| Entry {
                cadence: s.cadence(config),
                next_due: start,
                source: s.clone(),
            })
            .collect();

        Self {
            entries,
            tick: Duration::from_secs(config.tick_secs.max(1)),
            ids,
            store,
            queue,
            backlog: VecDeque::new(),
        }
    }

    /// Jobs for every source due at `now`. Advances each due source by whole
    /// cadences, so a late tick never produces a burst of catch-up jobs.
    pub fn due(&mut self, now: Instant) -> Vec<ScrapeJob> {
        let mut jobs = Vec::new();
        for entry in &mut self.entries {
            if entry.next_due > now {
                continue;
            }
            while entry.next_due <= now {
                entry.next_due += entry.cadence;
            }
            jobs.extend(scheduled_jobs(&self.ids, &entry.source));
        }
        jobs
    }

    /// Create, persist and queue the jobs due at `now`.
    ///
    /// Jobs that could not be submitted stay in the backlog and go first on
    /// the next tick.
    pub async fn tick(&mut self, now: Instant) -> Result<usize> {
        let due = self.due(now);
        self.backlog.extend(due);
        let mut count = 0;
        while let Some(job) = self.backlog.pop_front() {
            if let Err(e) = submit(self.store.as_ref(), &self.queue, job.clone()).await {
                self.backlog.push_front(job);
                log::warn!(
                    "Scheduler holding {} job(s) after a failed submit",
                    self.backlog.len()
                );
                return Err(e);
            }
            count += 1;
        }
        if count > 0 {
            log::info!("Scheduler enqueued {} job(s)", count);
        }
        Ok(count)
    }

    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    /// Drive `tick` from an interval until `cancel` fires.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(Instant::now()).await {
                            log::error!("Scheduler tick failed: {}", e);
                        }
                    }
                }
            }
            log::info!("Scheduler stopped");
        })
    }
}

/// Jobs for one source: one per configured country, or a single
/// all-countries job when none are listed.
pub fn scheduled_jobs(ids: &JobIds, source: &SourceConfig) -> Vec<ScrapeJob> {
    let make = |country: Option<String>| {
        ScrapeJob::new(
            ids.next_id(&source.id),
            &source.id,
            country,
            source.queue_class,
            source.effective_priority(),
            JobTrigger::Scheduled,
        )
    };

    if source.countries.is_empty() {
        vec![make(None)]
    } else {
        source.countries.iter().map(|c| make(Some(c.clone()))).collect()
    }
}

/// Ad-hoc job that jumps ahead of scheduled work in its class.
pub fn manual_job(ids: &JobIds, source: &SourceConfig, country: Option<&str>) -> ScrapeJob {
    ScrapeJob::new(
        ids.next_id(&source.id),
        &source.id,
        country.map(str::to_string),
        source.queue_class,
        source.effective_priority().saturating_add(1),
        JobTrigger::Manual,
    )
}

/// Persist a pending job, then queue it.
pub async fn submit(
    store: &dyn AdvisoryStore,
    queue: &JobQueue,
    job: ScrapeJob,
) -> Result<ScrapeJob> {
    store.save_job(&job).await?;
    log::debug!("Queued job {} ({})", job.id, job.target());
    queue.push(job.clone());
    Ok(job)
}
