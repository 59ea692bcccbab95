// src/engine.rs

//! Query and command facade over the ingestion pipeline.
//!
//! [`Engine`] owns every per-source service and the shared store. Downstream
//! consumers read normalized advisories and change events through it; the
//! CLI drives it to run the scheduler and workers or single jobs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{
    AdvisoryRecord, ChangeEvent, Config, DeadLetterConfig, DeadLetterEntry, JobIds, JobStatus,
    ScrapeJob,
};
use crate::pipeline::metrics::readiness;
use crate::pipeline::retry::REPROCESS_NOTE;
use crate::pipeline::scheduler::{self, Scheduler};
use crate::pipeline::{
    CircuitBreakerState, JobExecutor, JobQueue, JobReport, MetricsAggregator, MetricsSnapshot,
    QueueStatus, RateLimitState, Readiness, SourceHealth, WorkerPool,
};
use crate::services::AdapterRegistry;
use crate::services::normalizer;
use crate::storage::{self, AdvisoryStore};
use crate::utils::{http, lock};

/// Background tasks of a started engine.
struct Running {
    scheduler: JoinHandle<()>,
    workers: WorkerPool,
    sweep: Option<JoinHandle<()>>,
}

pub struct Engine {
    config: Config,
    store: Arc<dyn AdvisoryStore>,
    queue: Arc<JobQueue>,
    ids: Arc<JobIds>,
    metrics: Arc<MetricsAggregator>,
    executor: Arc<JobExecutor>,
    cancel: CancellationToken,
    running: Mutex<Option<Running>>,
}

impl Engine {
    /// Engine with the built-in adapters and the configured store.
    pub fn new(config: Config) -> Result<Self> {
        let client = http::create_async_client(&config.http)?;
        let registry = AdapterRegistry::builtin(client);
        let store = storage::open(&config.storage);
        Self::with_parts(config, registry, store)
    }

    /// Engine over explicit adapters and store.
    pub fn with_parts(
        config: Config,
        registry: AdapterRegistry,
        store: Arc<dyn AdvisoryStore>,
    ) -> Result<Self> {
        for source in config.sources.iter().filter(|s| s.enabled) {
            if registry.get(source.adapter_id()).is_none() {
                return Err(AppError::config(format!(
                    "source '{}' uses unknown adapter '{}'",
                    source.id,
                    source.adapter_id()
                )));
            }
        }

        let metrics = Arc::new(MetricsAggregator::new(&config.health));
        let executor = Arc::new(JobExecutor::new(
            &config,
            registry,
            store.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            config,
            store,
            queue: Arc::new(JobQueue::new()),
            ids: Arc::new(JobIds::new()),
            metrics,
            executor,
            cancel: CancellationToken::new(),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the scheduler, the worker pool and the optional dead-letter sweep.
    pub fn start(&self) -> Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(AppError::config("engine already started"));
        }
        if self.cancel.is_cancelled() {
            return Err(AppError::config("engine has been shut down"));
        }

        let scheduler = Scheduler::new(
            &self.config.sources,
            &self.config.scheduler,
            Instant::now(),
            self.ids.clone(),
            self.store.clone(),
            self.queue.clone(),
        )
        .spawn(self.cancel.clone());

        let workers = WorkerPool::spawn(
            self.config.engine.workers,
            self.executor.clone(),
            self.queue.clone(),
            self.metrics.clone(),
            self.cancel.clone(),
        );

        let sweep = (self.config.dead_letter.sweep_interval_secs > 0).then(|| {
            spawn_sweep(
                self.config.dead_letter.clone(),
                self.store.clone(),
                self.queue.clone(),
                self.cancel.clone(),
            )
        });

        log::info!(
            "Engine started: {} source(s), {} worker(s)",
            self.config.sources.iter().filter(|s| s.enabled).count(),
            workers.len()
        );
        *running = Some(Running {
            scheduler,
            workers,
            sweep,
        });
        Ok(())
    }

    /// Cancel all background work and wait for it to stop.
    ///
    /// Jobs interrupted mid-flight are left pending in the store.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let running = lock(&self.running).take();
        if let Some(running) = running {
            if let Err(e) = running.scheduler.await {
                log::error!("Scheduler task ended abnormally: {}", e);
            }
            running.workers.join().await;
            if let Some(sweep) = running.sweep {
                if let Err(e) = sweep.await {
                    log::error!("Dead-letter sweep ended abnormally: {}", e);
                }
            }
        }
        log::info!("Engine stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Queue an ad-hoc job for `source_id`, optionally for one country.
    pub async fn enqueue(&self, source_id: &str, country: Option<&str>) -> Result<ScrapeJob> {
        let job = self.manual_job(source_id, country)?;
        let job = scheduler::submit(self.store.as_ref(), &self.queue, job).await?;
        log::info!("Enqueued job {} ({})", job.id, job.target());
        Ok(job)
    }

    /// Run an ad-hoc job inline, retrying in place until it settles.
    pub async fn run_once(&self, source_id: &str, country: Option<&str>) -> Result<JobReport> {
        let job = self.manual_job(source_id, country)?;
        self.store.save_job(&job).await?;
        self.run_job(job).await
    }

    /// Execute `job` to a terminal status without going through the queue.
    ///
    /// Retries and deferrals are waited out here. Returns early with the job
    /// still pending if the engine is shut down meanwhile.
    pub async fn run_job(&self, mut job: ScrapeJob) -> Result<JobReport> {
        loop {
            let report = self.executor.execute(job, &self.cancel).await?;
            let Some(delay) = report.requeue_after() else {
                return Ok(report);
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(report),
                _ = tokio::time::sleep(delay) => {}
            }
            job = report.job;
        }
    }

    /// Move a dead-lettered job back to pending and queue it.
    pub async fn reprocess_dead_letter(&self, id: &str) -> Result<ScrapeJob> {
        reprocess(self.store.as_ref(), &self.queue, id).await
    }

    /// Reprocess dead letters old enough for the configured sweep policy.
    pub async fn sweep_dead_letters(&self, now: DateTime<Utc>) -> Result<usize> {
        sweep(&self.config.dead_letter, self.store.as_ref(), &self.queue, now).await
    }

    fn manual_job(&self, source_id: &str, country: Option<&str>) -> Result<ScrapeJob> {
        let source = self
            .config
            .source(source_id)
            .ok_or_else(|| AppError::not_found(format!("source '{source_id}'")))?;
        let country = country
            .map(normalizer::normalize_country)
            .filter(|c| !c.is_empty());
        Ok(scheduler::manual_job(&self.ids, source, country.as_deref()))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Latest record per source for `country`.
    pub async fn latest_advisories(
        &self,
        country: &str,
        source: Option<&str>,
    ) -> Result<Vec<AdvisoryRecord>> {
        self.store
            .advisories(&normalizer::normalize_country(country), source)
            .await
    }

    pub async fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeEvent>> {
        self.store.changes_since(since).await
    }

    pub async fn job(&self, id: &str) -> Result<Option<ScrapeJob>> {
        self.store.job(id).await
    }

    pub async fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<ScrapeJob>> {
        self.store.jobs(status).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        self.store.dead_letters().await
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Health of every configured source.
    pub fn source_health(&self) -> BTreeMap<String, SourceHealth> {
        self.config
            .sources
            .iter()
            .map(|s| {
                let breaker = self.executor.breaker().snapshot(&s.id).state;
                (s.id.clone(), self.metrics.health(&s.id, breaker))
            })
            .collect()
    }

    pub fn breaker_states(&self) -> HashMap<String, CircuitBreakerState> {
        self.executor.breaker().states()
    }

    pub async fn rate_limit_state(&self, source_id: &str) -> RateLimitState {
        self.executor.limiter().snapshot(source_id).await
    }

    /// Ready unless the backlog is over its limit or the store is unreachable.
    pub async fn readiness(&self) -> Readiness {
        let backlog = self.queue.len();
        self.metrics.record_backlog(backlog);
        let store_error = self.store.ping().await.err().map(|e| e.to_string());
        readiness(backlog, self.config.engine.queue_backlog_limit, store_error)
    }
}

async fn reprocess(store: &dyn AdvisoryStore, queue: &JobQueue, id: &str) -> Result<ScrapeJob> {
    let entry = store
        .take_dead_letter(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("dead letter '{id}'")))?;

    let mut job = entry.job_snapshot.clone();
    job.attempt_count = 0;
    job.last_error = None;
    job.transition(JobStatus::Pending, Some(REPROCESS_NOTE.into()))?;

    match scheduler::submit(store, queue, job).await {
        Ok(job) => {
            log::info!(
                "Reprocessing dead letter {} ({}), replay #{}",
                job.id,
                job.target(),
                entry.reprocess_count + 1
            );
            Ok(job)
        }
        Err(e) => {
            // Keep the entry rather than lose the job.
            store.put_dead_letter(entry).await?;
            Err(e)
        }
    }
}

async fn sweep(
    config: &DeadLetterConfig,
    store: &dyn AdvisoryStore,
    queue: &JobQueue,
    now: DateTime<Utc>,
) -> Result<usize> {
    let min_age = i64::try_from(config.min_age_secs).unwrap_or(i64::MAX);
    let due: Vec<String> = store
        .dead_letters()
        .await?
        .into_iter()
        .filter(|e| e.reprocess_count < config.max_reprocess)
        .filter(|e| now.signed_duration_since(e.last_attempted_at).num_seconds() >= min_age)
        .map(|e| e.id)
        .collect();

    let mut count = 0;
    for id in due {
        match reprocess(store, queue, &id).await {
            Ok(_) => count += 1,
            Err(e) => log::warn!("Dead-letter sweep skipped {}: {}", id, e),
        }
    }
    if count > 0 {
        log::info!("Dead-letter sweep requeued {} job(s)", count);
    }
    Ok(count)
}

fn spawn_sweep(
    config: DeadLetterConfig,
    store: Arc<dyn AdvisoryStore>,
    queue: Arc<JobQueue>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweep(&config, store.as_ref(), &queue, Utc::now()).await {
                        log::error!("Dead-letter sweep failed: {}", e);
                    }
                }
            }
        }
    })
}
