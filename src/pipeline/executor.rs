//! Job execution.
//!
//! One run of a [`ScrapeJob`]: cache lookup, rate limiting, the breaker-wrapped
//! fetch, parsing, change detection and metrics. Failures are handed to the
//! [`RetryManager`] and its decision is applied to the job. Putting a retried
//! or deferred job back in line is left to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, EXCERPT_GRAPHEMES, ErrorKind, Result};
use crate::models::{Config, JobStatus, RawContent, ScrapeJob, SourceConfig};
use crate::pipeline::change_detector::{ChangeDetector, ChangeOutcome};
use crate::pipeline::circuit_breaker::CircuitBreaker;
use crate::pipeline::metrics::MetricsAggregator;
use crate::pipeline::rate_limiter::RateLimiter;
use crate::pipeline::retry::{Disposition, RetryManager, RetryPolicy};
use crate::services::adapters::{AdapterRegistry, SourceAdapter};
use crate::services::normalizer;
use crate::storage::{AdvisoryStore, CacheKey, TtlCache};

/// Status note of a job put back to pending by shutdown.
pub const INTERRUPTED_NOTE: &str = "interrupted by shutdown";

/// Result of one execution.
#[derive(Debug, Clone)]
pub struct JobReport {
    /// The job as persisted after this run
    pub job: ScrapeJob,
    /// One entry per stored record
    pub changes: Vec<ChangeOutcome>,
    /// Countries of an all-countries run left out for parse or validation
    /// errors, each with its reason
    pub skipped: Vec<String>,
    /// What was done with a failed run; `None` on success
    pub disposition: Option<Disposition>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.job.status == JobStatus::Success
    }

    /// Delay after which the job should run again, if it should.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self.disposition {
            Some(Disposition::Retry(delay) | Disposition::Defer(delay)) => Some(delay),
            _ => None,
        }
    }
}

/// What a run ingested before it settled.
struct Ingested {
    changes: Vec<ChangeOutcome>,
    skipped: Vec<String>,
}

/// Cancellation seen by one job: its own token, fired by the soft limit,
/// is a child of the engine's shutdown token.
struct JobCancel<'a> {
    shutdown: &'a CancellationToken,
    job: CancellationToken,
}

impl JobCancel<'_> {
    async fn cancelled(&self) {
        self.job.cancelled().await
    }

    fn error(&self, source_id: &str) -> AppError {
        if self.shutdown.is_cancelled() {
            AppError::interrupted(source_id)
        } else {
            AppError::network(source_id, "cancelled")
        }
    }
}

/// Shared per-source services a job needs while running.
pub struct JobExecutor {
    registry: AdapterRegistry,
    sources: HashMap<String, SourceConfig>,
    store: Arc<dyn AdvisoryStore>,
    metrics: Arc<MetricsAggregator>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    cache: TtlCache<RawContent>,
    detector: ChangeDetector,
    retry: RetryManager,
    call_timeout: Duration,
    cache_ttl: Duration,
    soft_limit: Duration,
    hard_limit: Duration,
}

impl JobExecutor {
    pub fn new(
        config: &Config,
        registry: AdapterRegistry,
        store: Arc<dyn AdvisoryStore>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        let limiter = RateLimiter::new(
            config
                .sources
                .iter()
                .map(|s| (s.id.clone(), s.rate_limit.clone())),
        );

        Self {
            sources: config
                .sources
                .iter()
                .map(|s| (s.id.clone(), s.clone()))
                .collect(),
            registry,
            detector: ChangeDetector::new(store.clone()),
            store,
            metrics,
            limiter,
            breaker: CircuitBreaker::new(&config.circuit_breaker),
            cache: TtlCache::new(config.cache.max_entries),
            retry: RetryManager::new(RetryPolicy::from(&config.retry)),
            call_timeout: config.http.timeout(),
            cache_ttl: Duration::from_secs(config.cache.ttl_secs),
            soft_limit: config.engine.soft_limit(),
            hard_limit: config.engine.hard_limit(),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retry
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.get(id)
    }

    /// Run `job` once and apply the outcome.
    ///
    /// Store faults while recording the job are retryable like any other
    /// transient error. An error is returned only when a settled job could
    /// not be written even after retrying the store.
    pub async fn execute(
        &self,
        mut job: ScrapeJob,
        shutdown: &CancellationToken,
    ) -> Result<JobReport> {
        job.transition(JobStatus::Running, None)?;
        let outcome = match self.store.save_job(&job).await {
            Ok(()) => {
                log::debug!("Running job {} ({})", job.id, job.target());
                self.run_limited(&job, shutdown).await
            }
            Err(e) => Err(e),
        };

        let err = match outcome {
            Ok(ingested) => match self.finish(&job, ingested).await {
                Ok(report) => return Ok(report),
                // Stored records are safe to ingest again.
                Err(e) => e,
            },
            Err(e) => e,
        };

        let disposition = self.retry.disposition(&job, &err);
        let job = self.apply(job, &err, disposition).await?;
        Ok(JobReport {
            job,
            changes: Vec::new(),
            skipped: Vec::new(),
            disposition: Some(disposition),
        })
    }

    /// `run` under the soft and hard job time limits.
    async fn run_limited(
        &self,
        job: &ScrapeJob,
        shutdown: &CancellationToken,
    ) -> Result<Ingested> {
        let cancel = JobCancel {
            shutdown,
            job: shutdown.child_token(),
        };
        let soft_timer = (!self.soft_limit.is_zero()).then(|| {
            let token = cancel.job.clone();
            let limit = self.soft_limit;
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        });

        let outcome = match tokio::time::timeout(self.hard_limit, self.run(job, &cancel)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::network(
                &job.source_id,
                "job hard time limit exceeded",
            )),
        };

        if let Some(timer) = soft_timer {
            timer.abort();
        }
        outcome
    }

    async fn finish(&self, job: &ScrapeJob, ingested: Ingested) -> Result<JobReport> {
        let mut done = job.clone();
        done.last_error = None;
        let note = (!ingested.skipped.is_empty())
            .then(|| format!("{} country page(s) skipped", ingested.skipped.len()));
        done.transition(JobStatus::Success, note)?;
        self.store.save_job(&done).await?;
        log::info!(
            "Job {} ({}) succeeded: {} record(s)",
            done.id,
            done.target(),
            ingested.changes.len()
        );
        Ok(JobReport {
            job: done,
            changes: ingested.changes,
            skipped: ingested.skipped,
            disposition: None,
        })
    }

    async fn apply(
        &self,
        mut job: ScrapeJob,
        err: &AppError,
        disposition: Disposition,
    ) -> Result<ScrapeJob> {
        let message = err.to_string();

        match disposition {
            Disposition::Retry(delay) => {
                job.last_error = Some(message.clone());
                job.attempt_count += 1;
                job.transition(JobStatus::Retrying, Some(message))?;
                job.transition(JobStatus::Pending, Some(format!("retry in {delay:?}")))?;
                self.metrics.record_retry(&job.source_id);
                log::warn!(
                    "Job {} ({}) attempt {} failed, retrying in {:?}: {}",
                    job.id,
                    job.target(),
                    job.attempt_count,
                    delay,
                    err
                );
                self.save_requeued(&job).await;
            }
            Disposition::Defer(delay) => {
                job.last_error = Some(message.clone());
                job.transition(JobStatus::Pending, Some(message))?;
                log::info!("Job {} ({}) deferred {:?}: {}", job.id, job.target(), delay, err);
                self.save_requeued(&job).await;
            }
            Disposition::Interrupted => {
                job.transition(JobStatus::Pending, Some(INTERRUPTED_NOTE.into()))?;
                log::info!("Job {} ({}) left pending at shutdown", job.id, job.target());
                self.save_requeued(&job).await;
            }
            Disposition::DeadLetter => {
                job.last_error = Some(message.clone());
                job.attempt_count += 1;
                job.transition(JobStatus::DeadLetter, Some(message.clone()))?;
                let entry = self.retry.dead_letter_entry(&job, &message);
                self.persist(&job.id, || self.store.save_job(&job)).await?;
                self.persist(&job.id, || self.store.put_dead_letter(entry.clone()))
                    .await?;
                self.metrics.record_dead_letter(&job.source_id);
                log::error!(
                    "Job {} ({}) dead-lettered after {} attempt(s): {}",
                    job.id,
                    job.target(),
                    job.attempt_count,
                    err
                );
            }
            Disposition::Fail => {
                job.last_error = Some(message.clone());
                job.transition(JobStatus::Failure, Some(message))?;
                self.persist(&job.id, || self.store.save_job(&job)).await?;
                log::warn!("Job {} ({}) failed: {}", job.id, job.target(), err);
            }
        }
        Ok(job)
    }

    /// Save failures are only logged; the caller still requeues the job and
    /// its next run saves it again.
    async fn save_requeued(&self, job: &ScrapeJob) {
        if let Err(e) = self.store.save_job(job).await {
            log::error!("Failed to save job {}: {}", job.id, e);
        }
    }

    /// Write a settled job, retrying store faults with the retry backoff.
    async fn persist<F, Fut>(&self, job_id: &str, mut write: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let policy = self.retry.policy();
        let mut attempt = 0;
        loop {
            match write().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                    let delay = policy.next_delay(attempt);
                    log::warn!(
                        "Recording job {} failed, retrying in {:?}: {}",
                        job_id,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!(
                        "Recording job {} failed after {} attempt(s): {}",
                        job_id,
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Ingest every country the job covers.
    ///
    /// Transient errors abort the run. A parse or validation error only
    /// skips its country; the run fails when every country did.
    async fn run(&self, job: &ScrapeJob, cancel: &JobCancel<'_>) -> Result<Ingested> {
        let source_id = job.source_id.as_str();
        let source = self.sources.get(source_id);
        let adapter_id = source.map_or(source_id, SourceConfig::adapter_id);
        let adapter = self
            .registry
            .get(adapter_id)
            .ok_or_else(|| AppError::not_found(format!("adapter '{adapter_id}'")))?;
        let adapter = adapter.as_ref();

        let configured = source.map(|s| s.countries.as_slice()).unwrap_or_default();
        let countries = if let Some(country) = &job.country_code {
            vec![country.clone()]
        } else if !configured.is_empty() {
            configured.to_vec()
        } else {
            let started = Instant::now();
            let listing = self
                .fetch_recorded(adapter, source_id, None, cancel, started)
                .await?;
            let listed = match adapter.countries(&listing) {
                Ok(listed) => listed,
                Err(e) => {
                    self.reject(source_id, None, &listing, &e, started);
                    return Err(e);
                }
            };
            if listed.is_empty() {
                let changes = self
                    .process(adapter, source_id, None, listing, started)
                    .await?
                    .into_iter()
                    .collect();
                return Ok(Ingested {
                    changes,
                    skipped: Vec::new(),
                });
            }
            log::debug!("{}: listing names {} countries", source_id, listed.len());
            listed
        };

        let mut changes = Vec::new();
        let mut skipped = Vec::new();
        let mut first_error = None;
        for country in &countries {
            match self.ingest(adapter, source_id, Some(country), cancel).await {
                Ok(Some(outcome)) => changes.push(outcome),
                Ok(None) => {}
                Err(e) if matches!(e.kind(), ErrorKind::Parse | ErrorKind::Validation) => {
                    skipped.push(format!("{country}: {e}"));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if skipped.len() == countries.len() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        if !skipped.is_empty() {
            log::warn!(
                "Job {} ({}): {} of {} countries skipped",
                job.id,
                job.target(),
                skipped.len(),
                countries.len()
            );
        }
        Ok(Ingested { changes, skipped })
    }

    async fn ingest(
        &self,
        adapter: &dyn SourceAdapter,
        source_id: &str,
        country: Option<&str>,
        cancel: &JobCancel<'_>,
    ) -> Result<Option<ChangeOutcome>> {
        let started = Instant::now();
        let raw = self
            .fetch_recorded(adapter, source_id, country, cancel, started)
            .await?;
        self.process(adapter, source_id, country, raw, started).await
    }

    /// Parse, validate and run change detection on fetched content.
    async fn process(
        &self,
        adapter: &dyn SourceAdapter,
        source_id: &str,
        country: Option<&str>,
        raw: RawContent,
        started: Instant,
    ) -> Result<Option<ChangeOutcome>> {
        let parsed = adapter.parse(&raw).and_then(|record| {
            if let Some(r) = &record {
                normalizer::validate_record(r)?;
            }
            Ok(record)
        });
        let record = match parsed {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::debug!("{}: no advisory for {:?}", source_id, country);
                self.metrics.record_success(source_id, started.elapsed(), None);
                return Ok(None);
            }
            Err(e) => {
                self.reject(source_id, country, &raw, &e, started);
                return Err(e);
            }
        };

        match self.detector.detect(record).await {
            Ok(outcome) => {
                self.metrics
                    .record_success(source_id, started.elapsed(), Some(outcome.change_type));
                Ok(Some(outcome))
            }
            Err(e) => {
                self.metrics.record_failure(source_id, e.kind(), started.elapsed());
                Err(e)
            }
        }
    }

    /// Log unusable content with an excerpt and count it against the source.
    fn reject(
        &self,
        source_id: &str,
        country: Option<&str>,
        raw: &RawContent,
        err: &AppError,
        started: Instant,
    ) {
        let excerpt = match err {
            AppError::Parse { excerpt, .. } => excerpt.clone(),
            _ => normalizer::excerpt(&raw.body, EXCERPT_GRAPHEMES),
        };
        log::warn!(
            "{} [{}]: {} (raw: {:?})",
            source_id,
            country.unwrap_or("*"),
            err,
            excerpt
        );
        self.metrics.record_failure(source_id, err.kind(), started.elapsed());
    }

    async fn fetch_recorded(
        &self,
        adapter: &dyn SourceAdapter,
        source_id: &str,
        country: Option<&str>,
        cancel: &JobCancel<'_>,
        started: Instant,
    ) -> Result<RawContent> {
        self.fetch(adapter, source_id, country, cancel)
            .await
            .inspect_err(|e| self.metrics.record_failure(source_id, e.kind(), started.elapsed()))
    }

    /// Raw content from the cache, or through the limiter and breaker.
    async fn fetch(
        &self,
        adapter: &dyn SourceAdapter,
        source_id: &str,
        country: Option<&str>,
        cancel: &JobCancel<'_>,
    ) -> Result<RawContent> {
        let key = CacheKey::fetch(source_id, country);
        if let Some(raw) = self.cache.get(&key) {
            self.metrics.record_cache(source_id, true);
            return Ok(raw);
        }
        self.metrics.record_cache(source_id, false);

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancel.error(source_id)),
            waited = self.limiter.acquire(source_id) => waited,
        };
        if !waited.is_zero() {
            self.metrics.record_deferral(source_id, waited);
        }

        self.metrics.record_request(source_id);
        let raw = self
            .breaker
            .call(source_id, async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(cancel.error(source_id)),
                    fetched = tokio::time::timeout(
                        self.call_timeout,
                        adapter.fetch(country, self.call_timeout),
                    ) => match fetched {
                        Ok(result) => result,
                        Err(_) => Err(AppError::network(source_id, "request timed out")),
                    },
                }
            })
            .await?;

        self.cache.set(key, raw.clone(), self.cache_ttl);
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdvisoryRecord, JobIds, JobTrigger, QueueClass, RiskLevel};
    use crate::pipeline::circuit_breaker::CircuitState;
    use crate::storage::MemoryStore;
    use crate::storage::flaky::FlakyStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(raw: &RawContent) -> Result<Option<AdvisoryRecord>> {
        if raw.body == "garbage" {
            return Err(AppError::parse("fake", "no advisory block", &raw.body));
        }
        Ok(Some(AdvisoryRecord {
            source_id: "fake".into(),
            country_code: raw.country_code.clone().unwrap_or_default(),
            title: "Fake advisory".into(),
            content: raw.body.clone(),
            risk_level_raw: "Level 2".into(),
            risk_level_standardized: RiskLevel::ExerciseCaution,
            content_hash: String::new(),
            source_url: raw.url.clone(),
            last_updated: None,
            scraped_at: raw.fetched_at,
        }))
    }

    /// Adapter replaying scripted fetch results.
    struct Scripted {
        calls: AtomicU32,
        script: Mutex<Vec<Result<String>>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(script: Vec<Result<String>>) -> Arc<Self> {
            Self::slow(script, Duration::ZERO)
        }

        fn slow(script: Vec<Result<String>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script: Mutex::new(script),
                delay,
            })
        }
    }

    #[async_trait]
    impl SourceAdapter for Scripted {
        fn id(&self) -> &str {
            "fake"
        }

        async fn fetch(&self, country: Option<&str>, _timeout: Duration) -> Result<RawContent> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.remove(0)
                } else {
                    match script.first() {
                        Some(Ok(body)) => Ok(body.clone()),
                        _ => Err(AppError::network("fake", "connection reset")),
                    }
                }
            };
            next.map(|body| RawContent::new("fake", country, "https://fake.test", body))
        }

        fn parse(&self, raw: &RawContent) -> Result<Option<AdvisoryRecord>> {
            record(raw)
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    /// Adapter with one page per country and a comma-separated listing.
    struct Atlas {
        pages: Vec<(&'static str, &'static str)>,
    }

    #[async_trait]
    impl SourceAdapter for Atlas {
        fn id(&self) -> &str {
            "fake"
        }

        async fn fetch(&self, country: Option<&str>, _timeout: Duration) -> Result<RawContent> {
            let body = match country {
                None => self
                    .pages
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(","),
                Some(country) => self
                    .pages
                    .iter()
                    .find(|(name, _)| *name == country)
                    .map(|(_, body)| body.to_string())
                    .ok_or_else(|| AppError::network("fake", "404"))?,
            };
            Ok(RawContent::new("fake", country, "https://fake.test", body))
        }

        fn parse(&self, raw: &RawContent) -> Result<Option<AdvisoryRecord>> {
            record(raw)
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn countries(&self, listing: &RawContent) -> Result<Vec<String>> {
            Ok(listing.body.split(',').map(str::to_string).collect())
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.sources = vec![SourceConfig::new("fake", QueueClass::High)];
        config.sources[0].rate_limit.min_delay_ms = 0;
        config.retry.max_retries = 2;
        config.cache.ttl_secs = 0;
        config
    }

    fn executor_with(
        adapter: Arc<dyn SourceAdapter>,
        config: &Config,
        store: Arc<dyn AdvisoryStore>,
    ) -> JobExecutor {
        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        let metrics = Arc::new(MetricsAggregator::new(&config.health));
        JobExecutor::new(config, registry, store, metrics)
    }

    fn executor(adapter: Arc<Scripted>, config: &Config) -> (JobExecutor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let exec = executor_with(adapter, config, store.clone());
        (exec, store)
    }

    fn job(country: &str) -> ScrapeJob {
        ScrapeJob::new(
            JobIds::new().next_id("fake"),
            "fake",
            Some(country.into()),
            QueueClass::High,
            9,
            JobTrigger::Manual,
        )
    }

    fn all_countries_job() -> ScrapeJob {
        ScrapeJob::new(
            JobIds::new().next_id("fake"),
            "fake",
            None,
            QueueClass::High,
            9,
            JobTrigger::Manual,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn success_stores_record_and_change() {
        let adapter = Scripted::new(vec![Ok("Exercise caution.".into())]);
        let (exec, store) = executor(adapter, &config());
        let cancel = CancellationToken::new();

        let report = exec.execute(job("France"), &cancel).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.changes.len(), 1);
        assert_eq!(store.advisories("France", None).await.unwrap().len(), 1);
        let saved = store.job(&report.job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_requeues_with_backoff() {
        let adapter = Scripted::new(vec![Err(AppError::network("fake", "reset"))]);
        let (exec, store) = executor(adapter, &config());
        let cancel = CancellationToken::new();

        let report = exec.execute(job("France"), &cancel).await.unwrap();
        assert!(matches!(report.disposition, Some(Disposition::Retry(_))));
        assert_eq!(report.job.status, JobStatus::Pending);
        assert_eq!(report.job.attempt_count, 1);
        let delay = report.requeue_after().unwrap();
        assert!(delay >= Duration::from_millis(900) && delay <= Duration::from_millis(1100));
        let saved = store.job(&report.job.id).await.unwrap().unwrap();
        assert_eq!(saved.attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parse_failure_is_final() {
        let adapter = Scripted::new(vec![Ok("garbage".into())]);
        let (exec, store) = executor(adapter, &config());
        let cancel = CancellationToken::new();

        let report = exec.execute(job("France"), &cancel).await.unwrap();
        assert_eq!(report.disposition, Some(Disposition::Fail));
        assert_eq!(report.job.status, JobStatus::Failure);
        assert!(report.requeue_after().is_none());
        assert!(store.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cached_bodies_skip_the_source() {
        let adapter = Scripted::new(vec![Ok("Exercise caution.".into())]);
        let mut config = config();
        config.cache.ttl_secs = 300;
        let (exec, _store) = executor(adapter.clone(), &config);
        let cancel = CancellationToken::new();

        exec.execute(job("France"), &cancel).await.unwrap();
        exec.execute(job("France"), &cancel).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

        let snap = exec.metrics.snapshot();
        assert_eq!(snap.global.cache_hits, 1);
        assert_eq!(snap.global.cache_misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_success_write_retries_instead_of_stranding_the_job() {
        let adapter = Scripted::new(vec![Ok("Exercise caution.".into())]);
        let store = Arc::new(FlakyStore::new());
        store.fail_saves(JobStatus::Success, 1);
        let exec = executor_with(adapter, &config(), store.clone());
        let cancel = CancellationToken::new();

        let report = exec.execute(job("France"), &cancel).await.unwrap();
        assert!(matches!(report.disposition, Some(Disposition::Retry(_))));
        let saved = store.job(&report.job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Pending);
        assert_eq!(saved.attempt_count, 1);

        let report = exec.execute(report.job, &cancel).await.unwrap();
        assert!(report.succeeded());
        let saved = store.job(&report.job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Success);
        assert_eq!(store.advisories("France", None).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_running_write_retries_before_fetching() {
        let adapter = Scripted::new(vec![Ok("Exercise caution.".into())]);
        let store = Arc::new(FlakyStore::new());
        store.fail_saves(JobStatus::Running, 1);
        let exec = executor_with(adapter.clone(), &config(), store.clone());
        let cancel = CancellationToken::new();

        let report = exec.execute(job("France"), &cancel).await.unwrap();
        assert!(matches!(report.disposition, Some(Disposition::Retry(_))));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        let saved = store.job(&report.job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letter_write_is_retried() {
        let adapter = Scripted::new(vec![Err(AppError::network("fake", "reset"))]);
        let store = Arc::new(FlakyStore::new());
        store.fail_dead_letters(1);
        let exec = executor_with(adapter, &config(), store.clone());
        let cancel = CancellationToken::new();
        let mut spent = job("France");
        spent.attempt_count = 2;

        let report = exec.execute(spent, &cancel).await.unwrap();
        assert_eq!(report.disposition, Some(Disposition::DeadLetter));
        assert_eq!(store.dead_letters().await.unwrap().len(), 1);
        let saved = store.job(&report.job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::DeadLetter);
    }

    #[tokio::test(start_paused = true)]
    async fn unwritable_dead_letter_surfaces_the_store_error() {
        let adapter = Scripted::new(vec![Err(AppError::network("fake", "reset"))]);
        let store = Arc::new(FlakyStore::new());
        store.fail_dead_letters(10);
        let exec = executor_with(adapter, &config(), store.clone());
        let cancel = CancellationToken::new();
        let mut spent = job("France");
        spent.attempt_count = 2;

        let err = exec.execute(spent, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_leaves_job_pending_without_spending_an_attempt() {
        let adapter = Scripted::new(vec![Ok("Exercise caution.".into())]);
        let (exec, store) = executor(adapter, &config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut last_chance = job("France");
        last_chance.attempt_count = 2;

        let report = exec.execute(last_chance, &cancel).await.unwrap();
        assert_eq!(report.disposition, Some(Disposition::Interrupted));
        assert!(report.requeue_after().is_none());
        assert_eq!(report.job.status, JobStatus::Pending);
        assert_eq!(report.job.attempt_count, 2);
        assert_eq!(
            report.job.history.last().and_then(|c| c.note.as_deref()),
            Some(INTERRUPTED_NOTE)
        );
        assert!(store.dead_letters().await.unwrap().is_empty());
        assert_eq!(exec.breaker().snapshot("fake").consecutive_failures, 0);
        assert_eq!(exec.metrics.snapshot().global.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn soft_limit_cancels_a_slow_fetch() {
        let adapter = Scripted::slow(
            vec![Ok("Exercise caution.".into())],
            Duration::from_secs(10),
        );
        let mut config = config();
        config.engine.job_soft_limit_secs = 1;
        config.engine.job_hard_limit_secs = 5;
        let (exec, _store) = executor(adapter, &config);
        let cancel = CancellationToken::new();

        let report = exec.execute(job("France"), &cancel).await.unwrap();
        assert!(matches!(report.disposition, Some(Disposition::Retry(_))));
        assert!(report.job.last_error.unwrap().contains("cancelled"));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn hard_limit_reopens_half_open_breaker() {
        let adapter = Scripted::slow(
            vec![Ok("Exercise caution.".into())],
            Duration::from_secs(600),
        );
        let mut config = config();
        config.engine.job_soft_limit_secs = 0;
        config.engine.job_hard_limit_secs = 5;
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.recovery_timeout_secs = 60;
        let (exec, _store) = executor(adapter, &config);
        let cancel = CancellationToken::new();

        exec.breaker().record_failure("fake");
        tokio::time::advance(Duration::from_secs(60)).await;

        let report = exec.execute(job("France"), &cancel).await.unwrap();
        assert!(matches!(report.disposition, Some(Disposition::Retry(_))));
        assert!(report.job.last_error.unwrap().contains("hard time limit"));
        assert_eq!(exec.breaker().snapshot("fake").state, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(exec.breaker().permit("fake").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn all_countries_run_skips_unparseable_pages() {
        let adapter = Arc::new(Atlas {
            pages: vec![
                ("France", "Exercise caution."),
                ("Mexico", "garbage"),
                ("Japan", "Normal precautions."),
            ],
        });
        let mut config = config();
        config.sources[0].countries = vec!["France".into(), "Mexico".into(), "Japan".into()];
        let store = Arc::new(MemoryStore::new());
        let exec = executor_with(adapter, &config, store.clone());
        let cancel = CancellationToken::new();

        let report = exec.execute(all_countries_job(), &cancel).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.changes.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].starts_with("Mexico"));
        assert_eq!(store.advisories("Japan", None).await.unwrap().len(), 1);
        assert!(store.advisories("Mexico", None).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn all_countries_run_fails_when_every_page_does() {
        let adapter = Arc::new(Atlas {
            pages: vec![("France", "garbage"), ("Mexico", "garbage")],
        });
        let mut config = config();
        config.sources[0].countries = vec!["France".into(), "Mexico".into()];
        let exec = executor_with(adapter, &config, Arc::new(MemoryStore::new()));
        let cancel = CancellationToken::new();

        let report = exec.execute(all_countries_job(), &cancel).await.unwrap();
        assert_eq!(report.disposition, Some(Disposition::Fail));
        assert_eq!(report.job.status, JobStatus::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn countries_come_from_the_listing_when_none_are_configured() {
        let adapter = Arc::new(Atlas {
            pages: vec![
                ("France", "Exercise caution."),
                ("Japan", "Normal precautions."),
            ],
        });
        let store = Arc::new(MemoryStore::new());
        let exec = executor_with(adapter, &config(), store.clone());
        let cancel = CancellationToken::new();

        let report = exec.execute(all_countries_job(), &cancel).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.changes.len(), 2);
        assert_eq!(store.advisories("France", None).await.unwrap().len(), 1);
        assert_eq!(store.advisories("Japan", None).await.unwrap().len(), 1);
    }
}
