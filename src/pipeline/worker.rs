//! Bounded worker pool draining the job queue.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::executor::JobExecutor;
use crate::pipeline::metrics::MetricsAggregator;
use crate::pipeline::queue::JobQueue;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers; they stop once `cancel` fires.
    pub fn spawn(
        count: usize,
        executor: Arc<JobExecutor>,
        queue: Arc<JobQueue>,
        metrics: Arc<MetricsAggregator>,
        cancel: CancellationToken,
    ) -> Self {
        let handles = (0..count.max(1))
            .map(|id| {
                tokio::spawn(work(
                    id,
                    executor.clone(),
                    queue.clone(),
                    metrics.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                log::error!("Worker task ended abnormally: {}", e);
            }
        }
    }
}

async fn work(
    id: usize,
    executor: Arc<JobExecutor>,
    queue: Arc<JobQueue>,
    metrics: Arc<MetricsAggregator>,
    cancel: CancellationToken,
) {
    log::debug!("Worker {} started", id);
    while let Some(job) = queue.pop(&cancel).await {
        metrics.record_backlog(queue.len());
        let job_id = job.id.clone();
        match executor.execute(job, &cancel).await {
            Ok(report) => {
                if let Some(delay) = report.requeue_after() {
                    queue.push_after(report.job, delay);
                }
            }
            Err(e) => log::error!("Worker {}: could not record job {}: {}", id, job_id, e),
        }
    }
    log::debug!("Worker {} stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, Result};
    use crate::models::{
        AdvisoryRecord, Config, JobStatus, JobTrigger, QueueClass, RawContent, RiskLevel,
        ScrapeJob, SourceConfig,
    };
    use crate::services::adapters::{AdapterRegistry, SourceAdapter};
    use crate::storage::{AdvisoryStore, MemoryStore};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Always;

    #[async_trait]
    impl SourceAdapter for Always {
        fn id(&self) -> &str {
            "always"
        }

        async fn fetch(&self, country: Option<&str>, _timeout: Duration) -> Result<RawContent> {
            Ok(RawContent::new("always", country, "https://always.test", "Take care."))
        }

        fn parse(&self, raw: &RawContent) -> Result<Option<AdvisoryRecord>> {
            let country = raw
                .country_code
                .clone()
                .ok_or_else(|| AppError::validation("country missing"))?;
            Ok(Some(AdvisoryRecord {
                source_id: "always".into(),
                country_code: country,
                title: "Always advisory".into(),
                content: raw.body.clone(),
                risk_level_raw: "Level 1".into(),
                risk_level_standardized: RiskLevel::NormalPrecautions,
                content_hash: String::new(),
                source_url: raw.url.clone(),
                last_updated: None,
                scraped_at: raw.fetched_at,
            }))
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn workers_drain_queue_and_stop_on_cancel() {
        let mut config = Config::default();
        let mut source = SourceConfig::new("always", QueueClass::High);
        source.rate_limit.min_delay_ms = 0;
        config.sources = vec![source];

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(Always));
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(MetricsAggregator::new(&config.health));
        let executor = Arc::new(JobExecutor::new(
            &config,
            registry,
            store.clone(),
            metrics.clone(),
        ));
        let queue = Arc::new(JobQueue::new());

        let countries = ["France", "Japan", "Peru"];
        for (i, country) in countries.iter().enumerate() {
            queue.push(ScrapeJob::new(
                format!("job-{i}"),
                "always",
                Some(country.to_string()),
                QueueClass::High,
                9,
                JobTrigger::Manual,
            ));
        }

        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(2, executor, queue.clone(), metrics, cancel.clone());
        assert_eq!(pool.len(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(queue.is_empty());
        cancel.cancel();
        pool.join().await;

        let done = store.jobs(Some(JobStatus::Success)).await.unwrap();
        assert_eq!(done.len(), 3);
    }
}
