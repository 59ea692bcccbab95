//! Fake sources and engine builders shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use advisory_engine::error::{AppError, Result};
use advisory_engine::models::{
    AdvisoryRecord, Config, QueueClass, RawContent, RiskLevel, SourceConfig,
};
use advisory_engine::services::{AdapterRegistry, SourceAdapter};
use advisory_engine::storage::{AdvisoryStore, MemoryStore};
use advisory_engine::Engine;
use async_trait::async_trait;

/// What the fake source answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    Advisory(&'static str, RiskLevel),
    Down,
    Garbage,
}

/// Source replaying a script; the last reply repeats forever.
pub struct FakeSource {
    id: String,
    calls: AtomicU32,
    script: Mutex<VecDeque<Reply>>,
}

impl FakeSource {
    pub fn new(id: &str, script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: AtomicU32::new(0),
            script: Mutex::new(script.into()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Replace the remaining script.
    pub fn set(&self, script: Vec<Reply>) {
        *self.script.lock().unwrap() = script.into();
    }

    fn next_reply(&self) -> Reply {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or(Reply::Down)
        }
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, country: Option<&str>, _timeout: Duration) -> Result<RawContent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = match self.next_reply() {
            Reply::Advisory(content, risk) => format!("{}|{}", risk.as_str(), content),
            Reply::Garbage => "<html>maintenance</html>".to_string(),
            Reply::Down => return Err(AppError::network(&self.id, "connection refused")),
        };
        Ok(RawContent::new(&self.id, country, "https://fake.test/advisory", body))
    }

    fn parse(&self, raw: &RawContent) -> Result<Option<AdvisoryRecord>> {
        let Some((risk, content)) = raw.body.split_once('|') else {
            return Err(AppError::parse(&self.id, "no advisory block", &raw.body));
        };
        let risk: RiskLevel = risk.parse()?;
        Ok(Some(AdvisoryRecord {
            source_id: self.id.clone(),
            country_code: raw.country_code.clone().unwrap_or_default(),
            title: format!("{} advisory", self.id),
            content: content.to_string(),
            risk_level_raw: risk.as_str().to_string(),
            risk_level_standardized: risk,
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

/// One high-priority source scheduled for France, unthrottled, uncached.
pub fn config(source_id: &str) -> Config {
    let mut source = SourceConfig::new(source_id, QueueClass::High);
    source.countries = vec!["France".into()];
    source.rate_limit.min_delay_ms = 0;

    let mut config = Config::default();
    config.sources = vec![source];
    config.engine.workers = 2;
    config.cache.ttl_secs = 0;
    config.retry.max_retries = 3;
    config.retry.base_delay_ms = 100;
    config.retry.max_delay_ms = 1_000;
    config
}

pub fn engine(config: Config, source: Arc<FakeSource>) -> (Engine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with_store(config, source, store.clone());
    (engine, store)
}

pub fn engine_with_store(
    config: Config,
    source: Arc<FakeSource>,
    store: Arc<dyn AdvisoryStore>,
) -> Engine {
    let mut registry = AdapterRegistry::new();
    registry.register(source);
    Engine::with_parts(config, registry, store).unwrap()
}
