//! Metrics and health aggregation.
//!
//! Counters are kept in-process so they can be queried, and every update is
//! mirrored to the `metrics` facade for whatever recorder the host installs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::error::ErrorKind;
use crate::models::{ChangeType, HealthConfig};
use crate::pipeline::circuit_breaker::CircuitState;
use crate::utils::lock;

/// Upper bounds of the duration buckets; the last bucket is open-ended.
pub const DURATION_BUCKETS: [Duration; 5] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DurationStats {
    pub count: u64,
    pub sum_ms: u64,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    /// Counts for <=100ms, <=500ms, <=1s, <=5s, <=30s, >30s
    pub buckets: [u64; 6],
}

impl DurationStats {
    fn observe(&mut self, d: Duration) {
        let ms = d.as_millis() as u64;
        self.count += 1;
        self.sum_ms += ms;
        self.min_ms = Some(self.min_ms.map_or(ms, |m| m.min(ms)));
        self.max_ms = Some(self.max_ms.map_or(ms, |m| m.max(ms)));
        let idx = DURATION_BUCKETS
            .iter()
            .position(|bound| d <= *bound)
            .unwrap_or(DURATION_BUCKETS.len());
        self.buckets[idx] += 1;
    }

    pub fn mean_ms(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum_ms as f64 / self.count as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub network_errors: u64,
    pub parse_errors: u64,
    pub validation_errors: u64,
    pub circuit_rejections: u64,
    pub rate_limit_deferrals: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub changes: u64,
    pub unchanged: u64,
    pub retries: u64,
    pub dead_letters: u64,
    pub durations: DurationStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub global: SourceMetrics,
    pub sources: BTreeMap<String, SourceMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceHealth {
    Healthy,
    Degraded { failure_rate: f64 },
    Down,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    NotReady { reasons: Vec<String> },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

#[derive(Default)]
struct SourceEntry {
    metrics: SourceMetrics,
    /// Recent call outcomes, `true` for failure
    recent: VecDeque<bool>,
}

#[derive(Default)]
struct Inner {
    global: SourceMetrics,
    sources: HashMap<String, SourceEntry>,
}

pub struct MetricsAggregator {
    window: usize,
    failure_rate_threshold: f64,
    inner: Mutex<Inner>,
}

impl MetricsAggregator {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            window: config.window.max(1),
            failure_rate_threshold: config.failure_rate_threshold,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn update(&self, source_id: &str, f: impl Fn(&mut SourceMetrics)) {
        let mut inner = lock(&self.inner);
        f(&mut inner.global);
        f(&mut inner
            .sources
            .entry(source_id.to_string())
            .or_default()
            .metrics);
    }

    fn push_outcome(&self, source_id: &str, failed: bool) {
        let mut inner = lock(&self.inner);
        let entry = inner.sources.entry(source_id.to_string()).or_default();
        entry.recent.push_back(failed);
        while entry.recent.len() > self.window {
            entry.recent.pop_front();
        }
    }

    /// An adapter call is about to be made.
    pub fn record_request(&self, source_id: &str) {
        self.update(source_id, |m| m.requests += 1);
        metrics::counter!("advisory_requests_total", "source" => source_id.to_string())
            .increment(1);
    }

    /// A call succeeded; `change` is `None` when the source had no advisory.
    pub fn record_success(&self, source_id: &str, elapsed: Duration, change: Option<ChangeType>) {
        self.update(source_id, |m| {
            m.successes += 1;
            m.durations.observe(elapsed);
            match change {
                Some(c) if c.is_transition() => m.changes += 1,
                Some(_) => m.unchanged += 1,
                None => {}
            }
        });
        self.push_outcome(source_id, false);
        metrics::counter!("advisory_success_total", "source" => source_id.to_string())
            .increment(1);
        if let Some(change) = change {
            metrics::counter!(
                "advisory_changes_total",
                "source" => source_id.to_string(),
                "type" => change.as_str()
            )
            .increment(1);
        }
        metrics::histogram!("advisory_fetch_duration_ms", "source" => source_id.to_string())
            .record(elapsed.as_millis() as f64);
    }

    /// A call that reached the source (or tried to) failed.
    pub fn record_failure(&self, source_id: &str, kind: ErrorKind, elapsed: Duration) {
        if kind == ErrorKind::Interrupted {
            return;
        }
        if kind == ErrorKind::CircuitOpen {
            self.update(source_id, |m| m.circuit_rejections += 1);
            metrics::counter!(
                "advisory_circuit_rejections_total",
                "source" => source_id.to_string()
            )
            .increment(1);
            return;
        }

        self.update(source_id, |m| {
            m.failures += 1;
            m.durations.observe(elapsed);
            match kind {
                ErrorKind::Network => m.network_errors += 1,
                ErrorKind::Parse => m.parse_errors += 1,
                ErrorKind::Validation => m.validation_errors += 1,
                _ => {}
            }
        });
        // Store faults say nothing about the source.
        if matches!(kind, ErrorKind::Network | ErrorKind::Parse | ErrorKind::Validation) {
            self.push_outcome(source_id, true);
        }
        metrics::counter!(
            "advisory_failure_total",
            "source" => source_id.to_string(),
            "kind" => format!("{kind:?}").to_lowercase()
        )
        .increment(1);
    }

    pub fn record_deferral(&self, source_id: &str, waited: Duration) {
        self.update(source_id, |m| m.rate_limit_deferrals += 1);
        metrics::histogram!("advisory_rate_limit_wait_ms", "source" => source_id.to_string())
            .record(waited.as_millis() as f64);
    }

    pub fn record_cache(&self, source_id: &str, hit: bool) {
        self.update(source_id, |m| {
            if hit {
                m.cache_hits += 1;
            } else {
                m.cache_misses += 1;
            }
        });
        let name = if hit {
            "advisory_cache_hits_total"
        } else {
            "advisory_cache_misses_total"
        };
        metrics::counter!(name, "source" => source_id.to_string()).increment(1);
    }

    pub fn record_retry(&self, source_id: &str) {
        self.update(source_id, |m| m.retries += 1);
        metrics::counter!("advisory_retries_total", "source" => source_id.to_string())
            .increment(1);
    }

    pub fn record_dead_letter(&self, source_id: &str) {
        self.update(source_id, |m| m.dead_letters += 1);
        metrics::counter!("advisory_dead_letters_total", "source" => source_id.to_string())
            .increment(1);
    }

    pub fn record_backlog(&self, backlog: usize) {
        metrics::gauge!("advisory_queue_backlog").set(backlog as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = lock(&self.inner);
        MetricsSnapshot {
            global: inner.global.clone(),
            sources: inner
                .sources
                .iter()
                .map(|(id, e)| (id.clone(), e.metrics.clone()))
                .collect(),
        }
    }

    /// Failure rate over the recent window, `None` without data.
    pub fn failure_rate(&self, source_id: &str) -> Option<f64> {
        let inner = lock(&self.inner);
        let recent = &inner.sources.get(source_id)?.recent;
        if recent.is_empty() {
            return None;
        }
        let failed = recent.iter().filter(|f| **f).count();
        Some(failed as f64 / recent.len() as f64)
    }

    /// Health of one source given its breaker state.
    pub fn health(&self, source_id: &str, breaker: CircuitState) -> SourceHealth {
        if breaker == CircuitState::Open {
            return SourceHealth::Down;
        }
        match self.failure_rate(source_id) {
            None => SourceHealth::Unknown,
            Some(rate) if rate > self.failure_rate_threshold => {
                SourceHealth::Degraded { failure_rate: rate }
            }
            Some(_) => SourceHealth::Healthy,
        }
    }
}

/// Overall readiness from queue backlog and store reachability.
pub fn readiness(backlog: usize, backlog_limit: usize, store_error: Option<String>) -> Readiness {
    let mut reasons = Vec::new();
    if backlog > backlog_limit {
        reasons.push(format!("queue backlog {backlog} exceeds limit {backlog_limit}"));
    }
    if let Some(e) = store_error {
        reasons.push(format!("store unreachable: {e}"));
    }
    if reasons.is_empty() {
        Readiness::Ready
    } else {
        Readiness::NotReady { reasons }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> MetricsAggregator {
        MetricsAggregator::new(&HealthConfig {
            failure_rate_threshold: 0.5,
            window: 4,
        })
    }

    #[test]
    fn durations_land_in_buckets() {
        let mut stats = DurationStats::default();
        for ms in [50, 100, 700, 2_000, 45_000] {
            stats.observe(Duration::from_millis(ms));
        }
        assert_eq!(stats.buckets, [2, 0, 1, 1, 0, 1]);
        assert_eq!(stats.min_ms, Some(50));
        assert_eq!(stats.max_ms, Some(45_000));
        assert_eq!(stats.count, 5);
    }

    #[test]
    fn counts_per_source_and_globally() {
        let m = aggregator();
        m.record_request("uk_fcdo");
        m.record_success("uk_fcdo", Duration::from_millis(120), Some(ChangeType::New));
        m.record_request("us_state_dept");
        m.record_failure("us_state_dept", ErrorKind::Parse, Duration::from_millis(80));
        m.record_cache("uk_fcdo", true);

        let snap = m.snapshot();
        assert_eq!(snap.global.requests, 2);
        assert_eq!(snap.global.successes, 1);
        assert_eq!(snap.global.failures, 1);
        assert_eq!(snap.sources["uk_fcdo"].changes, 1);
        assert_eq!(snap.sources["uk_fcdo"].cache_hits, 1);
        assert_eq!(snap.sources["us_state_dept"].parse_errors, 1);
    }

    #[test]
    fn health_follows_recent_failure_rate() {
        let m = aggregator();
        assert_eq!(m.health("uk_fcdo", CircuitState::Closed), SourceHealth::Unknown);

        for _ in 0..4 {
            m.record_success("uk_fcdo", Duration::ZERO, Some(ChangeType::Unchanged));
        }
        assert_eq!(m.health("uk_fcdo", CircuitState::Closed), SourceHealth::Healthy);

        for _ in 0..3 {
            m.record_failure("uk_fcdo", ErrorKind::Network, Duration::ZERO);
        }
        assert_eq!(
            m.health("uk_fcdo", CircuitState::Closed),
            SourceHealth::Degraded { failure_rate: 0.75 }
        );
        assert_eq!(m.health("uk_fcdo", CircuitState::Open), SourceHealth::Down);
    }

    #[test]
    fn circuit_rejections_do_not_affect_health() {
        let m = aggregator();
        m.record_success("uk_fcdo", Duration::ZERO, None);
        for _ in 0..10 {
            m.record_failure("uk_fcdo", ErrorKind::CircuitOpen, Duration::ZERO);
        }
        assert_eq!(m.failure_rate("uk_fcdo"), Some(0.0));
        assert_eq!(m.snapshot().sources["uk_fcdo"].circuit_rejections, 10);
    }

    #[test]
    fn readiness_reasons() {
        assert!(readiness(10, 100, None).is_ready());
        match readiness(101, 100, Some("disk gone".into())) {
            Readiness::NotReady { reasons } => assert_eq!(reasons.len(), 2),
            Readiness::Ready => panic!("expected not ready"),
        }
    }
}
