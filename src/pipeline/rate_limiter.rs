//! Per-source request pacing.
//!
//! Every adapter call goes through [`RateLimiter::acquire`] first. The limiter
//! only ever delays; it never fails a call.
//!
//! Admissions are kept as sliding logs, one for the rolling hour and one for
//! the burst interval, so the caps hold for every window and not just for
//! aligned buckets.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::time::Instant;

use crate::models::RateLimitConfig;
use crate::utils::lock;

const HOUR: Duration = Duration::from_secs(3600);

/// Point-in-time view of one source's limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitState {
    /// Oldest admission still inside the rolling hour
    pub window_start: Option<Instant>,
    /// Admissions in the rolling hour
    pub request_count: u32,
    pub last_request_at: Option<Instant>,
    /// Admissions in the current burst interval
    pub burst_count: u32,
    /// Attempts that had to wait before admission
    pub deferred_count: u64,
}

#[derive(Debug, Default)]
struct Window {
    hour_log: VecDeque<Instant>,
    burst_log: VecDeque<Instant>,
    last_request_at: Option<Instant>,
    deferred_count: u64,
}

impl Window {
    fn prune(&mut self, now: Instant, burst_interval: Duration) {
        while self
            .hour_log
            .front()
            .is_some_and(|t| now.duration_since(*t) >= HOUR)
        {
            self.hour_log.pop_front();
        }
        while self
            .burst_log
            .front()
            .is_some_and(|t| now.duration_since(*t) >= burst_interval)
        {
            self.burst_log.pop_front();
        }
    }

    /// Earliest instant a request may be admitted.
    fn ready_at(&self, config: &RateLimitConfig, spacing: Duration) -> Option<Instant> {
        let mut ready: Option<Instant> = None;
        let mut later = |at: Instant| {
            ready = Some(ready.map_or(at, |r| r.max(at)));
        };

        if self.hour_log.len() >= config.hourly_cap as usize {
            if let Some(oldest) = self.hour_log.front() {
                later(*oldest + HOUR);
            }
        }
        if self.burst_log.len() >= config.burst_limit as usize {
            if let Some(oldest) = self.burst_log.front() {
                later(*oldest + Duration::from_secs(config.burst_interval_secs));
            }
        }
        if let Some(last) = self.last_request_at {
            later(last + spacing);
        }
        ready
    }

    fn admit(&mut self, now: Instant) {
        self.hour_log.push_back(now);
        self.burst_log.push_back(now);
        self.last_request_at = Some(now);
    }

    fn snapshot(&self) -> RateLimitState {
        RateLimitState {
            window_start: self.hour_log.front().copied(),
            request_count: self.hour_log.len() as u32,
            last_request_at: self.last_request_at,
            burst_count: self.burst_log.len() as u32,
            deferred_count: self.deferred_count,
        }
    }
}

struct Slot {
    config: RateLimitConfig,
    window: tokio::sync::Mutex<Window>,
}

/// Rate limiter keyed by source identifier.
pub struct RateLimiter {
    configs: HashMap<String, RateLimitConfig>,
    default_config: RateLimitConfig,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl RateLimiter {
    pub fn new(configs: impl IntoIterator<Item = (String, RateLimitConfig)>) -> Self {
        Self {
            configs: configs.into_iter().collect(),
            default_config: RateLimitConfig::default(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, source_id: &str) -> Arc<Slot> {
        let mut slots = lock(&self.slots);
        slots
            .entry(source_id.to_string())
            .or_insert_with(|| {
                let config = self
                    .configs
                    .get(source_id)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(Slot {
                    config,
                    window: tokio::sync::Mutex::new(Window::default()),
                })
            })
            .clone()
    }

    /// Wait until `source_id` may be called and record the admission.
    ///
    /// Same-source callers are admitted one at a time in arrival order.
    /// Returns how long the caller waited.
    pub async fn acquire(&self, source_id: &str) -> Duration {
        let slot = self.slot(source_id);
        let config = &slot.config;
        let burst_interval = Duration::from_secs(config.burst_interval_secs);
        let mut window = slot.window.lock().await;
        let started = Instant::now();
        let mut deferred = false;

        loop {
            let now = Instant::now();
            window.prune(now, burst_interval);
            let spacing = spacing_for(config, Utc::now());
            match window.ready_at(config, spacing) {
                Some(at) if at > now => {
                    if !deferred {
                        deferred = true;
                        window.deferred_count += 1;
                        log::debug!(
                            "Rate limit deferral for {}: waiting {:?}",
                            source_id,
                            at - now
                        );
                    }
                    tokio::time::sleep_until(at).await;
                }
                _ => break,
            }
        }

        let now = Instant::now();
        window.admit(now);
        if deferred {
            metrics::counter!(
                "advisory_rate_limit_deferrals_total",
                "source" => source_id.to_string()
            )
            .increment(1);
        }
        now.duration_since(started)
    }

    pub async fn snapshot(&self, source_id: &str) -> RateLimitState {
        let slot = self.slot(source_id);
        let window = slot.window.lock().await;
        window.snapshot()
    }

    pub fn config_for(&self, source_id: &str) -> &RateLimitConfig {
        self.configs.get(source_id).unwrap_or(&self.default_config)
    }
}

/// Minimum spacing, plus the extra delay when `now` falls in respectful hours.
pub fn spacing_for(config: &RateLimitConfig, now: DateTime<Utc>) -> Duration {
    let base = Duration::from_millis(config.min_delay_ms);
    match &config.respectful_hours {
        Some(hours) => {
            let local = now + chrono::Duration::hours(i64::from(hours.utc_offset_hours));
            if hours.contains(local.hour()) {
                base + Duration::from_millis(hours.extra_delay_ms)
            } else {
                base
            }
        }
        None => base,
    }
}
