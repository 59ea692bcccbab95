//! Circuit Breaker pattern implementation.
//!
//! Isolates a failing source: after `failure_threshold` consecutive network
//! failures the breaker opens and calls fail fast with
//! [`AppError::CircuitOpen`] without touching the network. Once
//! `recovery_timeout` has passed a single trial call is let through; its outcome
//! closes or reopens the breaker.
//!
//! ```text
//! closed --threshold failures--> open --timeout--> half_open --success--> closed
//!                                  ^                   |
//!                                  +------failure------+
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{AppError, ErrorKind, Result};
use crate::models::CircuitBreakerConfig;
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one source's breaker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    /// State changes since start
    pub transitions: u64,
}

#[derive(Debug, Default)]
struct Breaker {
    view: CircuitBreakerState,
    trial_in_flight: bool,
}

impl Breaker {
    fn move_to(&mut self, source_id: &str, next: CircuitState) {
        let from = self.view.state;
        self.view.state = next;
        self.view.transitions += 1;
        match next {
            CircuitState::Open => log::warn!(
                "Circuit breaker for {}: {} -> open after {} consecutive failures",
                source_id,
                from,
                self.view.consecutive_failures
            ),
            _ => log::info!("Circuit breaker for {}: {} -> {}", source_id, from, next),
        }
        metrics::counter!(
            "advisory_breaker_transitions_total",
            "source" => source_id.to_string(),
            "to" => next.as_str()
        )
        .increment(1);
    }
}

/// Circuit breaker keyed by source identifier.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject a call to `source_id`.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// and admits this call as the trial.
    pub fn permit(&self, source_id: &str) -> Result<()> {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers.entry(source_id.to_string()).or_default();
        let now = Instant::now();

        match breaker.view.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = breaker.view.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.recovery_timeout {
                    breaker.move_to(source_id, CircuitState::HalfOpen);
                    breaker.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(AppError::CircuitOpen {
                        source_id: source_id.to_string(),
                        retry_after: self.recovery_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen if breaker.trial_in_flight => Err(AppError::CircuitOpen {
                source_id: source_id.to_string(),
                retry_after: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                breaker.trial_in_flight = true;
                Ok(())
            }
        }
    }

    pub fn record_success(&self, source_id: &str) {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers.entry(source_id.to_string()).or_default();
        breaker.view.consecutive_failures = 0;
        if breaker.view.state == CircuitState::HalfOpen {
            breaker.trial_in_flight = false;
            breaker.view.opened_at = None;
            breaker.move_to(source_id, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self, source_id: &str) {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers.entry(source_id.to_string()).or_default();
        breaker.view.consecutive_failures += 1;

        match breaker.view.state {
            CircuitState::Closed
                if breaker.view.consecutive_failures >= self.failure_threshold =>
            {
                breaker.view.opened_at = Some(Instant::now());
                breaker.move_to(source_id, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                breaker.trial_in_flight = false;
                breaker.view.opened_at = Some(Instant::now());
                breaker.move_to(source_id, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Give back a half-open trial slot without judging the source.
    pub fn release(&self, source_id: &str) {
        let mut breakers = lock(&self.breakers);
        if let Some(breaker) = breakers.get_mut(source_id) {
            breaker.trial_in_flight = false;
        }
    }

    /// Record a call outcome. Only network failures count against the source;
    /// a call abandoned for shutdown counts as neither.
    pub fn record<T>(&self, source_id: &str, outcome: &Result<T>) {
        match outcome {
            Err(e) if e.kind() == ErrorKind::Network => self.record_failure(source_id),
            Err(e) if e.kind() == ErrorKind::Interrupted => self.release(source_id),
            _ => self.record_success(source_id),
        }
    }

    /// Run `call` under the breaker.
    ///
    /// If the returned future is dropped before `call` finishes (a job time
    /// limit fired), the call is recorded as a failure so a half-open trial
    /// slot is never leaked.
    pub async fn call<T, F>(&self, source_id: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.permit(source_id)?;
        let mut pending = PendingCall {
            breaker: self,
            source_id,
            settled: false,
        };
        let outcome = call.await;
        pending.settled = true;
        self.record(source_id, &outcome);
        outcome
    }

    pub fn snapshot(&self, source_id: &str) -> CircuitBreakerState {
        lock(&self.breakers)
            .get(source_id)
            .map(|b| b.view.clone())
            .unwrap_or_default()
    }

    /// Breaker state of every source seen so far.
    pub fn states(&self) -> HashMap<String, CircuitBreakerState> {
        lock(&self.breakers)
            .iter()
            .map(|(id, b)| (id.clone(), b.view.clone()))
            .collect()
    }
}

/// Records a failure for an admitted call that never completed.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    source_id: &'a str,
    settled: bool,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            log::warn!("Call to {} abandoned before completing", self.source_id);
            self.breaker.record_failure(self.source_id);
        }
    }
}
