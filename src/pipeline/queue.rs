//! Priority job queue.
//!
//! One heap per [`QueueClass`]. `pop` always drains `high` before `regular`
//! before `maintenance`; inside a class, higher `priority` wins and equal
//! priorities are first-in first-out. Jobs pushed with a delay wait in a
//! side list until due.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::models::{QueueClass, ScrapeJob};
use crate::utils::lock;

/// Backlog per queue class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub high: usize,
    pub regular: usize,
    pub maintenance: usize,
    /// Jobs waiting out a retry or deferral delay
    pub delayed: usize,
}

impl QueueStatus {
    pub fn total(&self) -> usize {
        self.high + self.regular + self.maintenance + self.delayed
    }
}

struct Queued {
    priority: u8,
    seq: u64,
    job: ScrapeJob,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queues {
    high: BinaryHeap<Queued>,
    regular: BinaryHeap<Queued>,
    maintenance: BinaryHeap<Queued>,
    delayed: Vec<(Instant, ScrapeJob)>,
    seq: u64,
}

impl Queues {
    fn heap(&mut self, class: QueueClass) -> &mut BinaryHeap<Queued> {
        match class {
            QueueClass::High => &mut self.high,
            QueueClass::Regular => &mut self.regular,
            QueueClass::Maintenance => &mut self.maintenance,
        }
    }

    fn push(&mut self, job: ScrapeJob) {
        self.seq += 1;
        let queued = Queued {
            priority: job.priority,
            seq: self.seq,
            job,
        };
        self.heap(queued.job.queue_class).push(queued);
    }

    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, job) = self.delayed.swap_remove(i);
                self.push(job);
            } else {
                i += 1;
            }
        }
    }

    fn pop_ready(&mut self) -> Option<ScrapeJob> {
        QueueClass::ORDER
            .iter()
            .find_map(|class| self.heap(*class).pop())
            .map(|q| q.job)
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

#[derive(Default)]
pub struct JobQueue {
    queues: Mutex<Queues>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: ScrapeJob) {
        lock(&self.queues).push(job);
        self.notify.notify_one();
    }

    /// Queue `job` once `delay` has passed.
    pub fn push_after(&self, job: ScrapeJob, delay: Duration) {
        if delay.is_zero() {
            return self.push(job);
        }
        lock(&self.queues)
            .delayed
            .push((Instant::now() + delay, job));
        // Wake a waiter so it re-arms its timer for the new deadline.
        self.notify.notify_one();
    }

    /// Take the most urgent ready job without waiting.
    pub fn try_pop(&self) -> Option<ScrapeJob> {
        let mut queues = lock(&self.queues);
        queues.promote_due(Instant::now());
        queues.pop_ready()
    }

    /// Wait for the most urgent job. Returns `None` once `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<ScrapeJob> {
        loop {
            let notified = self.notify.notified();
            let next_due = {
                let mut queues = lock(&self.queues);
                queues.promote_due(Instant::now());
                if let Some(job) = queues.pop_ready() {
                    return Some(job);
                }
                queues.next_due()
            };

            let wake = async {
                match next_due {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
                _ = wake => {}
            }
        }
    }

    pub fn status(&self) -> QueueStatus {
        let queues = lock(&self.queues);
        QueueStatus {
            high: queues.high.len(),
            regular: queues.regular.len(),
            maintenance: queues.maintenance.len(),
            delayed: queues.delayed.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.status().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
