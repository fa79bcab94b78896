//! Dispatch queue
//!
//! At-least-once delivery of per-order evaluation jobs to a [`JobHandler`],
//! with bounded concurrency, a token-bucket admission rate, delayed
//! re-enqueue, exponential backoff for transient failures and a dead-letter
//! list for jobs that exhaust their retry budget.
//!
//! At most one job per order is pending at a time. Each enqueue stamps a
//! generation on the order; a delivered job whose generation is no longer
//! current (because it was removed or superseded) is discarded.

mod rate_limit;

pub use rate_limit::JobRateLimiter;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use types::errors::EngineResult;
use types::ids::OrderId;

use crate::config::QueueConfig;

/// A unit of work: evaluate one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub order_id: OrderId,
    /// Transient failures so far
    pub attempt: u32,
    /// Handler-requested re-queues so far (e.g. price not yet available)
    pub requeues: u32,
    generation: u64,
}

impl Job {
    /// A fresh job, for driving a handler directly.
    pub fn new(order_id: OrderId) -> Self {
        Self {
            order_id,
            attempt: 0,
            requeues: 0,
            generation: 0,
        }
    }
}

/// What the handler wants done with the job after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    /// Deliver again after `delay`, counting it as a re-queue.
    Requeue { delay: Duration },
    /// Deliver again after `delay` without counting it; the job could not
    /// start yet (e.g. the order is claimed elsewhere).
    Defer { delay: Duration },
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> EngineResult<JobOutcome>;
}

/// A job that ran out of transient retries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub order_id: OrderId,
    pub attempts: u32,
    pub last_error: String,
    pub at: i64,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    generation: u64,
    due: Instant,
}

struct QueueInner {
    config: QueueConfig,
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    pending: DashMap<OrderId, Pending>,
    next_generation: AtomicU64,
    in_flight: AtomicUsize,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

/// Cloneable handle to the dispatch queue.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl DispatchQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                config,
                tx,
                rx: Mutex::new(Some(rx)),
                pending: DashMap::new(),
                next_generation: AtomicU64::new(1),
                in_flight: AtomicUsize::new(0),
                dead_letters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Schedule an evaluation now. No-op if one is already due.
    pub fn enqueue(&self, order_id: OrderId) -> bool {
        self.schedule(Job::new(order_id), Duration::ZERO)
    }

    /// Schedule an evaluation after `delay`. An earlier pending job wins.
    pub fn enqueue_after(&self, order_id: OrderId, delay: Duration) -> bool {
        self.schedule(Job::new(order_id), delay)
    }

    /// Drop the pending job for `order_id`, if any.
    pub fn remove(&self, order_id: &OrderId) -> bool {
        self.inner.pending.remove(order_id).is_some()
    }

    pub fn is_pending(&self, order_id: &OrderId) -> bool {
        self.inner.pending.contains_key(order_id)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().clone()
    }

    /// Take the dead-letter list, leaving it empty.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.inner.dead_letters.lock())
    }

    fn schedule(&self, job: Job, delay: Duration) -> bool {
        let due = Instant::now() + delay;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);

        {
            let mut entry = self.inner.pending.entry(job.order_id).or_insert(Pending {
                generation,
                due,
            });
            if entry.generation != generation {
                if entry.due <= due {
                    return false;
                }
                *entry = Pending { generation, due };
            }
        }

        let job = Job { generation, ..job };
        if delay.is_zero() {
            self.send(job);
        } else {
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.send(job);
            });
        }
        true
    }

    fn send(&self, job: Job) {
        if self.inner.tx.send(job).is_err() {
            warn!("Dispatch queue closed, job dropped");
        }
    }

    /// Claim a delivered job if it is still the current one for its order.
    fn claim(&self, job: &Job) -> bool {
        self.inner
            .pending
            .remove_if(&job.order_id, |_, p| p.generation == job.generation)
            .is_some()
    }

    /// Deliver jobs to `handler` until `shutdown` flips to true, then wait for
    /// in-flight jobs to finish. Only one consumer may run.
    pub async fn run<H: JobHandler>(&self, handler: Arc<H>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut rx) = self.inner.rx.lock().take() else {
            error!("Dispatch queue consumer already running");
            return;
        };

        let config = &self.inner.config;
        let semaphore = Arc::new(Semaphore::new(config.max_in_flight));
        let limiter = JobRateLimiter::new(config.rate_limit);
        info!(
            max_in_flight = config.max_in_flight,
            rate_max = config.rate_limit.max,
            rate_interval_ms = config.rate_limit.per_interval_ms,
            "Dispatch queue running"
        );

        loop {
            let job = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                    continue;
                }
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            if !self.claim(&job) {
                debug!(order_id = %job.order_id, "Stale job discarded");
                continue;
            }

            limiter.acquire().await;
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let queue = self.clone();
            let handler = handler.clone();
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let result = handler.handle(&job).await;
                queue.complete(job, result);
                queue.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        // Drain: every permit back means nothing is in flight
        let _ = semaphore.acquire_many(config.max_in_flight as u32).await;
        *self.inner.rx.lock() = Some(rx);
        info!("Dispatch queue stopped");
    }

    fn complete(&self, job: Job, result: EngineResult<JobOutcome>) {
        match result {
            Ok(JobOutcome::Done) => {}
            Ok(JobOutcome::Requeue { delay }) => {
                let next = Job {
                    requeues: job.requeues + 1,
                    ..job
                };
                self.schedule(next, delay);
            }
            Ok(JobOutcome::Defer { delay }) => {
                debug!(order_id = %job.order_id, delay_ms = delay.as_millis() as u64, "Job deferred");
                self.schedule(job, delay);
            }
            Err(err) if err.is_transient() => {
                let attempt = job.attempt + 1;
                if attempt >= self.inner.config.retry_attempts {
                    error!(
                        order_id = %job.order_id,
                        attempt,
                        error = %err,
                        "Job exhausted retries, dead-lettered"
                    );
                    self.inner.dead_letters.lock().push(DeadLetter {
                        order_id: job.order_id,
                        attempts: attempt,
                        last_error: err.to_string(),
                        at: types::unix_nanos(),
                    });
                    return;
                }
                let delay = self.inner.config.backoff(attempt);
                warn!(
                    order_id = %job.order_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient job failure, retrying"
                );
                self.schedule(Job { attempt, ..job }, delay);
            }
            Err(err) => {
                error!(order_id = %job.order_id, error = %err, "Job failed");
            }
        }
    }
}
