//! In-process queue backend over a mutex-guarded state table.
//!
//! Suitable for single-node deployments and tests. Satisfies the same
//! contract as the Redis backend: per-priority FIFO, visibility deadlines,
//! delayed re-admission, retry-capped dead-lettering.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::job::{FailureReason, FailureRecord, Job, Priority};

use super::{Disposition, FailureClass, JobQueue, QueueError};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct State {
    /// Visible jobs, one FIFO per priority class.
    ready: [VecDeque<Job>; 3],
    /// Jobs held by a worker, keyed by visibility deadline.
    in_flight: HashMap<Uuid, (Instant, Job)>,
    /// Requeued jobs waiting out their delay.
    delayed: Vec<(Instant, Job)>,
    /// Dead-letter sink.
    dead: VecDeque<FailureRecord>,
}

impl State {
    fn pending(&self) -> usize {
        self.ready.iter().map(VecDeque::len).sum::<usize>() + self.delayed.len()
    }
}

pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
    max_retries: u32,
    poll_timeout: Duration,
}

fn slot(priority: Priority) -> usize {
    match priority {
        Priority::Express => 0,
        Priority::Normal => 1,
        Priority::Bulk => 2,
    }
}

impl MemoryQueue {
    pub fn new(capacity: usize, max_retries: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            capacity,
            max_retries,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Promote delay-expired jobs to their ready queues and recover jobs
    /// whose visibility deadline has passed. Recovery increments retry_count
    /// exactly once per expiry and dead-letters on exhaustion.
    fn promote_and_recover(&self, state: &mut State, now: Instant) {
        let mut i = 0;
        while i < state.delayed.len() {
            if state.delayed[i].0 <= now {
                let (_, job) = state.delayed.remove(i);
                state.ready[slot(job.priority)].push_back(job);
            } else {
                i += 1;
            }
        }

        let expired: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let (_, mut job) = state.in_flight.remove(&id).expect("expired id present");
            job.retry_count += 1;
            if job.retry_count > self.max_retries {
                tracing::warn!(job_id = %id, attempts = job.retry_count, "visibility expiry exhausted retries, dead-lettering");
                state.dead.push_back(FailureRecord {
                    job_id: id,
                    reason: FailureReason::OcrTimeout,
                    attempt: job.retry_count,
                    timestamp: Utc::now(),
                });
            } else {
                tracing::debug!(job_id = %id, retry_count = job.retry_count, "visibility timeout expired, job visible again");
                state.ready[slot(job.priority)].push_back(job);
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError> {
        let job_id = job.job_id;
        {
            let mut state = self.state.lock().expect("queue lock");
            if state.pending() >= self.capacity {
                return Err(QueueError::Unavailable(format!(
                    "queue at capacity ({})",
                    self.capacity
                )));
            }
            state.ready[slot(job.priority)].push_back(job);
        }
        self.notify.notify_one();
        Ok(job_id)
    }

    async fn dequeue_batch(
        &self,
        max_count: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Job>, QueueError> {
        let poll_deadline = Instant::now() + self.poll_timeout;
        loop {
            let next_wake = {
                let mut state = self.state.lock().expect("queue lock");
                let now = Instant::now();
                self.promote_and_recover(&mut state, now);

                let mut batch = Vec::new();
                for queue in state.ready.iter_mut() {
                    while batch.len() < max_count {
                        match queue.pop_front() {
                            Some(job) => batch.push(job),
                            None => break,
                        }
                    }
                }
                if !batch.is_empty() {
                    let deadline = now + visibility_timeout;
                    for job in &batch {
                        state.in_flight.insert(job.job_id, (deadline, job.clone()));
                    }
                    return Ok(batch);
                }

                // Nothing visible: wake when the next delayed job or
                // visibility deadline comes due, or when notified.
                state
                    .delayed
                    .iter()
                    .map(|(at, _)| *at)
                    .chain(state.in_flight.values().map(|(at, _)| *at))
                    .min()
            };

            let wake_at = next_wake.map_or(poll_deadline, |at| at.min(poll_deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {
                    if Instant::now() >= poll_deadline {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue lock");
        if state.in_flight.remove(&job_id).is_none() {
            // Already removed, or recovered by timeout and re-admitted; drop
            // any pending copy so a completed job is not reprocessed.
            for queue in state.ready.iter_mut() {
                queue.retain(|job| job.job_id != job_id);
            }
            state.delayed.retain(|(_, job)| job.job_id != job_id);
        }
        Ok(())
    }

    async fn requeue(
        &self,
        job_id: Uuid,
        failure: FailureClass,
        delay: Duration,
    ) -> Result<Disposition, QueueError> {
        let disposition = {
            let mut state = self.state.lock().expect("queue lock");
            let Some((_, mut job)) = state.in_flight.remove(&job_id) else {
                return Ok(Disposition::NotFound);
            };
            job.retry_count += 1;
            if failure.terminal || job.retry_count > self.max_retries {
                let attempt = job.retry_count;
                state.dead.push_back(FailureRecord {
                    job_id,
                    reason: failure.reason,
                    attempt,
                    timestamp: Utc::now(),
                });
                Disposition::DeadLettered { reason: failure.reason, attempt }
            } else {
                let retry_count = job.retry_count;
                if delay.is_zero() {
                    state.ready[slot(job.priority)].push_back(job);
                } else {
                    state.delayed.push((Instant::now() + delay, job));
                }
                Disposition::Requeued { retry_count }
            }
        };
        if matches!(disposition, Disposition::Requeued { .. }) {
            self.notify.notify_one();
        }
        Ok(disposition)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().expect("queue lock");
        Ok(state.pending() as u64)
    }

    async fn drain_dead_letters(&self, max: usize) -> Result<Vec<FailureRecord>, QueueError> {
        let mut state = self.state.lock().expect("queue lock");
        let take = max.min(state.dead.len());
        Ok(state.dead.drain(..take).collect())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
