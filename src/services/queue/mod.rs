//! Job queue broker contract and implementations.
//!
//! The queue is the only shared mutable structure in the pipeline. It provides
//! durable, per-priority FIFO, at-least-once delivery with explicit
//! acknowledgment, visibility timeouts as the sole crash-recovery mechanism,
//! and a dead-letter sink for jobs that are terminally failed or have
//! exhausted their retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::job::{FailureReason, FailureRecord, Job};

mod memory;
mod redis_queue;

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;

/// Worker-side classification of a failed attempt. The worker decides the
/// reason and whether retrying can help; the queue decides routing.
#[derive(Debug, Clone, Copy)]
pub struct FailureClass {
    pub reason: FailureReason,
    pub terminal: bool,
}

impl FailureClass {
    /// A failure that retrying cannot fix (bad image, unparseable content).
    pub fn terminal(reason: FailureReason) -> Self {
        Self { reason, terminal: true }
    }

    /// A transient failure worth another attempt, subject to the retry cap.
    pub fn retryable(reason: FailureReason) -> Self {
        Self { reason, terminal: false }
    }
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Re-admitted for another attempt after the requested delay.
    Requeued { retry_count: u32 },
    /// Routed to the dead-letter sink with a FailureRecord.
    DeadLettered { reason: FailureReason, attempt: u32 },
    /// The job was not in flight (already acked or recovered by timeout).
    NotFound,
}

/// At-least-once job broker. All per-job mutation (visibility, retry_count,
/// removal) is atomic from the queue's perspective: two workers can never
/// simultaneously hold the same job.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job to the tail of its priority queue. Never blocks. Fails
    /// with [`QueueError::Unavailable`] when the broker is unreachable or at
    /// capacity; the caller must surface backpressure rather than drop.
    async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError>;

    /// Cooperatively block until at least one job is available or the poll
    /// timeout elapses. Returns up to `max_count` jobs, each invisible to
    /// other consumers for `visibility_timeout`. An empty vec means timeout,
    /// not an error. Express jobs are drained before normal before bulk.
    async fn dequeue_batch(
        &self,
        max_count: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Job>, QueueError>;

    /// Permanently remove a job. Idempotent: acking an already-removed job is
    /// a no-op.
    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Report a failed attempt for an in-flight job. Increments retry_count;
    /// terminal failures and jobs whose retry_count would exceed the
    /// configured maximum are routed to the dead-letter sink, everything else
    /// becomes visible again after `delay`.
    async fn requeue(
        &self,
        job_id: Uuid,
        failure: FailureClass,
        delay: Duration,
    ) -> Result<Disposition, QueueError>;

    /// Number of pending (visible or delay-scheduled) jobs across all
    /// priority queues. Autoscaling signal.
    async fn depth(&self) -> Result<u64, QueueError>;

    /// Pop up to `max` FailureRecords from the dead-letter sink so they can
    /// be mirrored into the result store.
    async fn drain_dead_letters(&self, max: usize) -> Result<Vec<FailureRecord>, QueueError>;

    /// Broker connectivity check (for /health).
    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Build the configured queue backend.
pub fn build_queue(config: &AppConfig) -> Result<Arc<dyn JobQueue>, QueueError> {
    match config.queue_backend.as_str() {
        "redis" => Ok(Arc::new(RedisQueue::new(&config.redis_url, config.max_retries)?)),
        "memory" => Ok(Arc::new(MemoryQueue::new(
            config.queue_capacity,
            config.max_retries,
        ))),
        other => Err(QueueError::Unavailable(format!(
            "unknown queue backend '{other}' (expected 'redis' or 'memory')"
        ))),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
