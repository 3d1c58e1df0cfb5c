//! The processing engine. Each worker independently loops `process_cycle`:
//! pull a batch, resolve and preprocess images, run ONE inference call for
//! the whole batch, extract address fields per image, persist and ack, or
//! classify the failure and hand routing to the queue.
//!
//! Per-job flow: FETCHED -> RESOLVING_IMAGE -> INFERRING -> EXTRACTING ->
//! PERSISTING -> ACKED, diverting to REQUEUED or DEAD_LETTERED on failure.
//! A failed job never aborts the rest of its batch.

pub mod pool;

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db::results::ResultStore;
use crate::models::job::{FailureReason, Job};
use crate::models::result::JobResult;
use crate::services::encryption::EncryptionService;
use crate::services::extract::extract_address;
use crate::services::inference::{InferenceBackend, InferenceOutcome, OutcomeFailure};
use crate::services::preprocess::preprocess;
use crate::services::queue::{Disposition, FailureClass, JobQueue, QueueError};
use crate::services::storage::{ObjectStore, StorageError};

/// Knobs for one worker's processing cycle.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    pub confidence_threshold: f64,
    pub retry_base_delay: Duration,
}

impl WorkerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            confidence_threshold: config.confidence_threshold,
            retry_base_delay: Duration::from_secs(config.retry_base_delay_secs),
        }
    }
}

/// Everything a worker needs, shared across the pool. Workers hold no other
/// mutable state; the queue mediates all cross-worker coordination.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn ObjectStore>,
    pub backend: Arc<dyn InferenceBackend>,
    pub results: Arc<dyn ResultStore>,
    pub crypto: Arc<EncryptionService>,
    pub config: WorkerConfig,
}

pub struct Worker {
    id: usize,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        Self { id, ctx }
    }

    /// Loop `process_cycle` until cancelled. The suspension points are the
    /// queue poll inside `dequeue_batch` and the inference call; an idle
    /// worker consumes no thread.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(worker = self.id, "worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                cycle = self.process_cycle() => match cycle {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(worker = self.id, jobs = n, "cycle complete"),
                    Err(e) => {
                        tracing::error!(worker = self.id, error = %e, "cycle failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        tracing::info!(worker = self.id, "worker stopped");
    }

    /// One full processing cycle. Returns the number of jobs fetched (0 when
    /// the dequeue poll timed out).
    pub async fn process_cycle(&self) -> Result<usize, QueueError> {
        let jobs = self
            .ctx
            .queue
            .dequeue_batch(self.ctx.config.batch_size, self.ctx.config.visibility_timeout)
            .await?;
        if jobs.is_empty() {
            return Ok(0);
        }
        let fetched = jobs.len();
        tracing::info!(worker = self.id, batch = fetched, "processing batch");

        for job in &jobs {
            if let Err(e) = self.ctx.results.mark_processing(job.job_id).await {
                tracing::warn!(job_id = %job.job_id, error = %e, "failed to mark job processing");
            }
        }

        // Resolve image bytes. Jobs that fail here are settled immediately
        // and excluded from the inference batch; the rest proceed together.
        let mut resolved: Vec<(Job, Vec<u8>)> = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.resolve_image(&job).await {
                Ok(bytes) => resolved.push((job, bytes)),
                Err(failure) => self.fail_job(&job, failure, Duration::ZERO).await,
            }
        }
        if resolved.is_empty() {
            return Ok(fetched);
        }

        // One inference call for the whole batch: the fixed per-call cost is
        // amortized across every image in it.
        let (batch_jobs, images): (Vec<Job>, Vec<Vec<u8>>) = resolved.into_iter().unzip();
        let started = Instant::now();
        let outcomes = self.ctx.backend.infer(&images).await;
        let elapsed = started.elapsed().as_secs_f64();

        if outcomes.len() != batch_jobs.len() {
            // Contract violation from the adapter; treat the batch as a
            // backend failure rather than guessing an alignment.
            tracing::error!(
                worker = self.id,
                expected = batch_jobs.len(),
                got = outcomes.len(),
                "inference adapter broke the one-outcome-per-input contract"
            );
            for job in &batch_jobs {
                self.fail_job(
                    job,
                    FailureClass::retryable(FailureReason::InferenceError),
                    self.backoff(job),
                )
                .await;
            }
            return Ok(fetched);
        }

        for (job, outcome) in batch_jobs.iter().zip(outcomes) {
            self.settle(job, outcome, elapsed).await;
        }
        Ok(fetched)
    }

    /// Fetch and decrypt the stored image, then preprocess it for inference.
    async fn resolve_image(&self, job: &Job) -> Result<Vec<u8>, FailureClass> {
        let encrypted = self.ctx.store.get(&job.image_key).await.map_err(|e| {
            tracing::warn!(job_id = %job.job_id, key = %job.image_key, error = %e, "image resolution failed");
            match e {
                StorageError::NotFound(_) => FailureClass::terminal(FailureReason::ImageNotFound),
                // Transient storage trouble: retrying can succeed.
                _ => FailureClass::retryable(FailureReason::ImageNotFound),
            }
        })?;

        let raw = self.ctx.crypto.decrypt(&encrypted).map_err(|e| {
            tracing::warn!(job_id = %job.job_id, error = %e, "stored image failed to decrypt");
            FailureClass::terminal(FailureReason::InferenceError)
        })?;

        preprocess(&raw).map_err(|e| {
            tracing::warn!(job_id = %job.job_id, error = %e, "stored bytes are not a decodable image");
            FailureClass::terminal(FailureReason::InferenceError)
        })
    }

    /// Decide one job's fate from its inference outcome.
    async fn settle(&self, job: &Job, outcome: InferenceOutcome, elapsed_seconds: f64) {
        match outcome {
            InferenceOutcome::Failed(OutcomeFailure::Timeout) => {
                self.fail_job(
                    job,
                    FailureClass::retryable(FailureReason::OcrTimeout),
                    self.backoff(job),
                )
                .await;
            }
            InferenceOutcome::Failed(OutcomeFailure::BackendUnavailable) => {
                self.fail_job(
                    job,
                    FailureClass::retryable(FailureReason::InferenceError),
                    self.backoff(job),
                )
                .await;
            }
            InferenceOutcome::Failed(OutcomeFailure::CorruptInput) => {
                self.fail_job(
                    job,
                    FailureClass::terminal(FailureReason::InferenceError),
                    Duration::ZERO,
                )
                .await;
            }
            InferenceOutcome::Lines(lines) => {
                let fields = extract_address(&lines);
                if fields.is_empty() {
                    self.fail_job(
                        job,
                        FailureClass::terminal(FailureReason::MalformedResult),
                        Duration::ZERO,
                    )
                    .await;
                    return;
                }
                if fields.confidence < self.ctx.config.confidence_threshold {
                    tracing::info!(
                        job_id = %job.job_id,
                        confidence = fields.confidence,
                        threshold = self.ctx.config.confidence_threshold,
                        "extraction below confidence threshold"
                    );
                    self.fail_job(
                        job,
                        FailureClass::retryable(FailureReason::LowConfidence),
                        self.ctx.config.retry_base_delay,
                    )
                    .await;
                    return;
                }

                let result = JobResult {
                    job_id: job.job_id,
                    street_number: fields.street_number,
                    street_name: fields.street_name,
                    unit_number: fields.unit_number,
                    confidence: fields.confidence,
                    processing_time_seconds: elapsed_seconds,
                };
                match self.ctx.results.persist_result(&result).await {
                    Ok(()) => {
                        if let Err(e) = self.ctx.queue.ack(job.job_id).await {
                            // The result is stored; if the ack is lost the job
                            // will be reprocessed and upserted again.
                            tracing::error!(job_id = %job.job_id, error = %e, "ack failed after persist");
                        }
                        counter!("pod_jobs_completed_total").increment(1);
                        histogram!("pod_processing_seconds").record(elapsed_seconds);
                        tracing::info!(
                            job_id = %job.job_id,
                            street_number = result.street_number.as_deref().unwrap_or("-"),
                            street_name = result.street_name.as_deref().unwrap_or("-"),
                            confidence = result.confidence,
                            "job completed"
                        );
                    }
                    Err(e) => {
                        // Do not ack and do not requeue: the visibility
                        // timeout will re-deliver the job once storage is
                        // healthy again.
                        tracing::error!(job_id = %job.job_id, error = %e, "result persistence failed, leaving job in flight");
                    }
                }
            }
        }
    }

    /// Report a failed attempt and mirror the queue's routing decision into
    /// the job store.
    async fn fail_job(&self, job: &Job, failure: FailureClass, delay: Duration) {
        match self.ctx.queue.requeue(job.job_id, failure, delay).await {
            Ok(Disposition::Requeued { retry_count }) => {
                counter!("pod_jobs_retried_total").increment(1);
                tracing::info!(
                    job_id = %job.job_id,
                    reason = %failure.reason,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "job requeued"
                );
                if let Err(e) = self.ctx.results.mark_requeued(job.job_id, retry_count).await {
                    tracing::warn!(job_id = %job.job_id, error = %e, "failed to mark job requeued");
                }
            }
            Ok(Disposition::DeadLettered { reason, attempt }) => {
                counter!("pod_jobs_dead_lettered_total").increment(1);
                tracing::warn!(job_id = %job.job_id, reason = %reason, attempt, "job dead-lettered");
                if let Err(e) = self.ctx.results.mark_dead_lettered(job.job_id, reason).await {
                    tracing::warn!(job_id = %job.job_id, error = %e, "failed to mark job dead-lettered");
                }
            }
            Ok(Disposition::NotFound) => {
                tracing::debug!(job_id = %job.job_id, "job no longer in flight; already recovered");
            }
            Err(e) => {
                // Broker unreachable: the visibility timeout recovers the job.
                tracing::error!(job_id = %job.job_id, error = %e, "requeue failed, leaving job in flight");
            }
        }
    }

    /// Exponential backoff for transient backend failures, so a struggling
    /// inference server is not hammered by immediate retries.
    fn backoff(&self, job: &Job) -> Duration {
        let exponent = job.retry_count.min(5);
        self.ctx.config.retry_base_delay * 2u32.pow(exponent)
    }
}
