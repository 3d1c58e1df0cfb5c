//! Result-store seam used by the worker engine. The PostgreSQL
//! implementation delegates to [`crate::db::queries`]; tests substitute an
//! in-memory store.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{FailureReason, FailureRecord, JobStatus};
use crate::models::result::JobResult;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn mark_processing(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Idempotent upsert keyed by job_id; also marks the job completed.
    async fn persist_result(&self, result: &JobResult) -> Result<(), StoreError>;

    async fn mark_requeued(&self, job_id: Uuid, retry_count: u32) -> Result<(), StoreError>;

    async fn mark_dead_lettered(
        &self,
        job_id: Uuid,
        reason: FailureReason,
    ) -> Result<(), StoreError>;

    /// Mirror a dead-letter sink record; must tolerate duplicates.
    async fn record_failure(&self, record: &FailureRecord) -> Result<(), StoreError>;
}

pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn mark_processing(&self, job_id: Uuid) -> Result<(), StoreError> {
        queries::update_job_status(&self.pool, job_id, JobStatus::Processing).await?;
        Ok(())
    }

    async fn persist_result(&self, result: &JobResult) -> Result<(), StoreError> {
        queries::upsert_result(&self.pool, result).await?;
        Ok(())
    }

    async fn mark_requeued(&self, job_id: Uuid, retry_count: u32) -> Result<(), StoreError> {
        queries::mark_requeued(&self.pool, job_id, retry_count).await?;
        Ok(())
    }

    async fn mark_dead_lettered(
        &self,
        job_id: Uuid,
        reason: FailureReason,
    ) -> Result<(), StoreError> {
        queries::mark_dead_lettered(&self.pool, job_id, &reason.to_string()).await?;
        Ok(())
    }

    async fn record_failure(&self, record: &FailureRecord) -> Result<(), StoreError> {
        queries::insert_failure_record(
            &self.pool,
            record.job_id,
            &record.reason.to_string(),
            record.attempt as i32,
            record.timestamp,
        )
        .await?;
        queries::mark_dead_lettered(&self.pool, record.job_id, &record.reason.to_string()).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("result store unavailable: {0}")]
    Unavailable(String),
}
