use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{Job, JobRecord, JobStatus, Priority};
use crate::models::result::JobResult;

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    Ok(JobRecord {
        id: row.try_get("id")?,
        status: status.parse().unwrap_or(JobStatus::Queued),
        image_key: row.try_get("image_key")?,
        priority: priority.parse().unwrap_or(Priority::Normal),
        delivery_id: row.try_get("delivery_id")?,
        client_id: row.try_get("client_id")?,
        retry_count: row.try_get("retry_count")?,
        failure_reason: row.try_get("failure_reason")?,
        submitted_at: row.try_get("submitted_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new job row at enqueue time
pub async fn create_job(
    pool: &PgPool,
    job: &Job,
    delivery_id: Option<&str>,
    client_id: Option<&str>,
) -> Result<JobRecord, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO pod_jobs (id, status, image_key, priority, delivery_id, client_id, submitted_at)
        VALUES ($1, 'queued', $2, $3, $4, $5, $6)
        RETURNING id, status, image_key, priority, delivery_id, client_id,
                  retry_count, failure_reason, submitted_at, updated_at
        "#,
    )
    .bind(job.job_id)
    .bind(&job.image_key)
    .bind(job.priority.to_string())
    .bind(delivery_id)
    .bind(client_id)
    .bind(job.enqueued_at)
    .fetch_one(pool)
    .await?;

    record_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<JobRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, status, image_key, priority, delivery_id, client_id,
               retry_count, failure_reason, submitted_at, updated_at
        FROM pod_jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Get the extracted result for a completed job
pub async fn get_result(pool: &PgPool, job_id: Uuid) -> Result<Option<JobResult>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT job_id, street_number, street_name, unit_number, confidence, processing_time_seconds
        FROM pod_results
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(r) => Some(JobResult {
            job_id: r.try_get("job_id")?,
            street_number: r.try_get("street_number")?,
            street_name: r.try_get("street_name")?,
            unit_number: r.try_get("unit_number")?,
            confidence: r.try_get("confidence")?,
            processing_time_seconds: r.try_get("processing_time_seconds")?,
        }),
        None => None,
    })
}

/// Update job status
pub async fn update_job_status(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE pod_jobs
        SET status = $1,
            updated_at = NOW(),
            processing_started_at = CASE WHEN $1 = 'processing' THEN NOW() ELSE processing_started_at END,
            processing_completed_at = CASE WHEN $1 IN ('completed', 'dead_lettered') THEN NOW() ELSE processing_completed_at END
        WHERE id = $2
        "#,
    )
    .bind(status.to_string())
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Put a job back to queued after a retryable failure
pub async fn mark_requeued(
    pool: &PgPool,
    job_id: Uuid,
    retry_count: u32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE pod_jobs
        SET status = 'queued', retry_count = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(retry_count as i32)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark a job as dead-lettered with its failure reason
pub async fn mark_dead_lettered(
    pool: &PgPool,
    job_id: Uuid,
    reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE pod_jobs
        SET status = 'dead_lettered', failure_reason = $1,
            processing_completed_at = NOW(), updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(reason)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Upsert an extracted result and mark the job completed. Reprocessed jobs
/// overwrite their earlier row (last write wins), so duplicate processing
/// after a visibility-timeout recovery is harmless.
pub async fn upsert_result(pool: &PgPool, result: &JobResult) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO pod_results (job_id, street_number, street_name, unit_number,
                                 confidence, processing_time_seconds)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (job_id) DO UPDATE
        SET street_number = EXCLUDED.street_number,
            street_name = EXCLUDED.street_name,
            unit_number = EXCLUDED.unit_number,
            confidence = EXCLUDED.confidence,
            processing_time_seconds = EXCLUDED.processing_time_seconds,
            recorded_at = NOW()
        "#,
    )
    .bind(result.job_id)
    .bind(&result.street_number)
    .bind(&result.street_name)
    .bind(&result.unit_number)
    .bind(result.confidence)
    .bind(result.processing_time_seconds)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE pod_jobs
        SET status = 'completed', processing_completed_at = NOW(), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(result.job_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Remove a job row (used to undo a submission whose enqueue failed)
pub async fn delete_job(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM pod_jobs WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Insert a dead-letter record; duplicates from the drain loop are ignored
pub async fn insert_failure_record(
    pool: &PgPool,
    job_id: Uuid,
    reason: &str,
    attempt: i32,
    recorded_at: chrono::DateTime<chrono::Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO pod_dead_letters (job_id, reason, attempt, recorded_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (job_id, attempt) DO NOTHING
        "#,
    )
    .bind(job_id)
    .bind(reason)
    .bind(attempt)
    .bind(recorded_at)
    .execute(pool)
    .await?;

    Ok(())
}
