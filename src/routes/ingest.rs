use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use garde::Validate;
use metrics::counter;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::ingest::{JobStatusResponse, SubmitMetadata, SubmitResponse};
use crate::models::job::{Job, JobStatus};
use crate::services::queue::QueueError;

/// Hard cap on uploaded photo size.
const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

fn format_allowed(format: image::ImageFormat) -> bool {
    matches!(
        format,
        image::ImageFormat::Jpeg | image::ImageFormat::Png | image::ImageFormat::WebP
    )
}

/// POST /api/v1/photos — accept a delivery photo for asynchronous OCR.
///
/// Validation is synchronous; everything else happens in the worker pool.
/// The caller gets a job handle back immediately, decoupling ingestion
/// latency from inference latency.
pub async fn submit_photo(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut image_data: Option<Vec<u8>> = None;
    let mut metadata = SubmitMetadata::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("malformed multipart body"))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::BadRequest("unreadable image field"))?;
                image_data = Some(data.to_vec());
            }
            "delivery_id" => {
                metadata.delivery_id = Some(read_text(field).await?);
            }
            "client_id" => {
                metadata.client_id = Some(read_text(field).await?);
            }
            "priority" => {
                let raw = read_text(field).await?;
                metadata.priority =
                    Some(raw.parse().map_err(|_| {
                        ApiError::BadRequest("priority must be express, normal, or bulk")
                    })?);
            }
            _ => {}
        }
    }

    let image_data = image_data.ok_or(ApiError::BadRequest("missing image field"))?;
    if image_data.len() > MAX_IMAGE_BYTES {
        return Err(ApiError::PayloadTooLarge);
    }
    let format = image::guess_format(&image_data).map_err(|_| ApiError::UnsupportedFormat)?;
    if !format_allowed(format) {
        return Err(ApiError::UnsupportedFormat);
    }
    metadata.validate().map_err(|e| ApiError::Invalid(e.to_string()))?;

    let job_id = Uuid::new_v4();
    let job = Job {
        job_id,
        image_key: format!("photos/{job_id}.enc"),
        priority: metadata.priority.unwrap_or_default(),
        retry_count: 0,
        enqueued_at: Utc::now(),
    };

    // Store encrypted bytes first, then the job row, then enqueue; the queue
    // entry carries only the storage key.
    let encrypted = state.crypto.encrypt(&image_data).map_err(|e| {
        tracing::error!(error = %e, "failed to encrypt upload");
        ApiError::Internal
    })?;
    state
        .storage
        .put(&job.image_key, &encrypted, "application/octet-stream")
        .await
        .map_err(|e| {
            tracing::error!(error = %e, key = %job.image_key, "failed to store upload");
            ApiError::Internal
        })?;
    queries::create_job(
        &state.db,
        &job,
        metadata.delivery_id.as_deref(),
        metadata.client_id.as_deref(),
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, job_id = %job_id, "failed to create job row");
        ApiError::Internal
    })?;

    if let Err(e) = state.queue.enqueue(job.clone()).await {
        // Backpressure: tell the caller to retry rather than dropping the
        // job silently. Undo the partial submission.
        tracing::warn!(error = %e, job_id = %job_id, "enqueue failed, rejecting submission");
        if let Err(e) = queries::delete_job(&state.db, job_id).await {
            tracing::warn!(error = %e, job_id = %job_id, "failed to clean up job row");
        }
        if let Err(e) = state.storage.delete(&job.image_key).await {
            tracing::warn!(error = %e, key = %job.image_key, "failed to clean up stored upload");
        }
        return Err(match e {
            QueueError::Unavailable(_) | QueueError::Broker(_) => ApiError::QueueUnavailable,
            QueueError::Serialize(_) => ApiError::Internal,
        });
    }

    counter!("pod_jobs_submitted_total").increment(1);
    tracing::info!(job_id = %job_id, priority = %job.priority, "photo accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: "queued".to_string(),
            submitted_at: job.enqueued_at,
        }),
    ))
}

/// GET /api/v1/photos/{job_id} — poll a job for its extracted address.
pub async fn get_photo_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let record = queries::get_job(&state.db, job_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, job_id = %job_id, "failed to load job");
            ApiError::Internal
        })?
        .ok_or(ApiError::NotFound)?;

    let result = if record.status == JobStatus::Completed {
        queries::get_result(&state.db, job_id).await.map_err(|e| {
            tracing::error!(error = %e, job_id = %job_id, "failed to load result");
            ApiError::Internal
        })?
    } else {
        None
    };

    Ok(Json(JobStatusResponse {
        job_id,
        status: record.status.to_string(),
        result,
        failure_reason: record.failure_reason,
    }))
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|_| ApiError::BadRequest("unreadable text field"))
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),

    #[error("image exceeds the 5 MB limit")]
    PayloadTooLarge,

    #[error("unsupported image format (expected JPEG, PNG, or WebP)")]
    UnsupportedFormat,

    #[error("{0}")]
    Invalid(String),

    #[error("job not found")]
    NotFound,

    #[error("queue unavailable, retry later")]
    QueueUnavailable,

    #[error("internal error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) | ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::QueueUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
