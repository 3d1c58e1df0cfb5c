use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Priority class of a job. Selects which physical queue the job lands in;
/// ordering within a queue is FIFO regardless of priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Priority {
    Express,
    #[default]
    Normal,
    Bulk,
}

/// Status of an OCR job as recorded in the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    DeadLettered,
}

/// One image awaiting processing. Carries a storage key rather than raw bytes
/// to keep queue entries small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub image_key: String,
    pub priority: Priority,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(image_key: impl Into<String>, priority: Priority) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            image_key: image_key.into(),
            priority,
            retry_count: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// Why a job failed an attempt or was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    ImageNotFound,
    OcrTimeout,
    LowConfidence,
    InferenceError,
    MalformedResult,
}

/// Terminal or retryable failure captured when a job is dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_id: Uuid,
    pub reason: FailureReason,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// A job row as stored in PostgreSQL, joined with its result when completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    pub image_key: String,
    pub priority: Priority,
    pub delivery_id: Option<String>,
    pub client_id: Option<String>,
    pub retry_count: i32,
    pub failure_reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
