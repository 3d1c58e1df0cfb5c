use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::Priority;
use crate::models::result::JobResult;

/// Optional metadata accompanying an uploaded delivery photo.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SubmitMetadata {
    #[garde(length(min = 1, max = 100))]
    pub delivery_id: Option<String>,

    #[garde(length(min = 1, max = 100))]
    pub client_id: Option<String>,

    #[garde(skip)]
    pub priority: Option<Priority>,
}

/// Response after submitting a photo: the job handle, returned immediately.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
}

/// Response for polling a job by id.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}
