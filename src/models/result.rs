use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured address data extracted from one delivery photo.
///
/// `confidence` is the minimum per-line OCR confidence among the lines that
/// contributed a field, or 0.0 when no field was extracted at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub unit_number: Option<String>,
    pub confidence: f64,
    pub processing_time_seconds: f64,
}
