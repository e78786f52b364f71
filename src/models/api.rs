use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::listing::PreparationStatus;
use super::photo::PhotoStatus;
use super::strategy::ToolId;

/// Request to start preparation for a listing.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct PrepareRequest {
    /// Queue priority hint (0 = default, 10 = most urgent).
    #[garde(range(min = 0, max = 10))]
    pub priority: Option<i32>,
}

/// Response after a preparation job has been accepted.
#[derive(Debug, Serialize)]
pub struct PrepareResponse {
    pub job_id: Uuid,
    pub listing_id: Uuid,
    pub status: String,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub listing_id: Uuid,
    pub status: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-photo summary inside the listing status response.
#[derive(Debug, Serialize)]
pub struct PhotoSummary {
    pub photo_id: Uuid,
    pub status: PhotoStatus,
    pub enhanced_key: Option<String>,
    pub assigned_tools: Option<Vec<ToolId>>,
}

/// Response describing a listing's preparation state.
#[derive(Debug, Serialize)]
pub struct ListingStatusResponse {
    pub listing_id: Uuid,
    pub preparation_status: PreparationStatus,
    pub hero_photo_id: Option<Uuid>,
    pub confidence_score: Option<f64>,
    pub prepared_at: Option<DateTime<Utc>>,
    pub photos: Vec<PhotoSummary>,
}
