use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Preparation lifecycle of a listing's photo set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PreparationStatus {
    Unprepared,
    Preparing,
    Prepared,
    NeedsReview,
    Failed,
}

/// A property listing whose photos move through the enhancement pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub preparation_status: PreparationStatus,
    pub hero_photo_id: Option<Uuid>,
    pub confidence_score: Option<f64>,
    pub prepared_at: Option<DateTime<Utc>>,
}
