use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a preparation job. Transitions are forward-only:
/// queued -> processing -> {completed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One preparation attempt for a listing. The unit of at-least-once
/// delivery and of checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparationJob {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub owner_id: Uuid,
    pub status: JobStatus,
    pub retry_count: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
