use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::strategy::Strategy;

/// Stage of a checkpointed job, carrying only the data valid for that
/// stage. `completed` holds the ids of photos whose whole tool list has
/// finished (success or exhausted retries) with outputs durably stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum CheckpointStage {
    Analyzing,
    Processing {
        strategy: Strategy,
        completed: BTreeSet<Uuid>,
    },
    Finalizing {
        strategy: Strategy,
        completed: BTreeSet<Uuid>,
    },
}

impl CheckpointStage {
    pub fn name(&self) -> &'static str {
        match self {
            CheckpointStage::Analyzing => "analyzing",
            CheckpointStage::Processing { .. } => "processing",
            CheckpointStage::Finalizing { .. } => "finalizing",
        }
    }
}

/// Durable per-job progress record. Owned by the single orchestrator
/// instance currently processing the job; overwritten on every stage
/// transition and after each completed photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: Uuid,
    pub stage: CheckpointStage,
    pub updated_at: DateTime<Utc>,
}
