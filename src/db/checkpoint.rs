use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::checkpoint::{Checkpoint, CheckpointStage};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable per-job progress record, read once at job start and
/// overwritten on every stage transition and completed photo.
#[allow(async_fn_in_trait)]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, job_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError>;
    async fn save(&self, job_id: Uuid, stage: &CheckpointStage) -> Result<(), CheckpointError>;
    async fn delete(&self, job_id: Uuid) -> Result<(), CheckpointError>;
}

/// Checkpoints live in the `job_checkpoints` table with the stage as a
/// JSONB payload, one row per job.
#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, job_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            r#"
            SELECT stage, updated_at
            FROM job_checkpoints
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let stage_value: serde_json::Value = row.try_get("stage")?;
                let stage: CheckpointStage = serde_json::from_value(stage_value)?;
                Ok(Some(Checkpoint {
                    job_id,
                    stage,
                    updated_at: row.try_get("updated_at")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, job_id: Uuid, stage: &CheckpointStage) -> Result<(), CheckpointError> {
        let value = serde_json::to_value(stage)?;
        sqlx::query(
            r#"
            INSERT INTO job_checkpoints (job_id, stage)
            VALUES ($1, $2)
            ON CONFLICT (job_id) DO UPDATE
            SET stage = EXCLUDED.stage, updated_at = NOW()
            "#,
        )
        .bind(job_id)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, job_id: Uuid) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM job_checkpoints WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
