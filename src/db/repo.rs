use sqlx::PgPool;
use uuid::Uuid;

use crate::models::job::{JobStatus, PreparationJob};
use crate::models::listing::PreparationStatus;
use crate::models::photo::{Photo, PhotoAnalysis, PhotoStatus};
use crate::models::strategy::ToolId;

use super::queries;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown enhancement tool `{0}`")]
    UnknownTool(String),

    #[error("record not found: {0}")]
    NotFound(&'static str),
}

/// Repository boundary over the Metadata Store. The orchestrator only
/// sees this trait, which keeps it testable against in-memory fakes.
#[allow(async_fn_in_trait)]
pub trait MetadataRepository: Send + Sync {
    async fn set_listing_status(
        &self,
        listing_id: Uuid,
        status: PreparationStatus,
    ) -> Result<(), RepoError>;
    async fn finalize_listing(
        &self,
        listing_id: Uuid,
        status: PreparationStatus,
        hero_photo_id: Option<Uuid>,
        confidence_score: f64,
    ) -> Result<(), RepoError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<PreparationJob>, RepoError>;
    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), RepoError>;

    async fn photos_for_listing(&self, listing_id: Uuid) -> Result<Vec<Photo>, RepoError>;
    async fn save_photo_analysis(
        &self,
        photo_id: Uuid,
        analysis: &PhotoAnalysis,
    ) -> Result<(), RepoError>;
    async fn set_photo_tools(&self, photo_id: Uuid, tools: &[ToolId]) -> Result<(), RepoError>;
    async fn set_photo_status(&self, photo_id: Uuid, status: PhotoStatus) -> Result<(), RepoError>;
    async fn record_photo_output(&self, photo_id: Uuid, enhanced_key: &str)
        -> Result<(), RepoError>;
}

/// PostgreSQL-backed repository delegating to the query layer.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MetadataRepository for PgRepository {
    async fn set_listing_status(
        &self,
        listing_id: Uuid,
        status: PreparationStatus,
    ) -> Result<(), RepoError> {
        Ok(queries::set_listing_status(&self.pool, listing_id, status).await?)
    }

    async fn finalize_listing(
        &self,
        listing_id: Uuid,
        status: PreparationStatus,
        hero_photo_id: Option<Uuid>,
        confidence_score: f64,
    ) -> Result<(), RepoError> {
        Ok(queries::finalize_listing(
            &self.pool,
            listing_id,
            status,
            hero_photo_id,
            confidence_score,
        )
        .await?)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<PreparationJob>, RepoError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), RepoError> {
        Ok(queries::update_job_status(&self.pool, job_id, status).await?)
    }

    async fn photos_for_listing(&self, listing_id: Uuid) -> Result<Vec<Photo>, RepoError> {
        queries::photos_for_listing(&self.pool, listing_id).await
    }

    async fn save_photo_analysis(
        &self,
        photo_id: Uuid,
        analysis: &PhotoAnalysis,
    ) -> Result<(), RepoError> {
        Ok(queries::save_photo_analysis(&self.pool, photo_id, analysis).await?)
    }

    async fn set_photo_tools(&self, photo_id: Uuid, tools: &[ToolId]) -> Result<(), RepoError> {
        Ok(queries::set_photo_tools(&self.pool, photo_id, tools).await?)
    }

    async fn set_photo_status(&self, photo_id: Uuid, status: PhotoStatus) -> Result<(), RepoError> {
        Ok(queries::set_photo_status(&self.pool, photo_id, status).await?)
    }

    async fn record_photo_output(
        &self,
        photo_id: Uuid,
        enhanced_key: &str,
    ) -> Result<(), RepoError> {
        Ok(queries::record_photo_output(&self.pool, photo_id, enhanced_key).await?)
    }
}
