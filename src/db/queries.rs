use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{JobStatus, PreparationJob};
use crate::models::listing::{Listing, PreparationStatus};
use crate::models::photo::{Photo, PhotoAnalysis, PhotoStatus};
use crate::models::strategy::ToolId;

use super::repo::RepoError;

fn decode_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

// ── Listings ─────────────────────────────────────────────────────────

/// Insert a new listing (used by tests and seeding; uploads are owned
/// by the upstream service).
pub async fn create_listing(pool: &PgPool, owner_id: Uuid) -> Result<Listing, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO listings (owner_id)
        VALUES ($1)
        RETURNING id, owner_id, preparation_status, hero_photo_id, confidence_score, prepared_at
        "#,
    )
    .bind(owner_id)
    .fetch_one(pool)
    .await?;

    listing_from_row(&row)
}

/// Get a listing by ID
pub async fn get_listing(pool: &PgPool, listing_id: Uuid) -> Result<Option<Listing>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, owner_id, preparation_status, hero_photo_id, confidence_score, prepared_at
        FROM listings
        WHERE id = $1
        "#,
    )
    .bind(listing_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(listing_from_row).transpose()
}

/// Update listing preparation status
pub async fn set_listing_status(
    pool: &PgPool,
    listing_id: Uuid,
    status: PreparationStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE listings
        SET preparation_status = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(status.to_string())
    .bind(listing_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Write the finalization result: terminal preparation status, hero
/// photo, confidence score and prepared-at timestamp.
pub async fn finalize_listing(
    pool: &PgPool,
    listing_id: Uuid,
    status: PreparationStatus,
    hero_photo_id: Option<Uuid>,
    confidence_score: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE listings
        SET preparation_status = $1,
            hero_photo_id = $2,
            confidence_score = $3,
            prepared_at = NOW(),
            updated_at = NOW()
        WHERE id = $4
        "#,
    )
    .bind(status.to_string())
    .bind(hero_photo_id)
    .bind(confidence_score)
    .bind(listing_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn listing_from_row(row: &PgRow) -> Result<Listing, sqlx::Error> {
    let status_str: String = row.try_get("preparation_status")?;
    Ok(Listing {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        preparation_status: PreparationStatus::from_str(&status_str).map_err(decode_err)?,
        hero_photo_id: row.try_get("hero_photo_id")?,
        confidence_score: row.try_get("confidence_score")?,
        prepared_at: row.try_get("prepared_at")?,
    })
}

// ── Jobs ─────────────────────────────────────────────────────────────

/// Insert a new preparation job, rejecting it when the listing already
/// has a non-terminal job (at-most-one active preparation per listing).
/// Returns None on conflict.
pub async fn create_job(
    pool: &PgPool,
    listing_id: Uuid,
    owner_id: Uuid,
) -> Result<Option<PreparationJob>, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO preparation_jobs (listing_id, owner_id, status)
        SELECT $1, $2, 'queued'
        WHERE NOT EXISTS (
            SELECT 1 FROM preparation_jobs
            WHERE listing_id = $1 AND status IN ('queued', 'processing')
        )
        RETURNING id, listing_id, owner_id, status, retry_count, error, created_at, updated_at
        "#,
    )
    .bind(listing_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await;

    match result {
        Ok(row) => row.as_ref().map(job_from_row).transpose(),
        // The partial unique index closes the check-then-insert race.
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<PreparationJob>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, listing_id, owner_id, status, retry_count, error, created_at, updated_at
        FROM preparation_jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Update job status. Terminal rows are never touched, so transitions
/// can only move forward.
pub async fn update_job_status(
    pool: &PgPool,
    job_id: Uuid,
    status: JobStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE preparation_jobs
        SET status = $1, updated_at = NOW()
        WHERE id = $2 AND status NOT IN ('completed', 'failed')
        "#,
    )
    .bind(status.to_string())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a job failed with an error message (non-terminal rows only).
pub async fn fail_job(pool: &PgPool, job_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE preparation_jobs
        SET status = 'failed', error = $1, updated_at = NOW()
        WHERE id = $2 AND status NOT IN ('completed', 'failed')
        "#,
    )
    .bind(error)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Increment redelivery count, returning the new value.
pub async fn increment_retry_count(pool: &PgPool, job_id: Uuid) -> Result<i32, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE preparation_jobs
        SET retry_count = retry_count + 1, updated_at = NOW()
        WHERE id = $1
        RETURNING retry_count
        "#,
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;

    row.try_get("retry_count")
}

fn job_from_row(row: &PgRow) -> Result<PreparationJob, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    Ok(PreparationJob {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        owner_id: row.try_get("owner_id")?,
        status: JobStatus::from_str(&status_str).map_err(decode_err)?,
        retry_count: row.try_get("retry_count")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ── Photos ───────────────────────────────────────────────────────────

/// Insert a photo row (used by tests and seeding).
pub async fn create_photo(
    pool: &PgPool,
    listing_id: Uuid,
    raw_key: &str,
    upload_order: i32,
) -> Result<Photo, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO photos (listing_id, raw_key, upload_order)
        VALUES ($1, $2, $3)
        RETURNING id, listing_id, raw_key, enhanced_key, status, analysis, assigned_tools, upload_order
        "#,
    )
    .bind(listing_id)
    .bind(raw_key)
    .bind(upload_order)
    .fetch_one(pool)
    .await?;

    photo_from_row(&row).map_err(|e| match e {
        RepoError::Database(e) => e,
        other => sqlx::Error::Decode(other.to_string().into()),
    })
}

/// All photos for a listing in upload order.
pub async fn photos_for_listing(pool: &PgPool, listing_id: Uuid) -> Result<Vec<Photo>, RepoError> {
    let rows = sqlx::query(
        r#"
        SELECT id, listing_id, raw_key, enhanced_key, status, analysis, assigned_tools, upload_order
        FROM photos
        WHERE listing_id = $1
        ORDER BY upload_order ASC, id ASC
        "#,
    )
    .bind(listing_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(photo_from_row).collect()
}

/// Overwrite a photo's analysis for the current job run.
pub async fn save_photo_analysis(
    pool: &PgPool,
    photo_id: Uuid,
    analysis: &PhotoAnalysis,
) -> Result<(), sqlx::Error> {
    let value = serde_json::to_value(analysis).map_err(decode_err)?;
    sqlx::query(
        r#"
        UPDATE photos
        SET analysis = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(value)
    .bind(photo_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the ordered tool assignment from the strategy.
pub async fn set_photo_tools(
    pool: &PgPool,
    photo_id: Uuid,
    tools: &[ToolId],
) -> Result<(), sqlx::Error> {
    let names: Vec<String> = tools.iter().map(ToolId::to_string).collect();
    sqlx::query(
        r#"
        UPDATE photos
        SET assigned_tools = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(names)
    .bind(photo_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Update per-photo status
pub async fn set_photo_status(
    pool: &PgPool,
    photo_id: Uuid,
    status: PhotoStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE photos
        SET status = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(status.to_string())
    .bind(photo_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the head of the photo's enhancement chain.
pub async fn record_photo_output(
    pool: &PgPool,
    photo_id: Uuid,
    enhanced_key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE photos
        SET enhanced_key = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(enhanced_key)
    .bind(photo_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn photo_from_row(row: &PgRow) -> Result<Photo, RepoError> {
    let status_str: String = row.try_get("status")?;
    let status = PhotoStatus::from_str(&status_str)
        .map_err(|e| RepoError::Database(decode_err(e)))?;

    let analysis: Option<serde_json::Value> = row.try_get("analysis")?;
    let analysis = analysis
        .map(serde_json::from_value::<PhotoAnalysis>)
        .transpose()
        .map_err(|e| RepoError::Database(decode_err(e)))?;

    let tool_names: Option<Vec<String>> = row.try_get("assigned_tools")?;
    let assigned_tools = tool_names
        .map(|names| {
            names
                .into_iter()
                .map(|name| ToolId::from_str(&name).map_err(|_| RepoError::UnknownTool(name)))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    Ok(Photo {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        raw_key: row.try_get("raw_key")?,
        enhanced_key: row.try_get("enhanced_key")?,
        status,
        analysis,
        assigned_tools,
        upload_order: row.try_get("upload_order")?,
    })
}
