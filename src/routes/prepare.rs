use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::api::{
    JobStatusResponse, ListingStatusResponse, PhotoSummary, PrepareRequest, PrepareResponse,
};
use crate::models::listing::{Listing, PreparationStatus};
use crate::services::queue::PrepareMessage;

/// POST /api/v1/listings/{listing_id}/prepare — start preparation for a
/// listing. Returns 409 when a job is already queued or in flight.
pub async fn prepare_listing(
    State(state): State<AppState>,
    Path(listing_id): Path<Uuid>,
    Json(request): Json<PrepareRequest>,
) -> Result<(StatusCode, Json<PrepareResponse>), StatusCode> {
    request
        .validate()
        .map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let listing = queries::get_listing(&state.db, listing_id)
        .await
        .map_err(|e| {
            tracing::error!(listing_id = %listing_id, error = %e, "Failed to load listing");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    // The partial unique index enforces at-most-one active job per
    // listing; create_job returns None when one already exists.
    let job = queries::create_job(&state.db, listing.id, listing.owner_id)
        .await
        .map_err(|e| {
            tracing::error!(listing_id = %listing_id, error = %e, "Failed to create job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::CONFLICT)?;

    if let Err(e) =
        queries::set_listing_status(&state.db, listing.id, PreparationStatus::Preparing).await
    {
        tracing::error!(listing_id = %listing_id, error = %e, "Failed to update listing status");
        abandon_job(&state, &listing, job.id).await;
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let message = PrepareMessage {
        job_id: job.id,
        listing_id: listing.id,
        owner_id: listing.owner_id,
        priority: request.priority.unwrap_or(0),
    };
    if let Err(e) = state.queue.enqueue(&message).await {
        tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue job");
        abandon_job(&state, &listing, job.id).await;
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    metrics::counter!("pipeline_jobs_submitted_total").increment(1);
    tracing::info!(job_id = %job.id, listing_id = %listing_id, "Preparation job accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(PrepareResponse {
            job_id: job.id,
            listing_id: listing.id,
            status: job.status.to_string(),
            message: "Listing submitted for preparation".to_string(),
        }),
    ))
}

/// A submission error after the job row exists would otherwise leave the
/// listing wedged: the one-active-job index rejects every later prepare
/// while nothing is on the queue to drive the job forward. Fail the fresh
/// job and put the listing status back so the client can retry.
async fn abandon_job(state: &AppState, listing: &Listing, job_id: Uuid) {
    if let Err(e) = queries::fail_job(&state.db, job_id, "submission failed before enqueue").await {
        tracing::error!(job_id = %job_id, error = %e, "Failed to abandon job after submission error");
    }
    if let Err(e) =
        queries::set_listing_status(&state.db, listing.id, listing.preparation_status).await
    {
        tracing::error!(listing_id = %listing.id, error = %e, "Failed to restore listing status");
    }
}

/// GET /api/v1/jobs/{job_id} — check preparation job status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = queries::get_job(&state.db, job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        listing_id: job.listing_id,
        status: job.status.to_string(),
        error: job.error,
        created_at: job.created_at,
        updated_at: job.updated_at,
    }))
}

/// GET /api/v1/listings/{listing_id} — listing preparation state with
/// per-photo outcomes.
pub async fn get_listing_status(
    State(state): State<AppState>,
    Path(listing_id): Path<Uuid>,
) -> Result<Json<ListingStatusResponse>, StatusCode> {
    let listing = queries::get_listing(&state.db, listing_id)
        .await
        .map_err(|e| {
            tracing::error!(listing_id = %listing_id, error = %e, "Failed to load listing");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let photos = queries::photos_for_listing(&state.db, listing_id)
        .await
        .map_err(|e| {
            tracing::error!(listing_id = %listing_id, error = %e, "Failed to load photos");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let photos = photos
        .into_iter()
        .map(|p| PhotoSummary {
            photo_id: p.id,
            status: p.status,
            enhanced_key: p.enhanced_key,
            assigned_tools: p.assigned_tools,
        })
        .collect();

    Ok(Json(ListingStatusResponse {
        listing_id: listing.id,
        preparation_status: listing.preparation_status,
        hero_photo_id: listing.hero_photo_id,
        confidence_score: listing.confidence_score,
        prepared_at: listing.prepared_at,
        photos,
    }))
}
