use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use uuid::Uuid;

use crate::db::checkpoint::{CheckpointError, CheckpointStore};
use crate::db::repo::{MetadataRepository, RepoError};
use crate::models::checkpoint::CheckpointStage;
use crate::models::job::{JobStatus, PreparationJob};
use crate::models::listing::PreparationStatus;
use crate::models::photo::{Photo, PhotoAnalysis, PhotoStatus};
use crate::models::strategy::Strategy;
use crate::services::executor::{EnhancementProvider, EnhancementResult, Executor};
use crate::services::queue::PrepareMessage;
use crate::services::router::{route, InvocationDescriptor, PhotoContext};
use crate::services::storage::{ImageStore, StorageError};
use crate::services::strategy::{build_strategy, AnalyzedPhoto};
use crate::services::vision::VisionProvider;

/// Tunable pipeline parameters. Defaults mirror production settings;
/// tests shrink the delays to zero.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum simultaneous in-flight vision analysis calls.
    pub analysis_concurrency: usize,
    /// Attempts per provider call before demoting to a permanent failure.
    pub retry_budget: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Throttle between tool invocations on the same photo.
    pub tool_delay: Duration,
    /// Failed-photo ratio above which the listing needs review.
    pub needs_review_threshold: f64,
    /// Minimum hero score for an exterior to lead the listing.
    pub hero_threshold: f64,
    /// Margin added to a tool's estimated latency for its call timeout.
    pub timeout_margin: Duration,
    /// Validity of presigned retrieval URLs handed to providers.
    pub presign_expiry_secs: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis_concurrency: 20,
            retry_budget: 3,
            retry_base_delay: Duration::from_millis(500),
            tool_delay: Duration::from_millis(500),
            needs_review_threshold: 0.5,
            hero_threshold: 0.7,
            timeout_margin: Duration::from_secs(30),
            presign_expiry_secs: 3600,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no photos could be analyzed for listing {0}")]
    NoAnalyzablePhotos(Uuid),

    #[error("unknown enhancement tool `{0}`")]
    UnknownTool(String),

    #[error("job cancelled before completion")]
    Cancelled,

    #[error("metadata store failure: {0}")]
    Repo(RepoError),

    #[error("checkpoint store failure: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("image store failure: {0}")]
    Storage(#[from] StorageError),
}

impl From<RepoError> for PipelineError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::UnknownTool(name) => PipelineError::UnknownTool(name),
            other => PipelineError::Repo(other),
        }
    }
}

impl PipelineError {
    /// Whether queue redelivery should retry the job from its last
    /// checkpoint. Configuration errors and empty-analysis failures are
    /// terminal; infrastructure failures and cancellation are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Repo(_)
                | PipelineError::Checkpoint(_)
                | PipelineError::Storage(_)
        )
    }
}

/// Drives exactly one preparation job from `queued`/`processing` to a
/// terminal state, tolerating redelivery via checkpoint-driven resume.
///
/// Stage sequence: Analyzing -> StrategyBuilt -> Processing -> Finalizing.
/// Collaborators are injected so the whole machine runs against
/// in-memory fakes in tests.
pub struct Orchestrator<'a, R, C, S, V, P> {
    repo: &'a R,
    checkpoints: &'a C,
    store: &'a S,
    vision: &'a V,
    provider: &'a P,
    config: &'a PipelineConfig,
    cancel: watch::Receiver<bool>,
}

impl<'a, R, C, S, V, P> Orchestrator<'a, R, C, S, V, P>
where
    R: MetadataRepository,
    C: CheckpointStore,
    S: ImageStore,
    V: VisionProvider,
    P: EnhancementProvider,
{
    pub fn new(
        repo: &'a R,
        checkpoints: &'a C,
        store: &'a S,
        vision: &'a V,
        provider: &'a P,
        config: &'a PipelineConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            repo,
            checkpoints,
            store,
            vision,
            provider,
            config,
            cancel,
        }
    }

    /// Run one job to a terminal state. Returning `Ok` means the job
    /// completed (or had already completed on a redelivered message);
    /// the caller acks the queue message. Error disposition is the
    /// caller's job: see [`PipelineError::is_retryable`].
    pub async fn run(&self, msg: &PrepareMessage) -> Result<(), PipelineError> {
        let job = self
            .repo
            .get_job(msg.job_id)
            .await?
            .ok_or(RepoError::NotFound("preparation job"))?;

        if job.status.is_terminal() {
            tracing::info!(job_id = %job.id, status = %job.status, "redelivered terminal job, nothing to do");
            return Ok(());
        }

        let result = self.drive(&job).await;
        if let Err(e) = &result {
            // A job that can never resume has no use for its checkpoint.
            if !e.is_retryable() {
                if let Err(del) = self.checkpoints.delete(job.id).await {
                    tracing::warn!(
                        job_id = %job.id,
                        error = %del,
                        "failed to drop checkpoint of terminally failed job"
                    );
                }
            }
        }
        result
    }

    async fn drive(&self, job: &PreparationJob) -> Result<(), PipelineError> {
        let (strategy, mut completed) = match self.checkpoints.load(job.id).await?.map(|cp| cp.stage)
        {
            Some(CheckpointStage::Processing {
                strategy,
                completed,
            })
            | Some(CheckpointStage::Finalizing {
                strategy,
                completed,
            }) => {
                tracing::info!(
                    job_id = %job.id,
                    completed = completed.len(),
                    "resuming job from checkpoint"
                );
                self.repo
                    .update_job_status(job.id, JobStatus::Processing)
                    .await?;
                (strategy, completed)
            }
            // An `analyzing` checkpoint has no restorable progress;
            // analysis reruns from scratch.
            Some(CheckpointStage::Analyzing) | None => {
                self.repo
                    .update_job_status(job.id, JobStatus::Processing)
                    .await?;
                self.repo
                    .set_listing_status(job.listing_id, PreparationStatus::Preparing)
                    .await?;
                self.checkpoints
                    .save(job.id, &CheckpointStage::Analyzing)
                    .await?;
                let strategy = self.analyze_and_plan(job).await?;
                (strategy, BTreeSet::new())
            }
        };

        self.process_photos(job, &strategy, &mut completed).await?;
        self.finalize(job, &strategy, &completed).await
    }

    /// Analyzing + StrategyBuilt stages: fan out vision analysis with
    /// bounded concurrency, build the strategy from the successes, and
    /// persist the `processing` checkpoint with an empty completed-set.
    async fn analyze_and_plan(&self, job: &PreparationJob) -> Result<Strategy, PipelineError> {
        let photos = self.repo.photos_for_listing(job.listing_id).await?;
        if photos.is_empty() {
            return Err(PipelineError::NoAnalyzablePhotos(job.listing_id));
        }

        tracing::info!(job_id = %job.id, photos = photos.len(), "analyzing photos");

        let this = &*self;
        let outcomes: Vec<(Photo, Result<PhotoAnalysis, String>)> = stream::iter(photos)
            .map(move |photo| async move {
                let started = Instant::now();
                let outcome = this.analyze_photo(&photo).await;
                metrics::histogram!("pipeline_analysis_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                (photo, outcome)
            })
            .buffer_unordered(self.config.analysis_concurrency)
            .collect()
            .await;

        let mut analyzed = Vec::new();
        for (photo, outcome) in outcomes {
            match outcome {
                Ok(analysis) => {
                    self.repo.save_photo_analysis(photo.id, &analysis).await?;
                    metrics::counter!("pipeline_photos_analyzed_total").increment(1);
                    analyzed.push(AnalyzedPhoto {
                        photo_id: photo.id,
                        upload_order: photo.upload_order,
                        analysis,
                    });
                }
                Err(detail) => {
                    tracing::warn!(
                        job_id = %job.id,
                        photo_id = %photo.id,
                        error = %detail,
                        "photo analysis failed, excluding from strategy"
                    );
                    metrics::counter!("pipeline_photo_analysis_failed_total").increment(1);
                    self.repo
                        .set_photo_status(photo.id, PhotoStatus::Failed)
                        .await?;
                }
            }
        }

        if analyzed.is_empty() {
            return Err(PipelineError::NoAnalyzablePhotos(job.listing_id));
        }

        let strategy = build_strategy(job.listing_id, &analyzed, self.config.hero_threshold);
        for plan in &strategy.assignments {
            self.repo.set_photo_tools(plan.photo_id, &plan.tools).await?;
        }

        tracing::info!(
            job_id = %job.id,
            hero = ?strategy.hero_photo_id,
            confidence = strategy.confidence,
            "strategy built"
        );

        self.checkpoints
            .save(
                job.id,
                &CheckpointStage::Processing {
                    strategy: strategy.clone(),
                    completed: BTreeSet::new(),
                },
            )
            .await?;

        Ok(strategy)
    }

    /// One photo's analysis with the fixed retry budget. Failures are
    /// absorbed into a detail string; the photo is excluded from the
    /// strategy, not the listing.
    async fn analyze_photo(&self, photo: &Photo) -> Result<PhotoAnalysis, String> {
        let url = match self
            .store
            .presign_get(&photo.raw_key, self.config.presign_expiry_secs)
            .await
        {
            Ok(url) => url,
            Err(e) => return Err(format!("presign failed: {e}")),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.vision.analyze(&url).await {
                Ok(analysis) => return Ok(analysis),
                Err(e) if e.is_transient() && attempt < self.config.retry_budget => {
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                    sleep(delay).await;
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    /// Processing stage. Photos run in strategy order; each photo's
    /// tools run in assignment order because later tools assume earlier
    /// corrections. The checkpoint is persisted after each photo, which
    /// is the resume granularity: a crash mid-photo reruns that photo
    /// from its first tool.
    async fn process_photos(
        &self,
        job: &PreparationJob,
        strategy: &Strategy,
        completed: &mut BTreeSet<Uuid>,
    ) -> Result<(), PipelineError> {
        let photos = self.repo.photos_for_listing(job.listing_id).await?;

        for plan in &strategy.assignments {
            if completed.contains(&plan.photo_id) {
                continue;
            }
            let Some(photo) = photos.iter().find(|p| p.id == plan.photo_id) else {
                tracing::warn!(job_id = %job.id, photo_id = %plan.photo_id, "photo vanished mid-job, skipping");
                completed.insert(plan.photo_id);
                continue;
            };

            self.repo
                .set_photo_status(photo.id, PhotoStatus::Processing)
                .await?;

            let mut source_key = photo.raw_key.clone();
            let mut produced = false;
            let mut failed_any = false;

            for (idx, tool) in plan.tools.iter().enumerate() {
                // Cancellation is checked once per (photo, tool), never
                // mid-invocation.
                if *self.cancel.borrow() {
                    return Err(PipelineError::Cancelled);
                }
                if idx > 0 && !self.config.tool_delay.is_zero() {
                    sleep(self.config.tool_delay).await;
                }

                let photo_url = self
                    .store
                    .presign_get(&source_key, self.config.presign_expiry_secs)
                    .await?;
                let ctx = PhotoContext {
                    photo_url,
                    sky_complexity: photo.analysis.as_ref().and_then(|a| a.sky_complexity),
                    room_type: photo.analysis.as_ref().map(|a| a.room_type),
                };
                let descriptor = route(*tool, &ctx);
                let result = self.run_tool(photo, &source_key, &descriptor).await;

                metrics::histogram!(
                    "pipeline_enhancement_duration_seconds",
                    "tool" => tool.to_string()
                )
                .record(result.duration.as_secs_f64());
                metrics::counter!(
                    "pipeline_enhancement_invocations_total",
                    "cost_tier" => result.cost_tier.to_string(),
                    "outcome" => if result.succeeded() { "success" } else { "failure" }
                )
                .increment(1);

                match result.output_key {
                    Some(key) => {
                        tracing::debug!(
                            job_id = %job.id,
                            photo_id = %photo.id,
                            tool = %tool,
                            duration_ms = result.duration.as_millis(),
                            "tool succeeded"
                        );
                        source_key = key;
                        produced = true;
                    }
                    None => {
                        tracing::warn!(
                            job_id = %job.id,
                            photo_id = %photo.id,
                            tool = %tool,
                            error = result.error.as_deref().unwrap_or("unknown"),
                            "tool failed permanently, continuing"
                        );
                        failed_any = true;
                    }
                }
            }

            // Outputs are durably written before the checkpoint ever
            // lists this photo as complete.
            if produced {
                self.repo.record_photo_output(photo.id, &source_key).await?;
            }
            let final_status = if failed_any {
                PhotoStatus::Failed
            } else {
                PhotoStatus::Completed
            };
            self.repo.set_photo_status(photo.id, final_status).await?;

            completed.insert(photo.id);
            self.checkpoints
                .save(
                    job.id,
                    &CheckpointStage::Processing {
                        strategy: strategy.clone(),
                        completed: completed.clone(),
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// One (photo, tool) invocation with the transient retry budget.
    /// Always returns a result; permanent failures are recorded, never
    /// raised.
    async fn run_tool(
        &self,
        photo: &Photo,
        source_key: &str,
        descriptor: &InvocationDescriptor,
    ) -> EnhancementResult {
        let executor = Executor::new(self.store, self.provider, self.config.timeout_margin);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match executor.execute(photo, source_key, descriptor).await {
                Ok(key) => {
                    return EnhancementResult {
                        photo_id: photo.id,
                        tool: descriptor.tool,
                        output_key: Some(key),
                        cost_tier: descriptor.cost_tier,
                        duration: started.elapsed(),
                        error: None,
                    }
                }
                Err(e) if e.is_transient() && attempt < self.config.retry_budget => {
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                    tracing::debug!(
                        photo_id = %photo.id,
                        tool = %descriptor.tool,
                        attempt,
                        error = %e,
                        "transient tool failure, backing off"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    return EnhancementResult {
                        photo_id: photo.id,
                        tool: descriptor.tool,
                        output_key: None,
                        cost_tier: descriptor.cost_tier,
                        duration: started.elapsed(),
                        error: Some(e.to_string()),
                    }
                }
            }
        }
    }

    /// Finalizing stage: fold per-photo outcomes into the listing's
    /// durable status, complete the job, and release the checkpoint.
    async fn finalize(
        &self,
        job: &PreparationJob,
        strategy: &Strategy,
        completed: &BTreeSet<Uuid>,
    ) -> Result<(), PipelineError> {
        self.checkpoints
            .save(
                job.id,
                &CheckpointStage::Finalizing {
                    strategy: strategy.clone(),
                    completed: completed.clone(),
                },
            )
            .await?;

        let photos = self.repo.photos_for_listing(job.listing_id).await?;
        let total = photos.len().max(1);
        let failed = photos
            .iter()
            .filter(|p| p.status == PhotoStatus::Failed)
            .count();
        let failure_ratio = failed as f64 / total as f64;

        let status = if failure_ratio > self.config.needs_review_threshold {
            PreparationStatus::NeedsReview
        } else {
            PreparationStatus::Prepared
        };

        self.repo
            .finalize_listing(
                job.listing_id,
                status,
                strategy.hero_photo_id,
                strategy.confidence,
            )
            .await?;
        self.repo
            .update_job_status(job.id, JobStatus::Completed)
            .await?;
        self.checkpoints.delete(job.id).await?;

        metrics::counter!("pipeline_jobs_completed_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            listing_id = %job.listing_id,
            status = %status,
            failure_ratio,
            "job finalized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::listing::Listing;
    use crate::models::photo::{
        ClutterLevel, LightingQuality, RoomType, SkyComplexity, SkyCondition,
    };
    use crate::models::strategy::ToolId;
    use crate::services::provider::ProviderError;
    use crate::services::router::InvocationDescriptor;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // ── In-memory fakes ──────────────────────────────────────────────

    #[derive(Default)]
    struct MemRepo {
        listings: Mutex<HashMap<Uuid, Listing>>,
        jobs: Mutex<HashMap<Uuid, PreparationJob>>,
        photos: Mutex<Vec<Photo>>,
    }

    impl MemRepo {
        fn insert_listing(&self) -> Uuid {
            let id = Uuid::new_v4();
            self.listings.lock().unwrap().insert(
                id,
                Listing {
                    id,
                    owner_id: Uuid::new_v4(),
                    preparation_status: PreparationStatus::Unprepared,
                    hero_photo_id: None,
                    confidence_score: None,
                    prepared_at: None,
                },
            );
            id
        }

        fn insert_job(&self, listing_id: Uuid) -> PrepareMessage {
            let job_id = Uuid::new_v4();
            let owner_id = Uuid::new_v4();
            self.jobs.lock().unwrap().insert(
                job_id,
                PreparationJob {
                    id: job_id,
                    listing_id,
                    owner_id,
                    status: JobStatus::Queued,
                    retry_count: 0,
                    error: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
            );
            PrepareMessage {
                job_id,
                listing_id,
                owner_id,
                priority: 0,
            }
        }

        fn insert_photo(&self, listing_id: Uuid, raw_key: &str, upload_order: i32) -> Uuid {
            let id = Uuid::new_v4();
            self.photos.lock().unwrap().push(Photo {
                id,
                listing_id,
                raw_key: raw_key.to_string(),
                enhanced_key: None,
                status: PhotoStatus::Pending,
                analysis: None,
                assigned_tools: None,
                upload_order,
            });
            id
        }

        fn listing(&self, id: Uuid) -> Listing {
            self.listings.lock().unwrap().get(&id).unwrap().clone()
        }

        fn job(&self, id: Uuid) -> PreparationJob {
            self.jobs.lock().unwrap().get(&id).unwrap().clone()
        }

        fn photo(&self, id: Uuid) -> Photo {
            self.photos
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.id == id)
                .unwrap()
                .clone()
        }
    }

    impl MetadataRepository for MemRepo {
        async fn set_listing_status(
            &self,
            listing_id: Uuid,
            status: PreparationStatus,
        ) -> Result<(), RepoError> {
            if let Some(listing) = self.listings.lock().unwrap().get_mut(&listing_id) {
                listing.preparation_status = status;
            }
            Ok(())
        }

        async fn finalize_listing(
            &self,
            listing_id: Uuid,
            status: PreparationStatus,
            hero_photo_id: Option<Uuid>,
            confidence_score: f64,
        ) -> Result<(), RepoError> {
            if let Some(listing) = self.listings.lock().unwrap().get_mut(&listing_id) {
                listing.preparation_status = status;
                listing.hero_photo_id = hero_photo_id;
                listing.confidence_score = Some(confidence_score);
                listing.prepared_at = Some(Utc::now());
            }
            Ok(())
        }

        async fn get_job(&self, job_id: Uuid) -> Result<Option<PreparationJob>, RepoError> {
            Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
        }

        async fn update_job_status(
            &self,
            job_id: Uuid,
            status: JobStatus,
        ) -> Result<(), RepoError> {
            if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
                // Same forward-only guard as the SQL layer.
                if !job.status.is_terminal() {
                    job.status = status;
                    job.updated_at = Utc::now();
                }
            }
            Ok(())
        }

        async fn photos_for_listing(&self, listing_id: Uuid) -> Result<Vec<Photo>, RepoError> {
            let mut photos: Vec<Photo> = self
                .photos
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.listing_id == listing_id)
                .cloned()
                .collect();
            photos.sort_by_key(|p| (p.upload_order, p.id));
            Ok(photos)
        }

        async fn save_photo_analysis(
            &self,
            photo_id: Uuid,
            analysis: &PhotoAnalysis,
        ) -> Result<(), RepoError> {
            if let Some(photo) = self
                .photos
                .lock()
                .unwrap()
                .iter_mut()
                .find(|p| p.id == photo_id)
            {
                photo.analysis = Some(analysis.clone());
            }
            Ok(())
        }

        async fn set_photo_tools(
            &self,
            photo_id: Uuid,
            tools: &[ToolId],
        ) -> Result<(), RepoError> {
            if let Some(photo) = self
                .photos
                .lock()
                .unwrap()
                .iter_mut()
                .find(|p| p.id == photo_id)
            {
                photo.assigned_tools = Some(tools.to_vec());
            }
            Ok(())
        }

        async fn set_photo_status(
            &self,
            photo_id: Uuid,
            status: PhotoStatus,
        ) -> Result<(), RepoError> {
            if let Some(photo) = self
                .photos
                .lock()
                .unwrap()
                .iter_mut()
                .find(|p| p.id == photo_id)
            {
                photo.status = status;
            }
            Ok(())
        }

        async fn record_photo_output(
            &self,
            photo_id: Uuid,
            enhanced_key: &str,
        ) -> Result<(), RepoError> {
            if let Some(photo) = self
                .photos
                .lock()
                .unwrap()
                .iter_mut()
                .find(|p| p.id == photo_id)
            {
                photo.enhanced_key = Some(enhanced_key.to_string());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemCheckpoints {
        inner: Mutex<HashMap<Uuid, CheckpointStage>>,
    }

    impl CheckpointStore for MemCheckpoints {
        async fn load(
            &self,
            job_id: Uuid,
        ) -> Result<Option<crate::models::checkpoint::Checkpoint>, CheckpointError> {
            Ok(self.inner.lock().unwrap().get(&job_id).cloned().map(|stage| {
                crate::models::checkpoint::Checkpoint {
                    job_id,
                    stage,
                    updated_at: Utc::now(),
                }
            }))
        }

        async fn save(
            &self,
            job_id: Uuid,
            stage: &CheckpointStage,
        ) -> Result<(), CheckpointError> {
            self.inner.lock().unwrap().insert(job_id, stage.clone());
            Ok(())
        }

        async fn delete(&self, job_id: Uuid) -> Result<(), CheckpointError> {
            self.inner.lock().unwrap().remove(&job_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl ImageStore for MemStore {
        async fn upload(
            &self,
            key: &str,
            data: &[u8],
            _content_type: &str,
        ) -> Result<(), StorageError> {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), data.to_vec());
            Ok(())
        }

        async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(key.to_string()))
        }

        async fn presign_get(&self, key: &str, _expiry_secs: u32) -> Result<String, StorageError> {
            Ok(format!("mem://{key}"))
        }
    }

    /// Scripted vision provider keyed by raw storage key.
    #[derive(Default)]
    struct FakeVision {
        analyses: HashMap<String, PhotoAnalysis>,
        calls: Mutex<Vec<String>>,
    }

    impl VisionProvider for FakeVision {
        async fn analyze(&self, photo_url: &str) -> Result<PhotoAnalysis, ProviderError> {
            self.calls.lock().unwrap().push(photo_url.to_string());
            let key = photo_url.trim_start_matches("mem://");
            self.analyses
                .get(key)
                .cloned()
                .ok_or(ProviderError::Rejected {
                    status: 404,
                    detail: "no analysis scripted".to_string(),
                })
        }
    }

    /// Scripted enhancement provider. Failures match on substrings of
    /// the descriptor's image URL.
    #[derive(Default)]
    struct FakeEnhancer {
        fail_substrings: Vec<String>,
        transient_failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<String>>,
    }

    impl EnhancementProvider for FakeEnhancer {
        async fn generate(
            &self,
            descriptor: &InvocationDescriptor,
        ) -> Result<Vec<u8>, ProviderError> {
            let url = descriptor.payload["image_url"].as_str().unwrap().to_string();
            self.calls.lock().unwrap().push(url.clone());

            let mut transients = self.transient_failures.lock().unwrap();
            for (substring, remaining) in transients.iter_mut() {
                if url.contains(substring.as_str()) && *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProviderError::Upstream {
                        status: 503,
                        detail: "scripted transient failure".to_string(),
                    });
                }
            }
            drop(transients);

            if self.fail_substrings.iter().any(|s| url.contains(s.as_str())) {
                return Err(ProviderError::Rejected {
                    status: 422,
                    detail: "scripted permanent failure".to_string(),
                });
            }
            Ok(b"enhanced-bytes".to_vec())
        }
    }

    // ── Analysis fixtures ────────────────────────────────────────────

    fn base_analysis() -> PhotoAnalysis {
        PhotoAnalysis {
            room_type: RoomType::LivingRoom,
            sky_condition: SkyCondition::NotVisible,
            sky_complexity: None,
            lighting: LightingQuality::Average,
            clutter: ClutterLevel::Low,
            sky_needs_replacement: false,
            lawn_needs_repair: false,
            window_exposure_issue: false,
            needs_hdr: false,
            vertical_alignment_issue: false,
            room_empty: false,
            hero_score: 0.5,
            completeness: 1.0,
        }
    }

    fn exterior_bad_sky() -> PhotoAnalysis {
        PhotoAnalysis {
            room_type: RoomType::Exterior,
            sky_condition: SkyCondition::Blown,
            sky_complexity: Some(SkyComplexity::Simple),
            sky_needs_replacement: true,
            hero_score: 0.9,
            ..base_analysis()
        }
    }

    fn cluttered_interior() -> PhotoAnalysis {
        PhotoAnalysis {
            clutter: ClutterLevel::High,
            hero_score: 0.3,
            ..base_analysis()
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            retry_base_delay: Duration::ZERO,
            tool_delay: Duration::ZERO,
            ..PipelineConfig::default()
        }
    }

    fn cancel_flag(value: bool) -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(value)
    }

    // ── Tests ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn full_run_prepares_listing_with_hero_and_strategy() {
        let repo = MemRepo::default();
        let listing_id = repo.insert_listing();
        let exterior = repo.insert_photo(listing_id, "raw/exterior.jpg", 0);
        let interior_a = repo.insert_photo(listing_id, "raw/interior-a.jpg", 1);
        let interior_b = repo.insert_photo(listing_id, "raw/interior-b.jpg", 2);
        let msg = repo.insert_job(listing_id);

        let mut vision = FakeVision::default();
        vision
            .analyses
            .insert("raw/exterior.jpg".to_string(), exterior_bad_sky());
        vision
            .analyses
            .insert("raw/interior-a.jpg".to_string(), cluttered_interior());
        vision
            .analyses
            .insert("raw/interior-b.jpg".to_string(), cluttered_interior());

        let checkpoints = MemCheckpoints::default();
        let store = MemStore::default();
        let enhancer = FakeEnhancer::default();
        let config = test_config();
        let (_tx, cancel) = cancel_flag(false);

        let orchestrator =
            Orchestrator::new(&repo, &checkpoints, &store, &vision, &enhancer, &config, cancel);
        orchestrator.run(&msg).await.expect("pipeline run");

        let listing = repo.listing(listing_id);
        assert_eq!(listing.preparation_status, PreparationStatus::Prepared);
        assert_eq!(listing.hero_photo_id, Some(exterior));
        assert!(listing.prepared_at.is_some());
        let expected_confidence =
            ((0.9 + 1.0) / 2.0 + (0.3 + 1.0) / 2.0 + (0.3 + 1.0) / 2.0) / 3.0;
        assert!((listing.confidence_score.unwrap() - expected_confidence).abs() < 1e-9);

        assert_eq!(repo.job(msg.job_id).status, JobStatus::Completed);
        assert!(checkpoints.inner.lock().unwrap().is_empty());

        assert_eq!(
            repo.photo(exterior).assigned_tools.unwrap(),
            vec![ToolId::SkyReplacement]
        );
        assert_eq!(
            repo.photo(interior_a).assigned_tools.unwrap(),
            vec![ToolId::Declutter]
        );

        // Every completed photo has a durably stored output.
        for photo_id in [exterior, interior_a, interior_b] {
            let photo = repo.photo(photo_id);
            assert_eq!(photo.status, PhotoStatus::Completed);
            let key = photo.enhanced_key.expect("enhanced key");
            assert!(store.objects.lock().unwrap().contains_key(&key));
        }
    }

    #[tokio::test]
    async fn all_analysis_failures_fail_with_no_analyzable_photos() {
        let repo = MemRepo::default();
        let listing_id = repo.insert_listing();
        for i in 0..3 {
            repo.insert_photo(listing_id, &format!("raw/{i}.jpg"), i);
        }
        let msg = repo.insert_job(listing_id);

        let vision = FakeVision::default(); // nothing scripted: all fail
        let checkpoints = MemCheckpoints::default();
        let store = MemStore::default();
        let enhancer = FakeEnhancer::default();
        let config = test_config();
        let (_tx, cancel) = cancel_flag(false);

        let orchestrator =
            Orchestrator::new(&repo, &checkpoints, &store, &vision, &enhancer, &config, cancel);
        let err = orchestrator.run(&msg).await.expect_err("should fail");

        assert!(matches!(err, PipelineError::NoAnalyzablePhotos(id) if id == listing_id));
        assert!(!err.is_retryable());
        // Nothing will ever resume this job: no strategy was persisted
        // and its checkpoint row is gone.
        assert!(checkpoints.inner.lock().unwrap().is_empty());
        assert!(enhancer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn quarter_failure_ratio_still_prepares_listing() {
        let repo = MemRepo::default();
        let listing_id = repo.insert_listing();
        let mut photo_ids = Vec::new();
        let mut vision = FakeVision::default();
        for i in 0..4 {
            let key = format!("raw/photo-{i}.jpg");
            photo_ids.push(repo.insert_photo(listing_id, &key, i));
            vision.analyses.insert(key, cluttered_interior());
        }
        let msg = repo.insert_job(listing_id);

        let enhancer = FakeEnhancer {
            fail_substrings: vec!["photo-0".to_string()],
            ..FakeEnhancer::default()
        };
        let checkpoints = MemCheckpoints::default();
        let store = MemStore::default();
        let config = test_config();
        let (_tx, cancel) = cancel_flag(false);

        let orchestrator =
            Orchestrator::new(&repo, &checkpoints, &store, &vision, &enhancer, &config, cancel);
        orchestrator.run(&msg).await.expect("pipeline run");

        // 1 of 4 failed: 25% < 50% threshold.
        assert_eq!(
            repo.listing(listing_id).preparation_status,
            PreparationStatus::Prepared
        );
        assert_eq!(repo.photo(photo_ids[0]).status, PhotoStatus::Failed);
        assert_eq!(repo.photo(photo_ids[0]).enhanced_key, None);
        for id in &photo_ids[1..] {
            assert_eq!(repo.photo(*id).status, PhotoStatus::Completed);
        }
    }

    #[tokio::test]
    async fn high_failure_ratio_flags_listing_for_review() {
        let repo = MemRepo::default();
        let listing_id = repo.insert_listing();
        let mut vision = FakeVision::default();
        for i in 0..4 {
            let key = format!("raw/photo-{i}.jpg");
            repo.insert_photo(listing_id, &key, i);
            vision.analyses.insert(key, cluttered_interior());
        }
        let msg = repo.insert_job(listing_id);

        let enhancer = FakeEnhancer {
            fail_substrings: vec![
                "photo-0".to_string(),
                "photo-1".to_string(),
                "photo-2".to_string(),
            ],
            ..FakeEnhancer::default()
        };
        let checkpoints = MemCheckpoints::default();
        let store = MemStore::default();
        let config = test_config();
        let (_tx, cancel) = cancel_flag(false);

        let orchestrator =
            Orchestrator::new(&repo, &checkpoints, &store, &vision, &enhancer, &config, cancel);
        orchestrator.run(&msg).await.expect("pipeline run");

        // 3 of 4 failed: 75% > 50% threshold.
        assert_eq!(
            repo.listing(listing_id).preparation_status,
            PreparationStatus::NeedsReview
        );
        // The job itself still completed.
        assert_eq!(repo.job(msg.job_id).status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_budget() {
        let repo = MemRepo::default();
        let listing_id = repo.insert_listing();
        let photo = repo.insert_photo(listing_id, "raw/flaky.jpg", 0);
        let msg = repo.insert_job(listing_id);

        let mut vision = FakeVision::default();
        vision
            .analyses
            .insert("raw/flaky.jpg".to_string(), cluttered_interior());

        let enhancer = FakeEnhancer {
            transient_failures: Mutex::new(HashMap::from([("flaky".to_string(), 2u32)])),
            ..FakeEnhancer::default()
        };
        let checkpoints = MemCheckpoints::default();
        let store = MemStore::default();
        let config = test_config();
        let (_tx, cancel) = cancel_flag(false);

        let orchestrator =
            Orchestrator::new(&repo, &checkpoints, &store, &vision, &enhancer, &config, cancel);
        orchestrator.run(&msg).await.expect("pipeline run");

        // Two 503s, then success on the third and final attempt.
        assert_eq!(enhancer.calls.lock().unwrap().len(), 3);
        assert_eq!(repo.photo(photo).status, PhotoStatus::Completed);
    }

    #[tokio::test]
    async fn resume_skips_completed_photos_and_reanalysis() {
        let repo = MemRepo::default();
        let listing_id = repo.insert_listing();
        let done = repo.insert_photo(listing_id, "raw/done.jpg", 0);
        let pending = repo.insert_photo(listing_id, "raw/pending.jpg", 1);
        let msg = repo.insert_job(listing_id);

        // State as a crashed worker would have left it: job processing,
        // first photo completed with a stored output, checkpoint naming
        // it in the completed-set.
        repo.update_job_status(msg.job_id, JobStatus::Processing)
            .await
            .unwrap();
        repo.save_photo_analysis(done, &cluttered_interior())
            .await
            .unwrap();
        repo.save_photo_analysis(pending, &cluttered_interior())
            .await
            .unwrap();
        let analyzed: Vec<AnalyzedPhoto> = vec![
            AnalyzedPhoto {
                photo_id: done,
                upload_order: 0,
                analysis: cluttered_interior(),
            },
            AnalyzedPhoto {
                photo_id: pending,
                upload_order: 1,
                analysis: cluttered_interior(),
            },
        ];
        let strategy = build_strategy(listing_id, &analyzed, 0.7);

        let store = MemStore::default();
        store
            .upload("enhanced/done.jpg", b"already-done", "image/jpeg")
            .await
            .unwrap();
        repo.record_photo_output(done, "enhanced/done.jpg")
            .await
            .unwrap();
        repo.set_photo_status(done, PhotoStatus::Completed)
            .await
            .unwrap();

        let checkpoints = MemCheckpoints::default();
        checkpoints
            .save(
                msg.job_id,
                &CheckpointStage::Processing {
                    strategy: strategy.clone(),
                    completed: BTreeSet::from([done]),
                },
            )
            .await
            .unwrap();

        let vision = FakeVision::default(); // would fail if consulted
        let enhancer = FakeEnhancer::default();
        let config = test_config();
        let (_tx, cancel) = cancel_flag(false);

        let orchestrator =
            Orchestrator::new(&repo, &checkpoints, &store, &vision, &enhancer, &config, cancel);
        orchestrator.run(&msg).await.expect("resumed run");

        // Analysis was not re-run and the completed photo not re-enhanced.
        assert!(vision.calls.lock().unwrap().is_empty());
        let calls = enhancer.calls.lock().unwrap().clone();
        assert!(calls.iter().all(|url| !url.contains("done")));
        assert!(calls.iter().any(|url| url.contains("pending")));

        // Final state matches an uncheckpointed end-to-end run.
        let listing = repo.listing(listing_id);
        assert_eq!(listing.preparation_status, PreparationStatus::Prepared);
        assert_eq!(repo.photo(pending).status, PhotoStatus::Completed);
        assert_eq!(repo.job(msg.job_id).status, JobStatus::Completed);
        assert!(checkpoints.inner.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn redelivered_terminal_job_is_a_no_op() {
        let repo = MemRepo::default();
        let listing_id = repo.insert_listing();
        repo.insert_photo(listing_id, "raw/a.jpg", 0);
        let msg = repo.insert_job(listing_id);
        repo.update_job_status(msg.job_id, JobStatus::Processing)
            .await
            .unwrap();
        repo.update_job_status(msg.job_id, JobStatus::Completed)
            .await
            .unwrap();

        let vision = FakeVision::default();
        let enhancer = FakeEnhancer::default();
        let checkpoints = MemCheckpoints::default();
        let store = MemStore::default();
        let config = test_config();
        let (_tx, cancel) = cancel_flag(false);

        let orchestrator =
            Orchestrator::new(&repo, &checkpoints, &store, &vision, &enhancer, &config, cancel);
        orchestrator.run(&msg).await.expect("no-op run");

        assert!(vision.calls.lock().unwrap().is_empty());
        assert!(enhancer.calls.lock().unwrap().is_empty());
        // Terminal status was not regressed.
        assert_eq!(repo.job(msg.job_id).status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancellation_preserves_checkpoint_for_redelivery() {
        let repo = MemRepo::default();
        let listing_id = repo.insert_listing();
        repo.insert_photo(listing_id, "raw/a.jpg", 0);
        let msg = repo.insert_job(listing_id);

        let mut vision = FakeVision::default();
        vision
            .analyses
            .insert("raw/a.jpg".to_string(), cluttered_interior());

        let enhancer = FakeEnhancer::default();
        let checkpoints = MemCheckpoints::default();
        let store = MemStore::default();
        let config = test_config();
        let (_tx, cancel) = cancel_flag(true); // cancelled before any tool runs

        let orchestrator =
            Orchestrator::new(&repo, &checkpoints, &store, &vision, &enhancer, &config, cancel);
        let err = orchestrator.run(&msg).await.expect_err("cancelled");

        assert!(matches!(err, PipelineError::Cancelled));
        assert!(err.is_retryable());
        assert!(enhancer.calls.lock().unwrap().is_empty());
        // Progress survives for the redelivered run.
        assert!(matches!(
            checkpoints.inner.lock().unwrap().get(&msg.job_id),
            Some(CheckpointStage::Processing { .. })
        ));
        assert_eq!(repo.job(msg.job_id).status, JobStatus::Processing);
    }

    #[test]
    fn unknown_tool_is_terminal_configuration_error() {
        let err = PipelineError::from(RepoError::UnknownTool("sepia-filter".to_string()));
        assert!(matches!(err, PipelineError::UnknownTool(ref name) if name == "sepia-filter"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn tools_chain_outputs_in_assigned_order() {
        let repo = MemRepo::default();
        let listing_id = repo.insert_listing();
        let photo = repo.insert_photo(listing_id, "raw/chain.jpg", 0);
        let msg = repo.insert_job(listing_id);

        // Blown window plus heavy clutter: window-masking then declutter.
        let mut vision = FakeVision::default();
        vision.analyses.insert(
            "raw/chain.jpg".to_string(),
            PhotoAnalysis {
                window_exposure_issue: true,
                ..cluttered_interior()
            },
        );

        let enhancer = FakeEnhancer::default();
        let checkpoints = MemCheckpoints::default();
        let store = MemStore::default();
        let config = test_config();
        let (_tx, cancel) = cancel_flag(false);

        let orchestrator =
            Orchestrator::new(&repo, &checkpoints, &store, &vision, &enhancer, &config, cancel);
        orchestrator.run(&msg).await.expect("pipeline run");

        let calls = enhancer.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        // First tool reads the raw photo; the second reads the first
        // tool's output.
        assert!(calls[0].contains("raw/chain.jpg"));
        assert!(calls[1].contains(&format!("enhanced/{photo}/window-masking/")));

        let final_key = repo.photo(photo).enhanced_key.unwrap();
        assert!(final_key.contains("/declutter/"));
    }
}
