use listing_prep::{
    config::AppConfig,
    db::{
        self,
        checkpoint::{CheckpointStore, PgCheckpointStore},
        queries,
        repo::PgRepository,
    },
    models::listing::PreparationStatus,
    services::{
        executor::WorkersAiEnhancer,
        orchestrator::{Orchestrator, PipelineConfig, PipelineError},
        queue::{JobQueue, PrepareMessage},
        storage::R2ImageStore,
        vision::WorkersAiVision,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 1000; // 1 second

/// Everything one worker iteration needs. Built once at startup.
struct WorkerContext {
    db: PgPool,
    repo: PgRepository,
    checkpoints: PgCheckpointStore,
    store: R2ImageStore,
    vision: WorkersAiVision,
    enhancer: WorkersAiEnhancer,
    queue: JobQueue,
    pipeline: PipelineConfig,
    nack_delay: Duration,
    max_deliveries: i32,
    cancel: watch::Receiver<bool>,
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting listing preparation worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Expose worker metrics on the default Prometheus scrape listener
    PrometheusBuilder::new()
        .install()
        .expect("Failed to install Prometheus metrics exporter");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let store = R2ImageStore::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    let vision = WorkersAiVision::new(&config.cf_account_id, &config.cf_api_token);
    let enhancer = WorkersAiEnhancer::new(&config.cf_account_id, &config.cf_api_token);

    // Graceful shutdown: flip the cancellation flag on Ctrl-C; the
    // orchestrator observes it between tool invocations and the job is
    // redelivered to resume from its checkpoint.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, finishing current tool invocation");
            let _ = cancel_tx.send(true);
        }
    });

    let ctx = WorkerContext {
        repo: PgRepository::new(db_pool.clone()),
        checkpoints: PgCheckpointStore::new(db_pool.clone()),
        db: db_pool,
        store,
        vision,
        enhancer,
        queue,
        pipeline: config.pipeline(),
        nack_delay: Duration::from_millis(config.nack_delay_ms),
        max_deliveries: config.max_deliveries,
        cancel: cancel_rx,
    };

    tracing::info!("Worker ready, starting job processing loop");

    // Main processing loop
    loop {
        if *ctx.cancel.borrow() {
            tracing::info!("Worker shutting down");
            break;
        }
        match process_next_job(&ctx).await {
            Ok(true) => {
                // Job processed, continue immediately
                tracing::debug!("Job processed, checking for next job");
            }
            Ok(false) => {
                // No job available, sleep before next poll
                tracing::trace!("No jobs available, sleeping");
                if let Ok(depth) = ctx.queue.queue_depth().await {
                    metrics::gauge!("pipeline_queue_depth").set(depth as f64);
                }
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing job, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Process the next job from the queue.
/// Returns Ok(true) if a job was processed, Ok(false) if no job available.
async fn process_next_job(ctx: &WorkerContext) -> Result<bool, Box<dyn std::error::Error>> {
    let msg = match ctx.queue.dequeue().await? {
        Some(m) => m,
        None => return Ok(false), // No job available
    };

    tracing::info!(
        job_id = %msg.job_id,
        listing_id = %msg.listing_id,
        "Processing preparation job"
    );

    let orchestrator = Orchestrator::new(
        &ctx.repo,
        &ctx.checkpoints,
        &ctx.store,
        &ctx.vision,
        &ctx.enhancer,
        &ctx.pipeline,
        ctx.cancel.clone(),
    );

    match orchestrator.run(&msg).await {
        Ok(()) => {
            ctx.queue.complete(&msg).await?;
            tracing::info!(job_id = %msg.job_id, "Job completed");
            Ok(true)
        }
        // Terminal: no retry will change the outcome.
        Err(e) if !e.is_retryable() => {
            tracing::error!(job_id = %msg.job_id, error = %e, "Job failed permanently");
            fail_job(ctx, &msg, &e.to_string()).await?;
            Ok(true)
        }
        Err(PipelineError::Cancelled) => {
            tracing::warn!(job_id = %msg.job_id, "Job interrupted by shutdown, scheduling redelivery");
            ctx.queue.nack(&msg, ctx.nack_delay).await?;
            Ok(true)
        }
        // Infrastructure failure: the checkpoint holds the progress, so
        // redelivery resumes instead of restarting.
        Err(e) => {
            tracing::error!(job_id = %msg.job_id, error = %e, "Job processing failed");

            let retry_count = queries::increment_retry_count(&ctx.db, msg.job_id).await?;
            if retry_count >= ctx.max_deliveries {
                fail_job(
                    ctx,
                    &msg,
                    &format!("Processing failed after {} deliveries: {}", retry_count, e),
                )
                .await?;
                tracing::warn!(
                    job_id = %msg.job_id,
                    retry_count,
                    "Job failed after max deliveries"
                );
            } else {
                ctx.queue.nack(&msg, ctx.nack_delay).await?;
                tracing::info!(
                    job_id = %msg.job_id,
                    retry_count,
                    "Job redelivery scheduled"
                );
            }
            Ok(true)
        }
    }
}

/// Terminal failure path: fail the job, flag the listing, drop the
/// checkpoint (nothing will ever resume from it) and ack the message so
/// it is never redelivered.
async fn fail_job(
    ctx: &WorkerContext,
    msg: &PrepareMessage,
    error: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    queries::fail_job(&ctx.db, msg.job_id, error).await?;
    queries::set_listing_status(&ctx.db, msg.listing_id, PreparationStatus::Failed).await?;
    ctx.checkpoints.delete(msg.job_id).await?;
    ctx.queue.complete(msg).await?;
    metrics::counter!("pipeline_jobs_failed_total").increment(1);
    Ok(())
}
