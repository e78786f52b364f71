use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use listing_prep::app_state::AppState;
use listing_prep::config::AppConfig;
use listing_prep::db;
use listing_prep::routes;
use listing_prep::services::queue::JobQueue;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing listing-prep server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "pipeline_jobs_submitted_total",
        "Total preparation jobs accepted by the API"
    );
    metrics::describe_counter!(
        "pipeline_jobs_completed_total",
        "Total preparation jobs finalized"
    );
    metrics::describe_counter!(
        "pipeline_jobs_failed_total",
        "Total preparation jobs that failed permanently"
    );
    metrics::describe_counter!(
        "pipeline_photos_analyzed_total",
        "Total photos successfully analyzed"
    );
    metrics::describe_counter!(
        "pipeline_photo_analysis_failed_total",
        "Total photos whose analysis failed"
    );
    metrics::describe_counter!(
        "pipeline_enhancement_invocations_total",
        "Total tool invocations, labelled by cost tier and outcome"
    );
    metrics::describe_histogram!(
        "pipeline_analysis_duration_seconds",
        "Time spent analyzing one photo, retries included"
    );
    metrics::describe_histogram!(
        "pipeline_enhancement_duration_seconds",
        "Time spent per tool invocation, labelled by tool"
    );
    metrics::describe_gauge!(
        "pipeline_queue_depth",
        "Current number of pending jobs in the queue"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize Redis job queue
    tracing::info!("Connecting to Redis job queue");
    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    // Create shared application state
    let state = AppState::new(db_pool, queue);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/listings/{listing_id}/prepare",
            post(routes::prepare::prepare_listing),
        )
        .route(
            "/api/v1/listings/{listing_id}",
            get(routes::prepare::get_listing_status),
        )
        .route("/api/v1/jobs/{job_id}", get(routes::prepare::get_job_status))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MB limit, JSON only

    tracing::info!("Starting listing-prep on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
