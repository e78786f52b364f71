use serde::Deserialize;
use std::time::Duration;

use crate::services::orchestrator::PipelineConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for job queue
    pub redis_url: String,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Maximum simultaneous vision analysis calls per job
    #[serde(default = "default_analysis_concurrency")]
    pub analysis_concurrency: usize,

    /// Attempts per provider call before treating a failure as permanent
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Base delay in milliseconds for exponential retry backoff
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Delay in milliseconds between tool invocations on the same photo
    #[serde(default = "default_tool_delay_ms")]
    pub tool_delay_ms: u64,

    /// Failed-photo ratio above which a listing needs manual review
    #[serde(default = "default_needs_review_threshold")]
    pub needs_review_threshold: f64,

    /// Minimum hero score for an exterior photo to lead the listing
    #[serde(default = "default_hero_threshold")]
    pub hero_threshold: f64,

    /// Seconds added to a tool's estimated latency for its call timeout
    #[serde(default = "default_timeout_margin_secs")]
    pub timeout_margin_secs: u64,

    /// Validity in seconds of presigned URLs handed to providers
    #[serde(default = "default_presign_expiry_secs")]
    pub presign_expiry_secs: u32,

    /// Redelivery delay in milliseconds after a retryable job failure
    #[serde(default = "default_nack_delay_ms")]
    pub nack_delay_ms: u64,

    /// Deliveries per job before it is failed permanently
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: i32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_analysis_concurrency() -> usize {
    20
}

fn default_retry_budget() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_tool_delay_ms() -> u64 {
    500
}

fn default_needs_review_threshold() -> f64 {
    0.5
}

fn default_hero_threshold() -> f64 {
    0.7
}

fn default_timeout_margin_secs() -> u64 {
    30
}

fn default_presign_expiry_secs() -> u32 {
    3600
}

fn default_nack_delay_ms() -> u64 {
    30_000
}

fn default_max_deliveries() -> i32 {
    3
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Pipeline tunables for the orchestrator.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            analysis_concurrency: self.analysis_concurrency,
            retry_budget: self.retry_budget,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            tool_delay: Duration::from_millis(self.tool_delay_ms),
            needs_review_threshold: self.needs_review_threshold,
            hero_threshold: self.hero_threshold,
            timeout_margin: Duration::from_secs(self.timeout_margin_secs),
            presign_expiry_secs: self.presign_expiry_secs,
        }
    }
}
