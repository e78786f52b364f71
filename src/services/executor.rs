use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use uuid::Uuid;

use crate::models::photo::Photo;
use crate::models::strategy::ToolId;
use crate::services::provider::ProviderError;
use crate::services::router::{CostTier, ExecutionMode, InvocationDescriptor};
use crate::services::storage::{ImageStore, StorageError};

/// Outcome of one (photo, tool) invocation, kept in aggregate only:
/// photo status, the cost log and the checkpoint's completed-set.
#[derive(Debug, Clone)]
pub struct EnhancementResult {
    pub photo_id: Uuid,
    pub tool: ToolId,
    pub output_key: Option<String>,
    pub cost_tier: CostTier,
    pub duration: Duration,
    pub error: Option<String>,
}

impl EnhancementResult {
    pub fn succeeded(&self) -> bool {
        self.output_key.is_some()
    }
}

/// Executes one routed invocation and returns the resulting image
/// bytes. Implementations fetch any provider-side result URLs so the
/// executor only ever sees bytes.
#[allow(async_fn_in_trait)]
pub trait EnhancementProvider: Send + Sync {
    async fn generate(&self, descriptor: &InvocationDescriptor) -> Result<Vec<u8>, ProviderError>;
}

/// Client for Cloudflare Workers AI image generation models.
pub struct WorkersAiEnhancer {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    result: GenerateResult,
}

#[derive(Deserialize)]
struct GenerateResult {
    images: Vec<String>,
}

impl WorkersAiEnhancer {
    pub fn new(account_id: &str, api_token: &str) -> Self {
        Self {
            http: Client::new(),
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
        }
    }
}

impl EnhancementProvider for WorkersAiEnhancer {
    async fn generate(&self, descriptor: &InvocationDescriptor) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, descriptor.model
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&descriptor.payload)
            .send()
            .await
            .map_err(ProviderError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, detail));
        }

        let generated: GenerateResponse = response.json().await.map_err(ProviderError::Http)?;
        let image_url = generated.images_first()?;

        let image = self
            .http
            .get(image_url)
            .send()
            .await
            .map_err(ProviderError::Http)?;
        let status = image.status();
        if !status.is_success() {
            return Err(ProviderError::from_status(status, "result fetch".to_string()));
        }
        Ok(image.bytes().await.map_err(ProviderError::Http)?.to_vec())
    }
}

impl GenerateResponse {
    fn images_first(&self) -> Result<&str, ProviderError> {
        self.result
            .images
            .first()
            .map(String::as_str)
            .ok_or(ProviderError::Rejected {
                status: 200,
                detail: "provider returned no result images".to_string(),
            })
    }
}

/// Runs one invocation against the provider (or locally) and persists
/// the output. A failure here is always scoped to one (photo, tool)
/// pair; it never aborts the enclosing processing stage.
pub struct Executor<'a, S, P> {
    store: &'a S,
    provider: &'a P,
    timeout_margin: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("failed to persist enhancement output: {0}")]
    Storage(#[from] StorageError),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutorError::Provider(e) => e.is_transient(),
            ExecutorError::Storage(_) => false,
        }
    }
}

impl<'a, S: ImageStore, P: EnhancementProvider> Executor<'a, S, P> {
    pub fn new(store: &'a S, provider: &'a P, timeout_margin: Duration) -> Self {
        Self {
            store,
            provider,
            timeout_margin,
        }
    }

    /// Run one invocation. `source_key` is the current head of the
    /// photo's enhancement chain (raw key, or the previous tool's
    /// output). Returns the storage key of the durably written output.
    pub async fn execute(
        &self,
        photo: &Photo,
        source_key: &str,
        descriptor: &InvocationDescriptor,
    ) -> Result<String, ExecutorError> {
        match descriptor.execution {
            ExecutionMode::Local => self.run_local(photo, source_key, descriptor).await,
            ExecutionMode::Remote => self.run_remote(photo, descriptor).await,
        }
    }

    async fn run_local(
        &self,
        photo: &Photo,
        source_key: &str,
        descriptor: &InvocationDescriptor,
    ) -> Result<String, ExecutorError> {
        let source = self.store.download(source_key).await?;

        // Degraded mode: if the bytes will not decode, re-register the
        // source as output. Local tools always produce an output; only
        // a storage failure is an error here.
        let output = match image::load_from_memory(&source) {
            Ok(img) => {
                let adjusted = img.adjust_contrast(8.0).brighten(6);
                let mut buf = Cursor::new(Vec::new());
                match adjusted.write_to(&mut buf, image::ImageFormat::Jpeg) {
                    Ok(()) => buf.into_inner(),
                    Err(e) => {
                        tracing::warn!(photo_id = %photo.id, error = %e, "local encode failed, passing source through");
                        source
                    }
                }
            }
            Err(e) => {
                tracing::warn!(photo_id = %photo.id, error = %e, "local decode failed, passing source through");
                source
            }
        };

        let key = output_key(photo.id, descriptor.tool);
        self.store.upload(&key, &output, "image/jpeg").await?;
        Ok(key)
    }

    async fn run_remote(
        &self,
        photo: &Photo,
        descriptor: &InvocationDescriptor,
    ) -> Result<String, ExecutorError> {
        let budget = descriptor.estimated_latency + self.timeout_margin;
        let bytes = match tokio::time::timeout(budget, self.provider.generate(descriptor)).await {
            Ok(result) => result?,
            Err(_) => return Err(ExecutorError::Provider(ProviderError::Timeout)),
        };

        let key = output_key(photo.id, descriptor.tool);
        self.store.upload(&key, &bytes, "image/jpeg").await?;
        Ok(key)
    }
}

/// Output keys are namespaced by photo, tool and timestamp so retries
/// and reruns never collide.
fn output_key(photo_id: Uuid, tool: ToolId) -> String {
    format!(
        "enhanced/{}/{}/{}.jpg",
        photo_id,
        tool,
        Utc::now().timestamp_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_keys_are_namespaced_per_photo_and_tool() {
        let photo_id = Uuid::new_v4();
        let key = output_key(photo_id, ToolId::SkyReplacement);
        assert!(key.starts_with(&format!("enhanced/{photo_id}/sky-replacement/")));
        assert!(key.ends_with(".jpg"));
    }
}
