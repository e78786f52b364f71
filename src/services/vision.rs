use reqwest::Client;
use serde::Deserialize;

use crate::models::photo::{
    ClutterLevel, LightingQuality, PhotoAnalysis, RoomType, SkyComplexity, SkyCondition,
};
use crate::services::provider::ProviderError;

/// Structured per-photo scene analysis. The provider performs no
/// retries itself; the retry policy lives in the orchestrator.
#[allow(async_fn_in_trait)]
pub trait VisionProvider: Send + Sync {
    async fn analyze(&self, photo_url: &str) -> Result<PhotoAnalysis, ProviderError>;
}

/// Client for the Cloudflare Workers AI LLaVA vision model.
pub struct WorkersAiVision {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Deserialize)]
struct LlavaResponse {
    result: LlavaResult,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

/// Raw analysis as the model returns it. Every field is optional so a
/// partially usable response still yields an analysis; missing fields
/// lower the completeness ratio.
#[derive(Deserialize)]
struct RawAnalysis {
    room_type: Option<RoomType>,
    sky_condition: Option<SkyCondition>,
    sky_complexity: Option<SkyComplexity>,
    lighting: Option<LightingQuality>,
    clutter: Option<ClutterLevel>,
    #[serde(default)]
    sky_needs_replacement: bool,
    #[serde(default)]
    lawn_needs_repair: bool,
    #[serde(default)]
    window_exposure_issue: bool,
    #[serde(default)]
    needs_hdr: bool,
    #[serde(default)]
    vertical_alignment_issue: bool,
    #[serde(default)]
    room_empty: bool,
    hero_score: Option<f64>,
}

const ANALYSIS_PROMPT: &str = concat!(
    "Analyze this real-estate listing photo and return ONLY valid JSON with these fields: ",
    "room_type (exterior, living_room, kitchen, bedroom, bathroom, dining_room, office, garage, other), ",
    "sky_condition (clear, partly_cloudy, overcast, blown, not_visible), ",
    "sky_complexity (simple, complex) when sky is visible, ",
    "lighting (poor, average, good), clutter (low, medium, high), ",
    "sky_needs_replacement, lawn_needs_repair, window_exposure_issue, needs_hdr, ",
    "vertical_alignment_issue, room_empty (booleans), ",
    "hero_score (0.0-1.0, how well this shot would lead the listing)."
);

impl WorkersAiVision {
    pub fn new(account_id: &str, api_token: &str) -> Self {
        Self {
            http: Client::new(),
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
        }
    }
}

impl VisionProvider for WorkersAiVision {
    async fn analyze(&self, photo_url: &str) -> Result<PhotoAnalysis, ProviderError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/@cf/llava-hf/llava-1.5-7b-hf",
            self.account_id
        );

        let request_body = serde_json::json!({
            "image_url": photo_url,
            "prompt": ANALYSIS_PROMPT,
            "max_tokens": 512
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(ProviderError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, detail));
        }

        let llava: LlavaResponse = response.json().await.map_err(ProviderError::Http)?;
        let raw: RawAnalysis =
            serde_json::from_str(&llava.result.description).map_err(ProviderError::Parse)?;

        Ok(finish_analysis(raw))
    }
}

/// Fill defaults for absent fields and compute the completeness ratio
/// over the five scored fields.
fn finish_analysis(raw: RawAnalysis) -> PhotoAnalysis {
    let scored = [
        raw.room_type.is_some(),
        raw.sky_condition.is_some(),
        raw.lighting.is_some(),
        raw.clutter.is_some(),
        raw.hero_score.is_some(),
    ];
    let completeness = scored.iter().filter(|present| **present).count() as f64 / 5.0;

    PhotoAnalysis {
        room_type: raw.room_type.unwrap_or(RoomType::Other),
        sky_condition: raw.sky_condition.unwrap_or(SkyCondition::NotVisible),
        sky_complexity: raw.sky_complexity,
        lighting: raw.lighting.unwrap_or(LightingQuality::Average),
        clutter: raw.clutter.unwrap_or(ClutterLevel::Medium),
        sky_needs_replacement: raw.sky_needs_replacement,
        lawn_needs_repair: raw.lawn_needs_repair,
        window_exposure_issue: raw.window_exposure_issue,
        needs_hdr: raw.needs_hdr,
        vertical_alignment_issue: raw.vertical_alignment_issue,
        room_empty: raw.room_empty,
        hero_score: raw.hero_score.unwrap_or(0.0).clamp(0.0, 1.0),
        completeness,
    }
}
