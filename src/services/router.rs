use serde_json::{json, Value};
use std::time::Duration;
use strum::{Display, EnumString};

use crate::models::photo::{RoomType, SkyComplexity};
use crate::models::strategy::ToolId;

/// Cost tier used for cost analytics, not billing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, serde::Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Free,
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Local,
    Remote,
}

/// Minimal photo context the router needs to pick a model.
#[derive(Debug, Clone)]
pub struct PhotoContext {
    pub photo_url: String,
    pub sky_complexity: Option<SkyComplexity>,
    pub room_type: Option<RoomType>,
}

/// Concrete provider invocation selected for one (tool, photo) pair.
/// The router performs no I/O; it only builds this descriptor.
#[derive(Debug, Clone)]
pub struct InvocationDescriptor {
    pub tool: ToolId,
    pub model: &'static str,
    pub payload: Value,
    pub cost_tier: CostTier,
    pub estimated_latency: Duration,
    pub execution: ExecutionMode,
}

const INPAINTING_MODEL: &str = "@cf/runwayml/stable-diffusion-v1-5-inpainting";
const IMG2IMG_MODEL: &str = "@cf/runwayml/stable-diffusion-v1-5-img2img";
const SDXL_MODEL: &str = "@cf/stabilityai/stable-diffusion-xl-base-1.0";
const GENERATIVE_MODEL: &str = "@cf/black-forest-labs/flux-1-schnell";
const UPSCALE_MODEL: &str = "@cf/upscaler/real-esrgan-4x";
const LOCAL_MODEL: &str = "local/auto-enhance";

/// Map a tool and photo context to a provider invocation. Total over
/// the closed `ToolId` set; unknown identifiers are rejected at the
/// string-parsing boundary before they reach the router.
pub fn route(tool: ToolId, ctx: &PhotoContext) -> InvocationDescriptor {
    match tool {
        ToolId::AutoEnhance => InvocationDescriptor {
            tool,
            model: LOCAL_MODEL,
            payload: json!({ "image_url": ctx.photo_url }),
            cost_tier: CostTier::Free,
            estimated_latency: Duration::from_secs(1),
            execution: ExecutionMode::Local,
        },
        ToolId::SkyReplacement => {
            // Complicated sky boundaries (tree lines, reflections) need
            // the higher-fidelity model.
            if ctx.sky_complexity == Some(SkyComplexity::Complex) {
                InvocationDescriptor {
                    tool,
                    model: SDXL_MODEL,
                    payload: json!({
                        "image_url": ctx.photo_url,
                        "prompt": "replace the sky with a vivid clear blue sky, natural light, photorealistic",
                        "strength": 0.65,
                    }),
                    cost_tier: CostTier::High,
                    estimated_latency: Duration::from_secs(45),
                    execution: ExecutionMode::Remote,
                }
            } else {
                InvocationDescriptor {
                    tool,
                    model: INPAINTING_MODEL,
                    payload: json!({
                        "image_url": ctx.photo_url,
                        "prompt": "clear blue sky with soft clouds",
                        "mask": "sky",
                    }),
                    cost_tier: CostTier::Low,
                    estimated_latency: Duration::from_secs(15),
                    execution: ExecutionMode::Remote,
                }
            }
        }
        ToolId::LawnRepair => inpainting(tool, ctx, "lush healthy green lawn, even grass"),
        ToolId::ObjectRemoval => inpainting(tool, ctx, "remove marked objects, clean background"),
        ToolId::Declutter => inpainting(
            tool,
            ctx,
            "tidy room with personal items and clutter removed, clean surfaces",
        ),
        ToolId::WindowMasking => inpainting(
            tool,
            ctx,
            "balanced window exposure showing the outside view, no blown highlights",
        ),
        ToolId::HdrMerging => InvocationDescriptor {
            tool,
            model: IMG2IMG_MODEL,
            payload: json!({
                "image_url": ctx.photo_url,
                "prompt": "balanced exposure, recovered shadows and highlights, natural HDR look",
                "strength": 0.35,
            }),
            cost_tier: CostTier::Low,
            estimated_latency: Duration::from_secs(15),
            execution: ExecutionMode::Remote,
        },
        ToolId::Upscaling => InvocationDescriptor {
            tool,
            model: UPSCALE_MODEL,
            payload: json!({ "image_url": ctx.photo_url, "scale": 4 }),
            cost_tier: CostTier::Low,
            estimated_latency: Duration::from_secs(20),
            execution: ExecutionMode::Remote,
        },
        ToolId::VirtualStaging => InvocationDescriptor {
            tool,
            model: GENERATIVE_MODEL,
            payload: json!({
                "image_url": ctx.photo_url,
                "prompt": staging_prompt(ctx.room_type),
            }),
            cost_tier: CostTier::High,
            estimated_latency: Duration::from_secs(60),
            execution: ExecutionMode::Remote,
        },
        ToolId::TwilightConversion => InvocationDescriptor {
            tool,
            model: GENERATIVE_MODEL,
            payload: json!({
                "image_url": ctx.photo_url,
                "prompt": "convert to dusk twilight shot, warm interior lights on, deep blue sky",
            }),
            cost_tier: CostTier::High,
            estimated_latency: Duration::from_secs(60),
            execution: ExecutionMode::Remote,
        },
    }
}

fn inpainting(tool: ToolId, ctx: &PhotoContext, prompt: &str) -> InvocationDescriptor {
    InvocationDescriptor {
        tool,
        model: INPAINTING_MODEL,
        payload: json!({ "image_url": ctx.photo_url, "prompt": prompt }),
        cost_tier: CostTier::Low,
        estimated_latency: Duration::from_secs(20),
        execution: ExecutionMode::Remote,
    }
}

fn staging_prompt(room_type: Option<RoomType>) -> String {
    let room = match room_type {
        Some(RoomType::Bedroom) => "a cozy furnished bedroom",
        Some(RoomType::LivingRoom) => "a bright furnished living room",
        Some(RoomType::Kitchen) => "a staged modern kitchen",
        Some(RoomType::DiningRoom) => "a furnished dining room",
        Some(RoomType::Office) => "a furnished home office",
        _ => "a tastefully furnished room",
    };
    format!("virtually stage this empty room as {room}, photorealistic, natural light")
}
