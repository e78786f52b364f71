use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::strategy::ToolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    Exterior,
    LivingRoom,
    Kitchen,
    Bedroom,
    Bathroom,
    DiningRoom,
    Office,
    Garage,
    Other,
}

impl RoomType {
    pub fn is_exterior(&self) -> bool {
        matches!(self, RoomType::Exterior)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SkyCondition {
    Clear,
    PartlyCloudy,
    Overcast,
    Blown,
    NotVisible,
}

/// How hard the visible sky is to mask cleanly (tree lines, reflections,
/// power lines). Drives model selection for sky replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SkyComplexity {
    Simple,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LightingQuality {
    Poor,
    Average,
    Good,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClutterLevel {
    Low,
    Medium,
    High,
}

/// Structured per-photo analysis produced by the vision provider.
/// Immutable once written for a job run; a new run overwrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoAnalysis {
    pub room_type: RoomType,
    pub sky_condition: SkyCondition,
    pub sky_complexity: Option<SkyComplexity>,
    pub lighting: LightingQuality,
    pub clutter: ClutterLevel,
    pub sky_needs_replacement: bool,
    pub lawn_needs_repair: bool,
    pub window_exposure_issue: bool,
    pub needs_hdr: bool,
    pub vertical_alignment_issue: bool,
    pub room_empty: bool,
    /// How well this shot would work as the listing's lead photo (0-1).
    pub hero_score: f64,
    /// Ratio of analysis fields the provider actually populated (0-1).
    pub completeness: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PhotoStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// An uploaded property photo. Created at upload time; the pipeline
/// mutates status, analysis, tool assignment and the enhanced key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Photo {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub raw_key: String,
    pub enhanced_key: Option<String>,
    pub status: PhotoStatus,
    pub analysis: Option<PhotoAnalysis>,
    pub assigned_tools: Option<Vec<ToolId>>,
    pub upload_order: i32,
}
