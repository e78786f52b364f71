use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Closed set of enhancement tool identifiers. Parsing an unknown
/// identifier at a storage boundary surfaces as an `UnknownTool` error
/// rather than being silently skipped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ToolId {
    AutoEnhance,
    SkyReplacement,
    LawnRepair,
    ObjectRemoval,
    Declutter,
    WindowMasking,
    HdrMerging,
    Upscaling,
    VirtualStaging,
    TwilightConversion,
}

/// Ordered tool assignment for a single photo. Order matters: later
/// tools assume earlier corrections are already applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoPlan {
    pub photo_id: Uuid,
    pub tools: Vec<ToolId>,
}

/// Listing-level enhancement plan derived from the analysis batch.
/// Never persisted on its own; it travels inside the job checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub listing_id: Uuid,
    pub assignments: Vec<PhotoPlan>,
    pub hero_photo_id: Option<Uuid>,
    pub twilight_photo_id: Option<Uuid>,
    pub confidence: f64,
}

impl Strategy {
    pub fn tools_for(&self, photo_id: Uuid) -> Option<&[ToolId]> {
        self.assignments
            .iter()
            .find(|plan| plan.photo_id == photo_id)
            .map(|plan| plan.tools.as_slice())
    }
}
