use uuid::Uuid;

use crate::models::photo::{ClutterLevel, LightingQuality, PhotoAnalysis, SkyCondition};
use crate::models::strategy::{PhotoPlan, Strategy, ToolId};

/// Minimum hero score for a twilight conversion candidate.
const TWILIGHT_THRESHOLD: f64 = 0.75;

/// One successfully analyzed photo, as input to the strategy builder.
#[derive(Debug, Clone)]
pub struct AnalyzedPhoto {
    pub photo_id: Uuid,
    pub upload_order: i32,
    pub analysis: PhotoAnalysis,
}

/// Turn a batch of per-photo analyses into the listing's enhancement
/// plan. Pure and deterministic: identical inputs always yield identical
/// assignments, hero selection and confidence.
pub fn build_strategy(listing_id: Uuid, photos: &[AnalyzedPhoto], hero_threshold: f64) -> Strategy {
    let mut ordered: Vec<&AnalyzedPhoto> = photos.iter().collect();
    ordered.sort_by_key(|p| (p.upload_order, p.photo_id));

    let twilight_photo_id = pick_twilight_candidate(&ordered);

    let mut assignments = Vec::with_capacity(ordered.len());
    let mut hero_photo_id = None;
    let mut best_hero_score = hero_threshold;

    for photo in &ordered {
        let mut tools = assign_tools(&photo.analysis);
        if Some(photo.photo_id) == twilight_photo_id {
            tools.push(ToolId::TwilightConversion);
        }
        assignments.push(PhotoPlan {
            photo_id: photo.photo_id,
            tools,
        });

        // Ties favor the earliest upload order (strict comparison).
        if photo.analysis.room_type.is_exterior() && photo.analysis.hero_score > best_hero_score {
            best_hero_score = photo.analysis.hero_score;
            hero_photo_id = Some(photo.photo_id);
        }
    }

    let confidence = if ordered.is_empty() {
        0.0
    } else {
        ordered
            .iter()
            .map(|p| (p.analysis.hero_score + p.analysis.completeness) / 2.0)
            .sum::<f64>()
            / ordered.len() as f64
    };

    Strategy {
        listing_id,
        assignments,
        hero_photo_id,
        twilight_photo_id,
        confidence,
    }
}

/// Deterministic rule table mapping analysis defects to tools. Order is
/// the execution order: geometry and exposure fixes run before the
/// generative edits that assume a corrected base image.
fn assign_tools(analysis: &PhotoAnalysis) -> Vec<ToolId> {
    let mut tools = Vec::new();
    if analysis.vertical_alignment_issue {
        tools.push(ToolId::AutoEnhance);
    }
    if analysis.needs_hdr {
        tools.push(ToolId::HdrMerging);
    }
    if analysis.window_exposure_issue {
        tools.push(ToolId::WindowMasking);
    }
    if analysis.sky_needs_replacement && analysis.room_type.is_exterior() {
        tools.push(ToolId::SkyReplacement);
    }
    if analysis.lawn_needs_repair && analysis.room_type.is_exterior() {
        tools.push(ToolId::LawnRepair);
    }
    if analysis.clutter == ClutterLevel::High {
        tools.push(ToolId::Declutter);
    }
    if analysis.room_empty && !analysis.room_type.is_exterior() {
        tools.push(ToolId::VirtualStaging);
    }
    tools
}

/// An exterior shot with a clean, well-lit sky is a good base for a
/// dusk conversion. The earliest qualifying photo wins ties.
fn pick_twilight_candidate(ordered: &[&AnalyzedPhoto]) -> Option<Uuid> {
    let mut best: Option<(&AnalyzedPhoto, f64)> = None;
    for photo in ordered {
        let suitability = twilight_suitability(&photo.analysis);
        if suitability < TWILIGHT_THRESHOLD {
            continue;
        }
        match best {
            Some((_, score)) if suitability <= score => {}
            _ => best = Some((photo, suitability)),
        }
    }
    best.map(|(photo, _)| photo.photo_id)
}

fn twilight_suitability(analysis: &PhotoAnalysis) -> f64 {
    let sky_ok = matches!(
        analysis.sky_condition,
        SkyCondition::Clear | SkyCondition::PartlyCloudy
    );
    if analysis.room_type.is_exterior()
        && sky_ok
        && !analysis.sky_needs_replacement
        && analysis.lighting == LightingQuality::Good
    {
        analysis.hero_score
    } else {
        0.0
    }
}
