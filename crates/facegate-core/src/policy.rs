//! Decision thresholds for every check in the verification pipeline.
//!
//! All tunables live here so they can be overridden from a policy file and
//! compared side by side without touching control flow. Each default carries
//! the reasoning behind its value.

use serde::Deserialize;

// ── Liveness ──────────────────────────────────────────────────────────────────

/// Fewer frames than this cannot prove a blink.
pub const LIVENESS_MIN_FRAMES: usize = 3;
/// Frames past this count are not analysed.
pub const LIVENESS_MAX_FRAMES: usize = 6;
/// Embedding distance from the first frame beyond which a later frame is
/// treated as a different subject. Looser than the match threshold because
/// burst frames carry motion blur and exposure drift.
pub const LIVENESS_MAX_IDENTITY_DISTANCE: f32 = 0.42;
/// Open eyes typically measure 0.20–0.30 EAR across cameras and glasses.
pub const EAR_OPEN: f32 = 0.21;
/// Closed or closing eyes drop below roughly 0.18–0.19 EAR.
pub const EAR_CLOSED: f32 = 0.19;
/// Minimum open/closed gap, so sensor noise around one threshold is not a blink.
pub const EAR_MIN_DELTA: f32 = 0.05;

// ── Matching ──────────────────────────────────────────────────────────────────

/// Nominal similarity threshold supplied to the match engine.
pub const MATCH_NOMINAL_THRESHOLD: f32 = 0.5;
/// Tolerance subtracted from the nominal threshold to absorb lighting and
/// pose variation. Kept well below the gap between distinct identities.
pub const MATCH_TOLERANCE: f32 = 0.1;
/// Score the claimed owner must reach for an ACCEPT.
pub const ACCEPT_THRESHOLD: f32 = 0.5;

/// Complete set of tunables. Every section defaults independently, so a
/// policy file only needs to name the values it changes.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub liveness: LivenessPolicy,
    pub spoof: SpoofPolicy,
    pub matching: MatchPolicy,
    pub precedence: Precedence,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LivenessPolicy {
    pub min_frames: usize,
    pub max_frames: usize,
    pub max_identity_distance: f32,
    pub ear_open: f32,
    pub ear_closed: f32,
    pub min_ear_delta: f32,
    /// Require at least one adjacent frame pair crossing between the open and
    /// closed thresholds, not just an open frame and a closed frame somewhere.
    pub require_transition: bool,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            min_frames: LIVENESS_MIN_FRAMES,
            max_frames: LIVENESS_MAX_FRAMES,
            max_identity_distance: LIVENESS_MAX_IDENTITY_DISTANCE,
            ear_open: EAR_OPEN,
            ear_closed: EAR_CLOSED,
            min_ear_delta: EAR_MIN_DELTA,
            require_transition: true,
        }
    }
}

/// Screen/photo heuristic tunables.
///
/// Tiers are `(level_1, level_2)` pairs: crossing the first scores 1 point,
/// crossing the second scores 2.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpoofPolicy {
    /// Longest side after downscaling; larger frames are resized first.
    pub max_dimension: u32,
    pub blur_sigma: f32,
    pub canny_low: f32,
    pub canny_high: f32,
    /// A phone held up to the camera covers a large share of the frame.
    pub min_area_fraction: f32,
    /// Portrait and landscape phone/monitor proportions.
    pub min_aspect: f32,
    pub max_aspect: f32,
    /// Polygon approximation tolerance as a fraction of contour perimeter.
    pub polygon_epsilon: f32,
    /// `(min_mean, max_std)` for one and two points of uniformity.
    pub uniform_tier_1: (f32, f32),
    pub uniform_tier_2: (f32, f32),
    /// Width of the bezel band as a fraction of the shorter side.
    pub border_band_fraction: f32,
    pub border_band_min_px: u32,
    pub border_density_tiers: (f32, f32),
    pub spectrum_size: usize,
    /// Half-width of the low-frequency square removed from the spectrum.
    pub spectrum_mask_radius: usize,
    pub spectrum_peak_sigma: f32,
    pub spectrum_candidates: usize,
    pub spectrum_peak_tiers: (usize, usize),
    pub area_ratio_tiers: (f32, f32),
    /// Stricter total when a face is visible, so genuine faces in front of
    /// reflective backgrounds are not flagged.
    pub threshold_with_face: u32,
    pub threshold_without_face: u32,
}

impl Default for SpoofPolicy {
    fn default() -> Self {
        Self {
            max_dimension: 600,
            blur_sigma: 1.1,
            canny_low: 50.0,
            canny_high: 150.0,
            min_area_fraction: 0.15,
            min_aspect: 0.4,
            max_aspect: 2.5,
            polygon_epsilon: 0.02,
            uniform_tier_1: (160.0, 35.0),
            uniform_tier_2: (185.0, 30.0),
            border_band_fraction: 0.06,
            border_band_min_px: 2,
            border_density_tiers: (0.06, 0.10),
            spectrum_size: 256,
            spectrum_mask_radius: 18,
            spectrum_peak_sigma: 6.0,
            spectrum_candidates: 10,
            spectrum_peak_tiers: (2, 5),
            area_ratio_tiers: (0.25, 0.40),
            threshold_with_face: 5,
            threshold_without_face: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    pub nominal_threshold: f32,
    pub tolerance: f32,
    pub accept_threshold: f32,
}

impl MatchPolicy {
    /// Threshold the match engine actually applies.
    pub fn effective_threshold(&self) -> f32 {
        (self.nominal_threshold - self.tolerance).max(0.0)
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            nominal_threshold: MATCH_NOMINAL_THRESHOLD,
            tolerance: MATCH_TOLERANCE,
            accept_threshold: ACCEPT_THRESHOLD,
        }
    }
}

/// Ordering between the liveness proof and the screen heuristic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Precedence {
    /// When true, a passed liveness check skips the screen heuristic.
    /// Security-relevant: a blinking face replayed on a screen is then only
    /// caught by the identity checks.
    pub liveness_supersedes_spoof: bool,
}

impl Default for Precedence {
    fn default() -> Self {
        Self {
            liveness_supersedes_spoof: true,
        }
    }
}
