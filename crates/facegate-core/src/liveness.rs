//! Active liveness detection via eye-blink analysis over a short burst.
//!
//! A printed photograph cannot blink: its Eye Aspect Ratio (EAR) stays
//! constant across frames. A live subject asked to look at the camera blinks
//! within a handful of frames, producing a clear open → closed (or closed →
//! open) transition in the EAR sequence.
//!
//! The check also requires every frame to show the same person as the first
//! one, so a burst cannot be stitched together from a live face and a
//! different, replayed face.
//!
//! Per-frame extraction ([`extract_frame`]) is independent of the cross-frame
//! reduction ([`evaluate`]), so frames can be extracted concurrently and
//! reduced once all of them are in.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, static screens, bursts that swap the
//!   subject mid-capture.
//! - **Does not block:** Video replay of the badge owner blinking (caught
//!   later only if the replayed face does not match the owner).

use image::DynamicImage;

use crate::extractor::FeatureExtractor;
use crate::policy::LivenessPolicy;
use crate::types::{Embedding, LandmarkSet, Point};

/// Eye corner distance below which the eye geometry is considered degenerate.
const MIN_EYE_WIDTH: f32 = 1e-6;

/// Landmarks needed per eye for the EAR formula.
const EYE_POINTS: usize = 6;

/// Features of one burst frame that passed extraction.
#[derive(Debug, Clone)]
pub struct FrameFeatures {
    pub embedding: Embedding,
    /// Mean EAR of both eyes.
    pub ear: f32,
}

/// Why a single frame could not contribute to the liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDefect {
    NoFace,
    NoLandmarks,
    DegenerateEye,
}

/// Why a burst was not considered live.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LivenessFailure {
    TooFewFrames { frames: usize },
    Frame { index: usize, defect: FrameDefect },
    IdentityChanged { index: usize, distance: f32 },
    NoBlink,
}

/// Result of a blink liveness check.
#[derive(Debug, Clone)]
pub struct LivenessResult {
    /// Whether the burst passed (true = likely live).
    pub is_live: bool,
    /// Number of frames that were examined.
    pub frames_analysed: usize,
    /// Lowest and highest mean EAR seen, when every frame yielded one.
    pub ear_range: Option<(f32, f32)>,
    /// Largest embedding distance between the first frame and any later frame.
    pub max_identity_distance: f32,
    pub failure: Option<LivenessFailure>,
}

impl LivenessResult {
    fn failed(frames_analysed: usize, failure: LivenessFailure) -> Self {
        Self {
            is_live: false,
            frames_analysed,
            ear_range: None,
            max_identity_distance: 0.0,
            failure: Some(failure),
        }
    }
}

/// Eye Aspect Ratio of one eye: `(‖p2−p6‖ + ‖p3−p5‖) / (2·‖p1−p4‖)`.
///
/// Returns `None` when fewer than six points are given or the eye corners
/// coincide.
pub fn eye_aspect_ratio(eye: &[Point]) -> Option<f32> {
    if eye.len() < EYE_POINTS {
        return None;
    }
    let (p1, p2, p3, p4, p5, p6) = (eye[0], eye[1], eye[2], eye[3], eye[4], eye[5]);

    let width = distance(p1, p4);
    if !width.is_finite() || width <= MIN_EYE_WIDTH {
        return None;
    }

    let ear = (distance(p2, p6) + distance(p3, p5)) / (2.0 * width);
    ear.is_finite().then_some(ear)
}

/// Mean EAR of the left and right eye.
pub fn mean_eye_aspect_ratio(landmarks: &LandmarkSet) -> Option<f32> {
    let left = eye_aspect_ratio(&landmarks.left_eye)?;
    let right = eye_aspect_ratio(&landmarks.right_eye)?;
    Some((left + right) / 2.0)
}

/// Extract embedding and EAR for one frame.
pub fn extract_frame(
    extractor: &dyn FeatureExtractor,
    image: &DynamicImage,
) -> Result<FrameFeatures, FrameDefect> {
    let embedding = extractor
        .extract_embedding(image)
        .filter(|e| !e.is_empty() && e.is_finite())
        .ok_or(FrameDefect::NoFace)?;
    let landmarks = extractor
        .extract_landmarks(image)
        .ok_or(FrameDefect::NoLandmarks)?;
    let ear = mean_eye_aspect_ratio(&landmarks).ok_or(FrameDefect::DegenerateEye)?;
    Ok(FrameFeatures { embedding, ear })
}

/// Reduce per-frame extraction results into a liveness decision.
///
/// Frames beyond `policy.max_frames` are ignored. `distance` compares two
/// embeddings (normally [`FeatureExtractor::embedding_distance`]).
pub fn evaluate<D>(
    frames: &[Result<FrameFeatures, FrameDefect>],
    distance: D,
    policy: &LivenessPolicy,
) -> LivenessResult
where
    D: Fn(&Embedding, &Embedding) -> f32,
{
    if frames.len() < policy.min_frames {
        return LivenessResult::failed(
            0,
            LivenessFailure::TooFewFrames {
                frames: frames.len(),
            },
        );
    }

    let frames = &frames[..frames.len().min(policy.max_frames)];
    let analysed = frames.len();
    if analysed == 0 {
        return LivenessResult::failed(0, LivenessFailure::TooFewFrames { frames: 0 });
    }

    let mut features = Vec::with_capacity(analysed);
    for (index, frame) in frames.iter().enumerate() {
        match frame {
            Ok(f) => features.push(f),
            Err(defect) => {
                return LivenessResult::failed(
                    analysed,
                    LivenessFailure::Frame {
                        index,
                        defect: *defect,
                    },
                )
            }
        }
    }

    // Same subject throughout: compare every later frame with the first.
    let base = &features[0].embedding;
    let mut max_identity_distance = 0.0f32;
    for (index, f) in features.iter().enumerate().skip(1) {
        let d = distance(base, &f.embedding);
        if !d.is_finite() || d > policy.max_identity_distance {
            let mut result =
                LivenessResult::failed(analysed, LivenessFailure::IdentityChanged { index, distance: d });
            result.max_identity_distance = d;
            return result;
        }
        max_identity_distance = max_identity_distance.max(d);
    }

    let ears: Vec<f32> = features.iter().map(|f| f.ear).collect();
    let ear_min = ears.iter().copied().fold(f32::INFINITY, f32::min);
    let ear_max = ears.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let blinked = blink_evidence(&ears, policy);

    tracing::debug!(
        frames = analysed,
        ear_min,
        ear_max,
        max_identity_distance,
        blinked,
        "liveness: burst evaluated"
    );

    LivenessResult {
        is_live: blinked,
        frames_analysed: analysed,
        ear_range: Some((ear_min, ear_max)),
        max_identity_distance,
        failure: (!blinked).then_some(LivenessFailure::NoBlink),
    }
}

/// Whether an EAR sequence contains a blink.
///
/// Requires an open frame, a closed frame, a sufficient gap between them and,
/// unless disabled by policy, an adjacent open/closed crossing.
pub fn blink_evidence(ears: &[f32], policy: &LivenessPolicy) -> bool {
    if ears.is_empty() {
        return false;
    }
    let ear_min = ears.iter().copied().fold(f32::INFINITY, f32::min);
    let ear_max = ears.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let has_open = ear_max >= policy.ear_open;
    let has_closed = ear_min <= policy.ear_closed;
    let enough_delta = ear_max - ear_min >= policy.min_ear_delta;

    let transition = !policy.require_transition
        || ears.windows(2).any(|pair| {
            let (prev, curr) = (pair[0], pair[1]);
            (prev >= policy.ear_open && curr <= policy.ear_closed)
                || (prev <= policy.ear_closed && curr >= policy.ear_open)
        });

    has_open && has_closed && enough_delta && transition
}

/// Run the full check sequentially over a burst.
pub fn check_burst(
    extractor: &dyn FeatureExtractor,
    frames: &[DynamicImage],
    policy: &LivenessPolicy,
) -> LivenessResult {
    if frames.len() < policy.min_frames {
        return LivenessResult::failed(
            0,
            LivenessFailure::TooFewFrames {
                frames: frames.len(),
            },
        );
    }
    let extracted: Vec<_> = frames
        .iter()
        .take(policy.max_frames)
        .map(|frame| extract_frame(extractor, frame))
        .collect();
    evaluate(
        &extracted,
        |a, b| extractor.embedding_distance(a, b),
        policy,
    )
}

fn distance(a: Point, b: Point) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}
