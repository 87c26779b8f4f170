//! Nearest-identity search over enrolled embeddings.

use crate::types::{Embedding, IdentityRecord};

/// Best-matching identity for a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch {
    pub face_id: String,
    /// `1 − distance`. Not clamped: a score outside [0, 1] still carries
    /// calibration signal.
    pub score: f32,
    pub distance: f32,
}

/// Find the enrolled identity closest to `probe`.
///
/// Each identity is represented by its best-fitting sample (minimum distance
/// over all its embeddings). The global minimum wins; on a tie the identity
/// that comes first in `gallery` is kept, so a gallery iterated in a stable
/// order gives deterministic results.
///
/// Returns `None` for an empty gallery or when the best score falls below
/// `effective_threshold`.
pub fn best_match<'a, G, D>(
    probe: &Embedding,
    gallery: G,
    effective_threshold: f32,
    distance: D,
) -> Option<IdentityMatch>
where
    G: IntoIterator<Item = &'a IdentityRecord>,
    D: Fn(&Embedding, &Embedding) -> f32,
{
    let mut best: Option<(&str, f32)> = None;

    // Every identity and sample is visited; no early exit.
    for record in gallery {
        let nearest = record
            .embeddings
            .iter()
            .map(|e| distance(probe, e))
            .filter(|d| d.is_finite())
            .fold(f32::INFINITY, f32::min);
        if !nearest.is_finite() {
            continue;
        }
        if best.map_or(true, |(_, d)| nearest < d) {
            best = Some((record.face_id.as_str(), nearest));
        }
    }

    let (face_id, distance) = best?;
    let score = 1.0 - distance;
    if score >= effective_threshold {
        Some(IdentityMatch {
            face_id: face_id.to_string(),
            score,
            distance,
        })
    } else {
        tracing::debug!(
            best = face_id,
            score,
            effective_threshold,
            "match: best candidate below threshold"
        );
        None
    }
}
