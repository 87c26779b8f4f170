//! Seam to the biometric feature extractor.
//!
//! Face detection, landmark regression and embedding inference are provided by
//! an external model runtime. Implementations are blocking and may be slow;
//! callers run them off the async executor.

use image::DynamicImage;

use crate::types::{BoundingBox, Embedding, LandmarkSet};

pub trait FeatureExtractor: Send + Sync {
    /// All faces found in the image, most confident first.
    fn detect_faces(&self, image: &DynamicImage) -> Vec<BoundingBox>;

    /// Embedding of the first detected face, or `None` when no face is found
    /// or the image cannot be processed.
    fn extract_embedding(&self, image: &DynamicImage) -> Option<Embedding>;

    /// Eye landmarks of the first detected face.
    fn extract_landmarks(&self, image: &DynamicImage) -> Option<LandmarkSet>;

    /// Distance between two embeddings; 0 means identical.
    fn embedding_distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.euclidean_distance(b)
    }
}
