use serde::{Deserialize, Serialize};

/// A 2-D image coordinate in pixels.
pub type Point = (f32, f32);

/// Bounding box of a detected face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector (128-dimensional for the default extractor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Infinite when the lengths differ or either embedding is empty, so a
    /// malformed embedding never matches anything.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() || self.values.is_empty() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Eye contours for one detected face.
///
/// Each eye uses the canonical 6-point ordering: p1 and p4 are the corners,
/// p2/p3 the upper lid, p5/p6 the lower lid. Extractors may return more
/// points; only the first six are used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    pub left_eye: Vec<Point>,
    pub right_eye: Vec<Point>,
}

/// All enrolled embeddings for one identity, in enrollment order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub face_id: String,
    pub embeddings: Vec<Embedding>,
}

impl IdentityRecord {
    pub fn new(face_id: impl Into<String>) -> Self {
        Self {
            face_id: face_id.into(),
            embeddings: Vec::new(),
        }
    }

    /// Append a sample. Existing samples are never modified.
    pub fn push(&mut self, embedding: Embedding) {
        self.embeddings.push(embedding);
    }
}
