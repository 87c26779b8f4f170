//! facegate-core: the decision primitives behind badge + face access control.
//!
//! Blink liveness over a capture burst, a screen/photo heuristic for single
//! frames, and nearest-identity matching against enrolled embeddings. Feature
//! extraction itself is delegated to a [`FeatureExtractor`] implementation.

pub mod extractor;
pub mod liveness;
pub mod matcher;
pub mod policy;
pub mod spectrum;
pub mod spoof;
pub mod types;

pub use extractor::FeatureExtractor;
pub use liveness::{FrameDefect, FrameFeatures, LivenessFailure, LivenessResult};
pub use matcher::{best_match, IdentityMatch};
pub use policy::Policy;
pub use spoof::{SpoofReport, SpoofScores};
pub use types::{BoundingBox, Embedding, IdentityRecord, LandmarkSet, Point};
