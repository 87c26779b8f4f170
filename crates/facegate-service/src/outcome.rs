use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use thiserror::Error;

/// Frames beyond this are dropped when a burst is built.
pub const MAX_BURST_FRAMES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Accept,
    Reject,
    Suspicious,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Accept => "ACCEPT",
            Decision::Reject => "REJECT",
            Decision::Suspicious => "SUSPICIOUS",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl FromStr for Decision {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPT" => Ok(Decision::Accept),
            "REJECT" => Ok(Decision::Reject),
            "SUSPICIOUS" => Ok(Decision::Suspicious),
            _ => Err(ParseError {
                kind: "decision",
                value: s.to_string(),
            }),
        }
    }
}

/// Why an attempt ended the way it did. Each reason maps to exactly one
/// decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    NoLivenessConfirmation,
    PossibleScreenOrPhoto,
    InvalidCode,
    CredentialExpired,
    InactiveUser,
    CredentialLookupFailed,
    FaceNotRecognized,
    FaceCredentialMismatch,
    LowMatchConfidence,
    AccessGranted,
}

impl Reason {
    const ALL: [Reason; 10] = [
        Reason::NoLivenessConfirmation,
        Reason::PossibleScreenOrPhoto,
        Reason::InvalidCode,
        Reason::CredentialExpired,
        Reason::InactiveUser,
        Reason::CredentialLookupFailed,
        Reason::FaceNotRecognized,
        Reason::FaceCredentialMismatch,
        Reason::LowMatchConfidence,
        Reason::AccessGranted,
    ];

    pub fn message(self) -> &'static str {
        match self {
            Reason::NoLivenessConfirmation => "no liveness confirmation",
            Reason::PossibleScreenOrPhoto => "possible screen/photo",
            Reason::InvalidCode => "invalid code",
            Reason::CredentialExpired => "credential expired",
            Reason::InactiveUser => "inactive user",
            Reason::CredentialLookupFailed => "credential lookup failed",
            Reason::FaceNotRecognized => "face not recognized",
            Reason::FaceCredentialMismatch => "face/credential mismatch",
            Reason::LowMatchConfidence => "low match confidence",
            Reason::AccessGranted => "access granted",
        }
    }

    pub fn decision(self) -> Decision {
        match self {
            Reason::AccessGranted => Decision::Accept,
            Reason::NoLivenessConfirmation
            | Reason::PossibleScreenOrPhoto
            | Reason::FaceCredentialMismatch => Decision::Suspicious,
            Reason::InvalidCode
            | Reason::CredentialExpired
            | Reason::InactiveUser
            | Reason::CredentialLookupFailed
            | Reason::FaceNotRecognized
            | Reason::LowMatchConfidence => Decision::Reject,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl FromStr for Reason {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reason::ALL
            .into_iter()
            .find(|r| r.message() == s)
            .ok_or_else(|| ParseError {
                kind: "reason",
                value: s.to_string(),
            })
    }
}

/// Final result of one verification attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub decision: Decision,
    pub reason: Reason,
    /// Match score, when a match was computed. Not clamped.
    pub score: Option<f32>,
    /// Identity the face matched, when one did.
    pub identity: Option<String>,
}

impl Outcome {
    pub fn new(reason: Reason) -> Self {
        Self {
            decision: reason.decision(),
            reason,
            score: None,
            identity: None,
        }
    }

    pub fn with_match(reason: Reason, identity: String, score: f32) -> Self {
        Self {
            score: Some(score),
            identity: Some(identity),
            ..Self::new(reason)
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstError {
    #[error("capture burst has no frames")]
    Empty,
}

/// Frames captured for one attempt. The first frame is the primary frame.
#[derive(Clone)]
pub struct CaptureBurst {
    frames: Arc<[DynamicImage]>,
    captured_at: DateTime<Utc>,
}

impl CaptureBurst {
    /// Burst stamped with the current time.
    pub fn new(frames: Vec<DynamicImage>) -> Result<Self, BurstError> {
        Self::captured_at(frames, Utc::now())
    }

    /// Keeps at most [`MAX_BURST_FRAMES`] frames.
    pub fn captured_at(
        mut frames: Vec<DynamicImage>,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, BurstError> {
        if frames.is_empty() {
            return Err(BurstError::Empty);
        }
        if frames.len() > MAX_BURST_FRAMES {
            tracing::debug!(
                received = frames.len(),
                kept = MAX_BURST_FRAMES,
                "dropping extra burst frames"
            );
            frames.truncate(MAX_BURST_FRAMES);
        }
        Ok(Self {
            frames: frames.into(),
            captured_at,
        })
    }

    pub fn primary(&self) -> &DynamicImage {
        &self.frames[0]
    }

    pub fn frames(&self) -> &[DynamicImage] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Always false: a burst holds at least one frame.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl fmt::Debug for CaptureBurst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureBurst")
            .field("frames", &self.frames.len())
            .field("captured_at", &self.captured_at)
            .finish()
    }
}
