use std::sync::Arc;
use std::time::Duration;

use facegate_core::liveness::{self, FrameDefect};
use facegate_core::{
    best_match, spoof, Embedding, FeatureExtractor, IdentityMatch, LivenessResult, Policy,
    SpoofReport, SpoofScores,
};
use image::DynamicImage;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditError, AuditSink};
use crate::credentials::{is_well_formed_code, CredentialStore, MAX_CODE_LEN};
use crate::outcome::{CaptureBurst, Decision, Outcome, Reason};
use crate::store::{EnrollmentStore, StoreError};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("verification deadline passed before a decision was reached")]
    DeadlineExceeded,
    #[error("audit write failed: {0}")]
    Audit(#[from] AuditError),
    #[error("audit task was aborted")]
    AuditInterrupted,
    #[error("enrollment store error: {0}")]
    Store(#[from] StoreError),
    #[error("feature extraction task failed")]
    ExtractionPanicked,
}

/// A decided and recorded attempt.
#[derive(Debug, Clone)]
pub struct Verification {
    pub attempt_id: Uuid,
    /// Id returned by the audit sink.
    pub record_id: i64,
    pub outcome: Outcome,
}

/// Badge + face verification.
///
/// Decision order: liveness, screen heuristic, credential, match, identity.
/// Every decided attempt is written to the audit sink exactly once before
/// the caller sees it.
pub struct Verifier {
    extractor: Arc<dyn FeatureExtractor>,
    enrollments: Arc<EnrollmentStore>,
    credentials: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditSink>,
    policy: Arc<Policy>,
    verify_timeout: Duration,
}

impl Verifier {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        enrollments: Arc<EnrollmentStore>,
        credentials: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditSink>,
        policy: Policy,
    ) -> Self {
        Self {
            extractor,
            enrollments,
            credentials,
            audit,
            policy: Arc::new(policy),
            verify_timeout: Duration::from_secs(10),
        }
    }

    /// Deadline applied by [`verify`](Self::verify).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn enrollments(&self) -> &Arc<EnrollmentStore> {
        &self.enrollments
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Verify with the configured timeout.
    pub async fn verify(
        &self,
        code: &str,
        burst: &CaptureBurst,
    ) -> Result<Verification, VerifyError> {
        self.verify_until(code, burst, Instant::now() + self.verify_timeout)
            .await
    }

    /// Verify, giving up if no decision exists by `deadline`.
    ///
    /// A missed deadline records nothing. Once a decision exists the audit
    /// write runs to completion even if this future is dropped; an audit
    /// failure is returned as an error and the attempt must be treated as
    /// denied.
    pub async fn verify_until(
        &self,
        code: &str,
        burst: &CaptureBurst,
        deadline: Instant,
    ) -> Result<Verification, VerifyError> {
        let attempt_id = Uuid::new_v4();

        let assessment = tokio::time::timeout_at(deadline, self.decide(code, burst))
            .await
            .map_err(|_| {
                tracing::warn!(%attempt_id, frames = burst.len(), "verification deadline exceeded");
                VerifyError::DeadlineExceeded
            })?;

        let outcome = assessment.outcome;
        let entry = AuditEntry {
            attempt_id,
            captured_at: burst.timestamp(),
            claimed_code: code.chars().take(MAX_CODE_LEN).collect(),
            frame_count: burst.len(),
            decision: outcome.decision,
            reason: outcome.reason,
            score: outcome.score,
            matched_identity: outcome.identity.clone(),
            owner_identity: assessment.owner,
            checks: serde_json::to_value(&assessment.checks).unwrap_or_default(),
        };

        let audit = self.audit.clone();
        let record_id = tokio::spawn(async move { audit.record(&entry).await })
            .await
            .map_err(|_| VerifyError::AuditInterrupted)?
            .map_err(|e| {
                tracing::error!(%attempt_id, error = %e, "audit write failed; attempt denied");
                VerifyError::from(e)
            })?;

        match outcome.decision {
            Decision::Suspicious => tracing::warn!(
                %attempt_id,
                record_id,
                reason = %outcome.reason,
                score = ?outcome.score,
                identity = ?outcome.identity,
                "verification suspicious"
            ),
            _ => tracing::info!(
                %attempt_id,
                record_id,
                decision = %outcome.decision,
                reason = %outcome.reason,
                score = ?outcome.score,
                identity = ?outcome.identity,
                "verification decided"
            ),
        }

        Ok(Verification {
            attempt_id,
            record_id,
            outcome,
        })
    }

    /// Enroll one image for `face_id`.
    ///
    /// Returns `Ok(false)` when the image looks like a screen or photo or no
    /// face is found; `Ok(true)` once the sample is stored.
    pub async fn enroll(
        &self,
        face_id: &str,
        label: &str,
        image: DynamicImage,
    ) -> Result<bool, VerifyError> {
        let extractor = self.extractor.clone();
        let policy = self.policy.clone();

        let embedding = tokio::task::spawn_blocking(move || {
            let report = spoof::check_image(extractor.as_ref(), &image, &policy.spoof);
            if report.suspected {
                return Err(report);
            }
            Ok(extractor.extract_embedding(&image))
        })
        .await
        .map_err(|_| VerifyError::ExtractionPanicked)?;

        let embedding = match embedding {
            Ok(Some(embedding)) => embedding,
            Ok(None) => {
                tracing::info!(face_id, label, "enrollment rejected: no face");
                return Ok(false);
            }
            Err(report) => {
                tracing::warn!(
                    face_id,
                    label,
                    total = report.scores.total(),
                    threshold = report.threshold,
                    "enrollment rejected: possible screen/photo"
                );
                return Ok(false);
            }
        };

        let sample_id = self.enrollments.append(face_id, label, embedding).await?;
        tracing::info!(face_id, label, %sample_id, "face enrolled");
        Ok(true)
    }

    async fn decide(&self, code: &str, burst: &CaptureBurst) -> Assessment {
        let mut checks = Checks::default();

        // Liveness
        let mut liveness_passed = false;
        if burst.len() >= self.policy.liveness.min_frames {
            if let Some(result) = self.run_liveness(burst).await {
                checks.liveness = Some(LivenessSummary::from(&result));
                if !result.is_live {
                    tracing::debug!(failure = ?result.failure, "liveness failed");
                    return Assessment::new(Outcome::new(Reason::NoLivenessConfirmation), checks);
                }
                liveness_passed = true;
            }
        }

        // Screen / photo heuristic
        if !liveness_passed || !self.policy.precedence.liveness_supersedes_spoof {
            if let Some(report) = self.run_spoof(burst).await {
                let suspected = report.suspected;
                checks.spoof = Some(SpoofSummary::from(&report));
                if suspected {
                    return Assessment::new(Outcome::new(Reason::PossibleScreenOrPhoto), checks);
                }
            }
        }

        // Credential
        if !is_well_formed_code(code) {
            return Assessment::new(Outcome::new(Reason::InvalidCode), checks);
        }
        let credential = match self.credentials.lookup(code).await {
            Ok(Some(credential)) => credential,
            Ok(None) => return Assessment::new(Outcome::new(Reason::InvalidCode), checks),
            Err(e) => {
                tracing::error!(error = %e, "credential lookup failed");
                return Assessment::new(Outcome::new(Reason::CredentialLookupFailed), checks);
            }
        };
        if credential.is_expired(burst.timestamp().date_naive()) {
            return Assessment::new(Outcome::new(Reason::CredentialExpired), checks);
        }
        let Some(owner) = credential.active_owner().map(str::to_string) else {
            return Assessment::new(Outcome::new(Reason::InactiveUser), checks);
        };

        // Match against every enrolled identity, not just the owner
        let found = self.run_match(burst).await;
        let mut assessment = Assessment::new(Outcome::new(Reason::FaceNotRecognized), checks);
        assessment.owner = Some(owner.clone());
        let Some(found) = found else {
            return assessment;
        };

        let reason = if found.face_id != owner {
            tracing::warn!(
                matched = %found.face_id,
                owner = %owner,
                score = found.score,
                "face does not belong to credential owner"
            );
            Reason::FaceCredentialMismatch
        } else if found.score >= self.policy.matching.accept_threshold {
            Reason::AccessGranted
        } else {
            Reason::LowMatchConfidence
        };
        assessment.outcome = Outcome::with_match(reason, found.face_id, found.score);
        assessment
    }

    /// `None` when the check could not run: no analysed frame had a face, or
    /// the extraction task died.
    async fn run_liveness(&self, burst: &CaptureBurst) -> Option<LivenessResult> {
        let extractor = self.extractor.clone();
        let policy = self.policy.clone();
        let dim = self.enrollments.embedding_dim();
        let burst = burst.clone();

        let result = tokio::task::spawn_blocking(move || {
            let frames = burst.frames();
            let frames = &frames[..frames.len().min(policy.liveness.max_frames)];
            let extractor: &dyn FeatureExtractor = extractor.as_ref();

            let extracted: Vec<_> = std::thread::scope(|s| {
                let handles: Vec<_> = frames
                    .iter()
                    .map(|frame| {
                        s.spawn(move || {
                            liveness::extract_frame(extractor, frame).and_then(|f| {
                                if f.embedding.len() == dim {
                                    Ok(f)
                                } else {
                                    Err(FrameDefect::NoFace)
                                }
                            })
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or(Err(FrameDefect::NoFace)))
                    .collect()
            });

            if extracted
                .iter()
                .all(|f| matches!(f, Err(FrameDefect::NoFace)))
            {
                return None;
            }
            Some(liveness::evaluate(
                &extracted,
                |a, b| extractor.embedding_distance(a, b),
                &policy.liveness,
            ))
        })
        .await;

        match result {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "liveness task failed");
                None
            }
        }
    }

    async fn run_spoof(&self, burst: &CaptureBurst) -> Option<SpoofReport> {
        let extractor = self.extractor.clone();
        let policy = self.policy.clone();
        let burst = burst.clone();

        let result = tokio::task::spawn_blocking(move || {
            spoof::check_image(extractor.as_ref(), burst.primary(), &policy.spoof)
        })
        .await;

        match result {
            Ok(report) => {
                tracing::debug!(
                    suspected = report.suspected,
                    face_present = report.face_present,
                    uniformity = report.scores.uniformity,
                    border = report.scores.border,
                    moire = report.scores.moire,
                    size = report.scores.size,
                    threshold = report.threshold,
                    "screen heuristic evaluated"
                );
                Some(report)
            }
            Err(e) => {
                tracing::error!(error = %e, "screen heuristic task failed");
                None
            }
        }
    }

    async fn run_match(&self, burst: &CaptureBurst) -> Option<IdentityMatch> {
        let extractor = self.extractor.clone();
        let threshold = self.policy.matching.effective_threshold();
        let gallery = self.enrollments.snapshot();
        let dim = self.enrollments.embedding_dim();
        let burst = burst.clone();

        let result = tokio::task::spawn_blocking(move || {
            let probe: Embedding = extractor.extract_embedding(burst.primary())?;
            if probe.len() != dim || !probe.is_finite() {
                tracing::warn!(
                    len = probe.len(),
                    expected = dim,
                    "discarding malformed embedding from primary frame"
                );
                return None;
            }
            best_match(&probe, gallery.values(), threshold, |a, b| {
                extractor.embedding_distance(a, b)
            })
        })
        .await;

        match result {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(error = %e, "match task failed");
                None
            }
        }
    }
}

/// Decision plus the context recorded with it.
struct Assessment {
    outcome: Outcome,
    owner: Option<String>,
    checks: Checks,
}

impl Assessment {
    fn new(outcome: Outcome, checks: Checks) -> Self {
        Self {
            outcome,
            owner: None,
            checks,
        }
    }
}

/// Check summary stored with each audit entry. A `None` check did not run.
#[derive(Debug, Default, Serialize)]
struct Checks {
    liveness: Option<LivenessSummary>,
    spoof: Option<SpoofSummary>,
}

#[derive(Debug, Serialize)]
struct LivenessSummary {
    passed: bool,
    frames_analysed: usize,
    ear_range: Option<(f32, f32)>,
    max_identity_distance: f32,
    failure: Option<String>,
}

impl From<&LivenessResult> for LivenessSummary {
    fn from(r: &LivenessResult) -> Self {
        Self {
            passed: r.is_live,
            frames_analysed: r.frames_analysed,
            ear_range: r.ear_range,
            max_identity_distance: r.max_identity_distance,
            failure: r.failure.map(|f| format!("{f:?}")),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpoofSummary {
    suspected: bool,
    face_present: bool,
    scores: SpoofScores,
    threshold: u32,
}

impl From<&SpoofReport> for SpoofSummary {
    fn from(r: &SpoofReport) -> Self {
        Self {
            suspected: r.suspected,
            face_present: r.face_present,
            scores: r.scores,
            threshold: r.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use facegate_core::{BoundingBox, LandmarkSet, Point};
    use image::{GrayImage, Luma};
    use tokio::sync::Notify;

    use crate::credentials::{Credential, CredentialError, Owner};

    // ── Fakes ────────────────────────────────────────────────────────────────

    #[derive(Clone)]
    struct Face {
        embedding: Vec<f32>,
        ear: f32,
        /// Whether `detect_faces` reports it (drives the screen threshold).
        detectable: bool,
    }

    /// Extractor keyed on image width.
    #[derive(Default)]
    struct ScriptedExtractor {
        faces: HashMap<u32, Face>,
        delay: Duration,
        embedding_calls: AtomicUsize,
    }

    impl ScriptedExtractor {
        fn face(mut self, width: u32, embedding: &[f32], ear: f32) -> Self {
            self.faces.insert(
                width,
                Face {
                    embedding: embedding.to_vec(),
                    ear,
                    detectable: true,
                },
            );
            self
        }

        fn hidden_face(mut self, width: u32, embedding: &[f32], ear: f32) -> Self {
            self.faces.insert(
                width,
                Face {
                    embedding: embedding.to_vec(),
                    ear,
                    detectable: false,
                },
            );
            self
        }

        fn lookup(&self, image: &DynamicImage) -> Option<&Face> {
            self.faces.get(&image.width())
        }
    }

    fn eye(ear: f32) -> Vec<Point> {
        let h = ear / 2.0;
        vec![
            (0.0, 0.0),
            (0.25, h),
            (0.75, h),
            (1.0, 0.0),
            (0.75, -h),
            (0.25, -h),
        ]
    }

    impl FeatureExtractor for ScriptedExtractor {
        fn detect_faces(&self, image: &DynamicImage) -> Vec<BoundingBox> {
            match self.lookup(image) {
                Some(face) if face.detectable => vec![BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 4.0,
                    height: 4.0,
                    confidence: 0.99,
                }],
                _ => Vec::new(),
            }
        }

        fn extract_embedding(&self, image: &DynamicImage) -> Option<Embedding> {
            self.embedding_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.lookup(image).map(|f| Embedding::new(f.embedding.clone()))
        }

        fn extract_landmarks(&self, image: &DynamicImage) -> Option<LandmarkSet> {
            self.lookup(image).map(|f| LandmarkSet {
                left_eye: eye(f.ear),
                right_eye: eye(f.ear),
            })
        }
    }

    #[derive(Default)]
    struct MemoryCredentials {
        badges: HashMap<String, Credential>,
        broken: bool,
        lookups: AtomicUsize,
    }

    impl MemoryCredentials {
        fn badge(mut self, code: &str, expires_on: Option<NaiveDate>, owner: Option<(&str, bool)>) -> Self {
            self.badges.insert(
                code.to_string(),
                Credential {
                    code: code.to_string(),
                    expires_on,
                    owner: owner.map(|(face_id, active)| Owner {
                        face_id: face_id.to_string(),
                        active,
                    }),
                },
            );
            self
        }
    }

    #[async_trait]
    impl CredentialStore for MemoryCredentials {
        async fn lookup(&self, code: &str) -> Result<Option<Credential>, CredentialError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(CredentialError::InvalidExpiry {
                    code: code.to_string(),
                    value: "garbage".into(),
                });
            }
            Ok(self.badges.get(code).cloned())
        }
    }

    #[derive(Default)]
    struct MemoryAudit {
        entries: Mutex<Vec<AuditEntry>>,
        broken: bool,
        /// Time a write takes after it starts.
        delay: Duration,
        started: Notify,
    }

    impl MemoryAudit {
        fn entries(&self) -> Vec<AuditEntry> {
            self.entries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuditSink for MemoryAudit {
        async fn record(&self, entry: &AuditEntry) -> Result<i64, AuditError> {
            self.started.notify_one();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.broken {
                return Err(AuditError::Corrupt {
                    id: 0,
                    detail: "disk full".into(),
                });
            }
            let mut entries = self.entries.lock().unwrap();
            entries.push(entry.clone());
            Ok(entries.len() as i64)
        }
    }

    // ── Fixtures ─────────────────────────────────────────────────────────────

    const ALICE: [f32; 2] = [0.0, 1.0];
    const BOB: [f32; 2] = [0.8, 0.0];

    /// Uniform frame; its width selects the scripted face.
    fn plain(width: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(width, 16, Luma([128])))
    }

    /// 200×200 frame with a bright bezelled rectangle over half its area.
    fn screen() -> DynamicImage {
        let (x0, y0, x1, y1) = (30, 30, 170, 170);
        DynamicImage::ImageLuma8(GrayImage::from_fn(200, 200, |x, y| {
            let inside = x >= x0 && x < x1 && y >= y0 && y < y1;
            if !inside {
                Luma([0])
            } else if x == x0 || x == x1 - 1 || y == y0 || y == y1 - 1 {
                Luma([115])
            } else {
                Luma([230])
            }
        }))
    }

    fn captured() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn burst(frames: Vec<DynamicImage>) -> CaptureBurst {
        CaptureBurst::captured_at(frames, captured()).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Widths: 30 alice open, 31 alice closed, 32..=35 alice open variants,
    /// 40 probe near bob, 41 probe 0.3 from alice, 200 undetected alice.
    fn extractor() -> ScriptedExtractor {
        ScriptedExtractor::default()
            .face(30, &ALICE, 0.30)
            .face(31, &ALICE, 0.15)
            .face(32, &ALICE, 0.29)
            .face(33, &ALICE, 0.28)
            .face(34, &ALICE, 0.27)
            .face(35, &ALICE, 0.26)
            .face(40, &[1.0, 0.0], 0.30)
            .face(41, &[0.3, 1.0], 0.30)
            .hidden_face(200, &ALICE, 0.30)
    }

    fn credentials() -> MemoryCredentials {
        MemoryCredentials::default()
            .badge("QR_ALICE", None, Some(("alice", true)))
            .badge("QR_EXPIRED", Some(date(2025, 5, 31)), Some(("alice", true)))
            .badge("QR_LAST_DAY", Some(date(2025, 6, 1)), Some(("alice", true)))
            .badge("QR_INACTIVE", None, Some(("alice", false)))
            .badge("QR_ORPHAN", None, None)
    }

    struct Harness {
        verifier: Verifier,
        extractor: Arc<ScriptedExtractor>,
        credentials: Arc<MemoryCredentials>,
        audit: Arc<MemoryAudit>,
    }

    async fn harness_with(
        extractor: ScriptedExtractor,
        credentials: MemoryCredentials,
        audit: MemoryAudit,
        policy: Policy,
    ) -> Harness {
        let enrollments = EnrollmentStore::open(Path::new(":memory:"), 2).await.unwrap();
        enrollments
            .append("alice", "default", Embedding::new(ALICE.to_vec()))
            .await
            .unwrap();
        enrollments
            .append("bob", "default", Embedding::new(BOB.to_vec()))
            .await
            .unwrap();

        let extractor = Arc::new(extractor);
        let credentials = Arc::new(credentials);
        let audit = Arc::new(audit);
        let verifier = Verifier::new(
            extractor.clone(),
            Arc::new(enrollments),
            credentials.clone(),
            audit.clone(),
            policy,
        );
        Harness {
            verifier,
            extractor,
            credentials,
            audit,
        }
    }

    async fn harness() -> Harness {
        harness_with(
            extractor(),
            credentials(),
            MemoryAudit::default(),
            Policy::default(),
        )
        .await
    }

    fn blink_burst() -> CaptureBurst {
        burst(vec![plain(30), plain(31), plain(32), plain(33), plain(34)])
    }

    // ── Decisions ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_unknown_code_rejected_without_matching() {
        let h = harness().await;
        let v = h
            .verifier
            .verify("QR_UNKNOWN", &burst(vec![plain(30)]))
            .await
            .unwrap();
        assert_eq!(v.outcome.decision, Decision::Reject);
        assert_eq!(v.outcome.reason, Reason::InvalidCode);
        assert_eq!(h.extractor.embedding_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_code_skips_lookup() {
        let h = harness().await;
        let long = "Q".repeat(1000);
        for code in ["", long.as_str()] {
            let v = h.verifier.verify(code, &burst(vec![plain(30)])).await.unwrap();
            assert_eq!(v.outcome.reason, Reason::InvalidCode);
        }
        assert_eq!(h.credentials.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(h.audit.entries()[1].claimed_code.len(), MAX_CODE_LEN);
    }

    #[tokio::test]
    async fn test_expired_credential() {
        let h = harness().await;
        let v = h
            .verifier
            .verify("QR_EXPIRED", &burst(vec![plain(30)]))
            .await
            .unwrap();
        assert_eq!(v.outcome.decision, Decision::Reject);
        assert_eq!(v.outcome.reason, Reason::CredentialExpired);

        // Still valid on its last day
        let v = h
            .verifier
            .verify("QR_LAST_DAY", &burst(vec![plain(30)]))
            .await
            .unwrap();
        assert_eq!(v.outcome.reason, Reason::AccessGranted);
    }

    #[tokio::test]
    async fn test_inactive_or_missing_owner() {
        let h = harness().await;
        for code in ["QR_INACTIVE", "QR_ORPHAN"] {
            let v = h.verifier.verify(code, &burst(vec![plain(30)])).await.unwrap();
            assert_eq!(v.outcome.decision, Decision::Reject);
            assert_eq!(v.outcome.reason, Reason::InactiveUser);
        }
    }

    #[tokio::test]
    async fn test_credential_store_fault_fails_closed() {
        let creds = MemoryCredentials {
            broken: true,
            ..credentials()
        };
        let h = harness_with(extractor(), creds, MemoryAudit::default(), Policy::default()).await;
        let v = h
            .verifier
            .verify("QR_ALICE", &burst(vec![plain(30)]))
            .await
            .unwrap();
        assert_eq!(v.outcome.decision, Decision::Reject);
        assert_eq!(v.outcome.reason, Reason::CredentialLookupFailed);
        assert_eq!(h.audit.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_face_credential_mismatch() {
        let h = harness().await;
        // Probe is 0.2 from bob; the badge belongs to alice.
        let v = h
            .verifier
            .verify("QR_ALICE", &burst(vec![plain(40)]))
            .await
            .unwrap();
        assert_eq!(v.outcome.decision, Decision::Suspicious);
        assert_eq!(v.outcome.reason, Reason::FaceCredentialMismatch);
        assert_eq!(v.outcome.identity.as_deref(), Some("bob"));
        assert!((v.outcome.score.unwrap() - 0.8).abs() < 1e-5);

        let entry = &h.audit.entries()[0];
        assert_eq!(entry.matched_identity.as_deref(), Some("bob"));
        assert_eq!(entry.owner_identity.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_monotonic_ear_is_suspicious() {
        let h = harness().await;
        let frames = vec![plain(30), plain(32), plain(33), plain(34), plain(35)];
        let v = h.verifier.verify("QR_ALICE", &burst(frames)).await.unwrap();
        assert_eq!(v.outcome.decision, Decision::Suspicious);
        assert_eq!(v.outcome.reason, Reason::NoLivenessConfirmation);
        assert_eq!(h.credentials.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blink_proceeds_to_accept() {
        let h = harness().await;
        let v = h.verifier.verify("QR_ALICE", &blink_burst()).await.unwrap();
        assert_eq!(v.outcome.decision, Decision::Accept);
        assert_eq!(v.outcome.reason, Reason::AccessGranted);
        assert_eq!(v.outcome.identity.as_deref(), Some("alice"));
        assert_eq!(v.outcome.score, Some(1.0));

        let checks = &h.audit.entries()[0].checks;
        assert_eq!(checks["liveness"]["passed"], serde_json::json!(true));
        assert!(checks["spoof"].is_null());
    }

    #[tokio::test]
    async fn test_no_face_not_recognized() {
        let h = harness().await;
        let v = h
            .verifier
            .verify("QR_ALICE", &burst(vec![plain(99)]))
            .await
            .unwrap();
        assert_eq!(v.outcome.decision, Decision::Reject);
        assert_eq!(v.outcome.reason, Reason::FaceNotRecognized);

        // A full burst without any face cannot prove liveness either way.
        let frames = (0..5).map(|_| plain(99)).collect();
        let v = h.verifier.verify("QR_ALICE", &burst(frames)).await.unwrap();
        assert_eq!(v.outcome.reason, Reason::FaceNotRecognized);
    }

    #[tokio::test]
    async fn test_malformed_embedding_not_recognized() {
        let scripted = extractor()
            .face(50, &[], 0.30)
            .face(51, &[0.0], 0.30)
            .face(52, &[f32::NAN, 0.0], 0.30);
        let h = harness_with(scripted, credentials(), MemoryAudit::default(), Policy::default()).await;

        let bursts = [
            vec![plain(50)],
            vec![plain(51)],
            vec![plain(52)],
            vec![plain(51), plain(51), plain(51)],
        ];
        for frames in bursts {
            let v = h.verifier.verify("QR_ALICE", &burst(frames)).await.unwrap();
            assert_eq!(v.outcome.decision, Decision::Reject);
            assert_eq!(v.outcome.reason, Reason::FaceNotRecognized);
            assert_eq!(v.outcome.identity, None);
            assert_eq!(v.outcome.score, None);
        }
        assert_eq!(h.audit.entries().len(), 4);
    }

    #[tokio::test]
    async fn test_low_match_confidence() {
        let mut policy = Policy::default();
        policy.matching.accept_threshold = 0.9;
        let h = harness_with(extractor(), credentials(), MemoryAudit::default(), policy).await;
        let v = h
            .verifier
            .verify("QR_ALICE", &burst(vec![plain(41)]))
            .await
            .unwrap();
        assert_eq!(v.outcome.decision, Decision::Reject);
        assert_eq!(v.outcome.reason, Reason::LowMatchConfidence);
        assert_eq!(v.outcome.identity.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_screen_is_suspicious() {
        let h = harness().await;
        let v = h
            .verifier
            .verify("QR_ALICE", &burst(vec![screen()]))
            .await
            .unwrap();
        assert_eq!(v.outcome.decision, Decision::Suspicious);
        assert_eq!(v.outcome.reason, Reason::PossibleScreenOrPhoto);

        let checks = &h.audit.entries()[0].checks;
        assert_eq!(checks["spoof"]["suspected"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_liveness_precedence_over_screen() {
        let frames = || burst(vec![screen(), plain(31), plain(32)]);

        let h = harness().await;
        let v = h.verifier.verify("QR_ALICE", &frames()).await.unwrap();
        assert_eq!(v.outcome.reason, Reason::AccessGranted);

        let mut policy = Policy::default();
        policy.precedence.liveness_supersedes_spoof = false;
        let h = harness_with(extractor(), credentials(), MemoryAudit::default(), policy).await;
        let v = h.verifier.verify("QR_ALICE", &frames()).await.unwrap();
        assert_eq!(v.outcome.reason, Reason::PossibleScreenOrPhoto);
    }

    // ── Audit & deadlines ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_one_audit_record_per_attempt() {
        let h = harness().await;
        let mut ids = Vec::new();
        for code in ["QR_UNKNOWN", "QR_ALICE", "QR_INACTIVE"] {
            let v = h.verifier.verify(code, &burst(vec![plain(30)])).await.unwrap();
            ids.push(v.record_id);
        }
        let entries = h.audit.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(entries[1].decision, Decision::Accept);
        assert_eq!(entries[1].captured_at, captured());
        assert_eq!(entries[1].frame_count, 1);
    }

    #[tokio::test]
    async fn test_audit_failure_is_error() {
        let audit = MemoryAudit {
            broken: true,
            ..Default::default()
        };
        let h = harness_with(extractor(), credentials(), audit, Policy::default()).await;
        let err = h
            .verifier
            .verify("QR_ALICE", &burst(vec![plain(30)]))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Audit(_)));
    }

    #[tokio::test]
    async fn test_deadline_exceeded_records_nothing() {
        let slow = ScriptedExtractor {
            delay: Duration::from_millis(300),
            ..extractor()
        };
        let h = harness_with(slow, credentials(), MemoryAudit::default(), Policy::default()).await;
        let deadline = Instant::now() + Duration::from_millis(20);
        let err = h
            .verifier
            .verify_until("QR_ALICE", &blink_burst(), deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::DeadlineExceeded));
        assert!(h.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn test_audit_write_survives_dropped_caller() {
        let audit = MemoryAudit {
            delay: Duration::from_millis(200),
            ..Default::default()
        };
        let h = harness_with(extractor(), credentials(), audit, Policy::default()).await;
        let frames = burst(vec![plain(30)]);
        let deadline = Instant::now() + Duration::from_secs(5);

        // Drop the verification future as soon as the audit write begins.
        tokio::select! {
            _ = h.verifier.verify_until("QR_ALICE", &frames, deadline) => {
                panic!("verification finished before the audit write")
            }
            _ = h.audit.started.notified() => {}
        }
        assert!(h.audit.entries().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, Reason::AccessGranted);
        assert_eq!(entries[0].claimed_code, "QR_ALICE");
    }

    // ── Enrollment ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_enroll_then_match() {
        let h = harness().await;
        assert!(h.verifier.enroll("carol", "default", plain(40)).await.unwrap());
        assert_eq!(h.verifier.enrollments().snapshot()["carol"].embeddings.len(), 1);

        // The probe now matches carol exactly, ahead of bob.
        let v = h
            .verifier
            .verify("QR_ALICE", &burst(vec![plain(40)]))
            .await
            .unwrap();
        assert_eq!(v.outcome.identity.as_deref(), Some("carol"));
        assert_eq!(v.outcome.score, Some(1.0));
    }

    #[tokio::test]
    async fn test_enroll_refuses_screen_and_faceless() {
        let h = harness().await;
        assert!(!h.verifier.enroll("carol", "default", screen()).await.unwrap());
        assert!(!h.verifier.enroll("carol", "default", plain(99)).await.unwrap());
        assert!(!h.verifier.enrollments().snapshot().contains_key("carol"));
    }
}
