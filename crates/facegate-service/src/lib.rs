//! facegate-service: access decisions for a badge plus a live face.
//!
//! Wires the decision primitives from `facegate-core` to storage: encrypted
//! enrollments, the badge database and the access log. The embedding
//! process supplies a [`FeatureExtractor`] and calls [`bootstrap`].

pub mod audit;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod outcome;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use facegate_core::FeatureExtractor;
use thiserror::Error;

pub use audit::{AuditEntry, AuditError, AuditRecord, AuditSink, SqliteAuditLog};
pub use config::{Config, ConfigError};
pub use credentials::{Credential, CredentialError, CredentialStore, Owner, SqliteCredentialStore};
pub use engine::{Verification, Verifier, VerifyError};
pub use outcome::{BurstError, CaptureBurst, Decision, Outcome, Reason};
pub use store::{EnrollmentStore, StoreError};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("enrollment store error: {0}")]
    Store(#[from] StoreError),
    #[error("credential store error: {0}")]
    Credentials(#[from] CredentialError),
    #[error("audit log error: {0}")]
    Audit(#[from] AuditError),
}

/// Open every SQLite-backed collaborator named by `config` and build a
/// [`Verifier`]. Fails fast if any store cannot be opened.
pub async fn bootstrap(
    config: &Config,
    extractor: Arc<dyn FeatureExtractor>,
) -> Result<Verifier, BootstrapError> {
    let policy = config.load_policy()?;

    let enrollments = EnrollmentStore::open(&config.db_path, config.embedding_dim).await?;
    tracing::info!(path = %config.db_path.display(), "enrollment store opened");

    let credentials = SqliteCredentialStore::open(&config.credentials_db).await?;
    tracing::info!(path = %config.credentials_db.display(), "credential store opened");

    let audit = SqliteAuditLog::open(&config.audit_db).await?;
    tracing::info!(path = %config.audit_db.display(), "audit log opened");

    tracing::info!(
        match_threshold = policy.matching.effective_threshold(),
        accept_threshold = policy.matching.accept_threshold,
        liveness_supersedes_spoof = policy.precedence.liveness_supersedes_spoof,
        verify_timeout_secs = config.verify_timeout_secs,
        "facegate verifier ready"
    );

    Ok(Verifier::new(
        extractor,
        Arc::new(enrollments),
        Arc::new(credentials),
        Arc::new(audit),
        policy,
    )
    .with_timeout(Duration::from_secs(config.verify_timeout_secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{BoundingBox, Embedding, LandmarkSet};
    use image::DynamicImage;

    struct Blind;

    impl FeatureExtractor for Blind {
        fn detect_faces(&self, _image: &DynamicImage) -> Vec<BoundingBox> {
            Vec::new()
        }
        fn extract_embedding(&self, _image: &DynamicImage) -> Option<Embedding> {
            None
        }
        fn extract_landmarks(&self, _image: &DynamicImage) -> Option<LandmarkSet> {
            None
        }
    }

    #[tokio::test]
    async fn test_bootstrap_shared_database() {
        let dir = std::env::temp_dir().join(format!(
            "facegate-bootstrap-test-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let config = Config {
            db_path: dir.join("faces.db"),
            credentials_db: dir.join("access.db"),
            audit_db: dir.join("access.db"),
            embedding_dim: 128,
            verify_timeout_secs: 5,
            policy_file: None,
            match_threshold: None,
            accept_threshold: None,
            liveness_supersedes_spoof: None,
        };
        let verifier = bootstrap(&config, Arc::new(Blind)).await.unwrap();

        let burst = CaptureBurst::new(vec![DynamicImage::new_luma8(16, 16)]).unwrap();
        let v = verifier.verify("QR_NOBODY", &burst).await.unwrap();
        assert_eq!(v.outcome.reason, Reason::InvalidCode);

        let log = SqliteAuditLog::open(&config.audit_db).await.unwrap();
        assert_eq!(log.count().await.unwrap(), 1);
    }
}
