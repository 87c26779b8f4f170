use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use facegate_core::{Embedding, IdentityRecord};
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {got} (expected {expected})")]
    InvalidEmbeddingDim { got: usize, expected: usize },
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("invalid identity: face id must not be empty")]
    EmptyFaceId,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed embedding storage with AES-256-GCM encryption.
///
/// Rows are append-only: one row per enrolled sample, several rows per
/// identity. A per-installation 32-byte key is generated at first use and
/// stored at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct FaceModelStore {
    conn: Connection,
    enc_key: [u8; 32],
    embedding_dim: usize,
}

impl FaceModelStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, embedding_dim: usize) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/facegate"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS faces (
                     id TEXT PRIMARY KEY,
                     face_id TEXT NOT NULL,
                     label TEXT NOT NULL,
                     embedding BLOB NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_faces_face_id ON faces(face_id);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            enc_key,
            embedding_dim,
        })
    }

    /// Insert one sample. Returns the generated UUID.
    pub async fn insert(
        &self,
        face_id: &str,
        label: &str,
        embedding: &Embedding,
    ) -> Result<String, StoreError> {
        if face_id.is_empty() {
            return Err(StoreError::EmptyFaceId);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();

        // Encrypt before entering the SQLite closure
        let blob = self.encrypt_embedding(&embedding.values)?;

        let id_clone = id.clone();
        let face_id = face_id.to_string();
        let label = label.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO faces (id, face_id, label, embedding, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id_clone, face_id, label, blob, created_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Every stored sample as `(face_id, embedding)`, in insertion order.
    pub async fn load_all(&self) -> Result<Vec<(String, Embedding)>, StoreError> {
        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows: Vec<(String, Vec<u8>)> = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT face_id, embedding FROM faces ORDER BY rowid")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for (face_id, blob) in rows {
            let values = self.decrypt_embedding(&blob)?;
            samples.push((face_id, Embedding::new(values)));
        }
        Ok(samples)
    }

    /// List samples for an identity (metadata only, no embeddings).
    pub async fn list_by_identity(&self, face_id: &str) -> Result<Vec<SampleInfo>, StoreError> {
        let face_id = face_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, label, created_at
                     FROM faces WHERE face_id = ?1 ORDER BY rowid",
                )?;
                let rows = stmt.query_map([&face_id], |row| {
                    Ok(SampleInfo {
                        id: row.get(0)?,
                        label: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count stored samples across all identities.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt embedding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values, self.embedding_dim)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding_strict(&plaintext, self.embedding_dim)
    }
}

/// Snapshot of all enrolled identities, keyed and iterated by `face_id`.
pub type Gallery = BTreeMap<String, IdentityRecord>;

/// Enrolled embeddings with an in-memory gallery for matching.
///
/// Verification reads an immutable [`Gallery`] snapshot and never blocks on
/// enrollment. Appends to the same identity are serialised; appends to
/// different identities run in parallel. [`reload`](Self::reload) rebuilds the
/// snapshot from the database, picking up rows written by other processes.
pub struct EnrollmentStore {
    db: FaceModelStore,
    gallery: RwLock<Arc<Gallery>>,
    identity_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Appends hold this shared; reload holds it exclusively so a snapshot
    /// rebuilt from the database cannot drop a concurrent append.
    reload_gate: tokio::sync::RwLock<()>,
}

impl EnrollmentStore {
    /// Open the backing database and load every enrolled sample.
    pub async fn open(db_path: &Path, embedding_dim: usize) -> Result<Self, StoreError> {
        let db = FaceModelStore::open(db_path, embedding_dim).await?;
        let store = Self {
            db,
            gallery: RwLock::new(Arc::new(Gallery::new())),
            identity_locks: Mutex::new(HashMap::new()),
            reload_gate: tokio::sync::RwLock::new(()),
        };
        store.reload().await?;
        Ok(store)
    }

    /// Rebuild the in-memory gallery from the database.
    ///
    /// Returns the number of identities loaded.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let _gate = self.reload_gate.write().await;
        let samples = self.db.load_all().await?;
        let sample_count = samples.len();

        let mut gallery = Gallery::new();
        for (face_id, embedding) in samples {
            gallery
                .entry(face_id.clone())
                .or_insert_with(|| IdentityRecord::new(face_id))
                .push(embedding);
        }
        let identities = gallery.len();

        *self.gallery.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
        tracing::info!(identities, samples = sample_count, "enrollment gallery loaded");
        Ok(identities)
    }

    /// Current gallery. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.gallery
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Append one sample to an identity, creating the identity if needed.
    /// Returns the sample's UUID.
    pub async fn append(
        &self,
        face_id: &str,
        label: &str,
        embedding: Embedding,
    ) -> Result<String, StoreError> {
        let _gate = self.reload_gate.read().await;
        let lock = self.identity_lock(face_id);
        let _identity = lock.lock().await;

        let sample_id = self.db.insert(face_id, label, &embedding).await?;

        {
            let mut guard = self.gallery.write().unwrap_or_else(PoisonError::into_inner);
            Arc::make_mut(&mut guard)
                .entry(face_id.to_string())
                .or_insert_with(|| IdentityRecord::new(face_id))
                .push(embedding);
        }

        tracing::debug!(face_id, label, sample_id = %sample_id, "enrollment sample appended");
        Ok(sample_id)
    }

    /// Sample metadata for one identity, for reviewing how many variants
    /// have accumulated.
    pub async fn samples(&self, face_id: &str) -> Result<Vec<SampleInfo>, StoreError> {
        self.db.list_by_identity(face_id).await
    }

    /// Length every stored and compared embedding must have.
    pub fn embedding_dim(&self) -> usize {
        self.db.embedding_dim
    }

    /// Total stored samples across all identities.
    pub async fn sample_count(&self) -> Result<u64, StoreError> {
        self.db.count_all().await
    }

    fn identity_lock(&self, face_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.identity_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(face_id.to_string())
            .or_default()
            .clone()
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding_strict(bytes: &[u8], dim: usize) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != dim * 4 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(dim);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        values.push(v);
    }
    Ok(values)
}

fn validate_embedding_values(values: &[f32], dim: usize) -> Result<(), StoreError> {
    if values.len() != dim {
        return Err(StoreError::InvalidEmbeddingDim {
            got: values.len(),
            expected: dim,
        });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about one enrolled sample (no embedding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SampleInfo {
    pub id: String,
    pub label: String,
    pub created_at: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 128;

    fn embedding(seed: f32) -> Embedding {
        Embedding::new((0..DIM).map(|i| seed + i as f32 / DIM as f32).collect())
    }

    fn temp_db(name: &str) -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!(
                "facegate-store-test-{name}-{}",
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            ))
            .join("faces.db")
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let store = FaceModelStore::open(Path::new(":memory:"), DIM).await.unwrap();
        let emb = embedding(0.0);

        let id = store.insert("alice", "default", &emb).await.unwrap();
        assert!(!id.is_empty());

        let samples = store.load_all().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0, "alice");
        for (orig, rec) in emb.values.iter().zip(samples[0].1.values.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let store1 = FaceModelStore {
            conn: Connection::open(Path::new(":memory:")).await.unwrap(),
            enc_key: [1u8; 32],
            embedding_dim: DIM,
        };
        let store2 = FaceModelStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
            embedding_dim: DIM,
        };

        let blob = store1.encrypt_embedding(&embedding(0.0).values).unwrap();
        assert!(store1.decrypt_embedding(&blob).is_ok());
        assert!(matches!(
            store2.decrypt_embedding(&blob),
            Err(StoreError::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn test_rejects_wrong_dimension() {
        let store = FaceModelStore::open(Path::new(":memory:"), DIM).await.unwrap();
        let short = Embedding::new(vec![0.5; 64]);
        let err = store.insert("alice", "default", &short).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidEmbeddingDim {
                got: 64,
                expected: DIM
            }
        ));
    }

    #[tokio::test]
    async fn test_rejects_nan() {
        let store = FaceModelStore::open(Path::new(":memory:"), DIM).await.unwrap();
        let mut emb = embedding(0.0);
        emb.values[42] = f32::NAN;
        let err = store.insert("alice", "default", &emb).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingValue));
    }

    #[tokio::test]
    async fn test_rejects_empty_face_id() {
        let store = FaceModelStore::open(Path::new(":memory:"), DIM).await.unwrap();
        let err = store.insert("", "default", &embedding(0.0)).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyFaceId));
    }

    #[test]
    fn test_strict_rejects_wrong_length() {
        let err = bytes_to_embedding_strict(&[0u8; 100], DIM).unwrap_err();
        assert!(matches!(err, StoreError::InvalidBlob(100)));
    }

    #[test]
    fn test_strict_rejects_infinity() {
        let mut values = vec![0.5f32; DIM];
        values[0] = f32::INFINITY;
        let err = bytes_to_embedding_strict(&embedding_to_bytes(&values), DIM).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingValue));
    }

    #[tokio::test]
    async fn test_multi_sample_identity() {
        let store = EnrollmentStore::open(Path::new(":memory:"), DIM).await.unwrap();
        store.append("alice", "normal", embedding(0.0)).await.unwrap();
        store.append("alice", "glasses", embedding(0.5)).await.unwrap();
        store.append("bob", "default", embedding(1.0)).await.unwrap();

        let gallery = store.snapshot();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery["alice"].embeddings.len(), 2);
        assert_eq!(gallery["alice"].embeddings[1], embedding(0.5));

        let samples = store.samples("alice").await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label, "normal");
        assert_eq!(samples[1].label, "glasses");
        assert_eq!(store.sample_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_unaffected_by_later_append() {
        let store = EnrollmentStore::open(Path::new(":memory:"), DIM).await.unwrap();
        store.append("alice", "default", embedding(0.0)).await.unwrap();
        let before = store.snapshot();
        store.append("alice", "glasses", embedding(0.5)).await.unwrap();
        assert_eq!(before["alice"].embeddings.len(), 1);
        assert_eq!(store.snapshot()["alice"].embeddings.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_append_leaves_gallery_untouched() {
        let store = EnrollmentStore::open(Path::new(":memory:"), DIM).await.unwrap();
        let bad = Embedding::new(vec![0.0; 3]);
        assert!(store.append("alice", "default", bad).await.is_err());
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_same_identity() {
        let store = Arc::new(EnrollmentStore::open(Path::new(":memory:"), DIM).await.unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append("alice", &format!("sample-{i}"), embedding(i as f32))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.snapshot()["alice"].embeddings.len(), 8);
        assert_eq!(store.sample_count().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_reload_sees_other_handle_and_persists() {
        let path = temp_db("reload");
        let writer = EnrollmentStore::open(&path, DIM).await.unwrap();
        let reader = EnrollmentStore::open(&path, DIM).await.unwrap();
        assert!(reader.snapshot().is_empty());

        writer.append("alice", "default", embedding(0.25)).await.unwrap();
        assert!(reader.snapshot().is_empty());

        assert_eq!(reader.reload().await.unwrap(), 1);
        assert_eq!(reader.snapshot()["alice"].embeddings[0], embedding(0.25));

        // Key file was generated next to the database
        assert!(path.parent().unwrap().join(".key").exists());
    }
}
