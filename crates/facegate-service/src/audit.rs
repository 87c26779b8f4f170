//! Access log: one record per verification attempt.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::outcome::{Decision, ParseError, Reason};

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("check summary encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt audit row {id}: {detail}")]
    Corrupt { id: i64, detail: String },
}

/// Everything recorded about one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub attempt_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub claimed_code: String,
    pub frame_count: usize,
    pub decision: Decision,
    pub reason: Reason,
    pub score: Option<f32>,
    /// Identity the face matched.
    pub matched_identity: Option<String>,
    /// Identity the credential belongs to.
    pub owner_identity: Option<String>,
    /// Which checks ran and what they found.
    pub checks: serde_json::Value,
}

/// A persisted entry with its record id.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub id: i64,
    pub entry: AuditEntry,
}

/// Destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one entry and return its record id.
    async fn record(&self, entry: &AuditEntry) -> Result<i64, AuditError>;
}

/// SQLite-backed access log.
#[derive(Clone)]
pub struct SqliteAuditLog {
    conn: Connection,
}

impl SqliteAuditLog {
    pub async fn open(db_path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS access_log (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     attempt_id TEXT NOT NULL UNIQUE,
                     captured_at TEXT NOT NULL,
                     claimed_code TEXT NOT NULL,
                     frame_count INTEGER NOT NULL,
                     decision TEXT NOT NULL,
                     reason TEXT NOT NULL,
                     score REAL,
                     matched_identity TEXT,
                     owner_identity TEXT,
                     checks TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_access_log_captured_at
                     ON access_log(captured_at);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Entries captured in `[start, end)`, newest first, at most `limit`.
    pub async fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let start = timestamp(start);
        let end = timestamp(end);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows: Vec<RawRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, attempt_id, captured_at, claimed_code, frame_count,
                            decision, reason, score, matched_identity, owner_identity, checks
                     FROM access_log
                     WHERE captured_at >= ?1 AND captured_at < ?2
                     ORDER BY captured_at DESC, id DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(rusqlite::params![start, end, limit], |row| {
                    Ok(RawRow {
                        id: row.get(0)?,
                        attempt_id: row.get(1)?,
                        captured_at: row.get(2)?,
                        claimed_code: row.get(3)?,
                        frame_count: row.get(4)?,
                        decision: row.get(5)?,
                        reason: row.get(6)?,
                        score: row.get(7)?,
                        matched_identity: row.get(8)?,
                        owner_identity: row.get(9)?,
                        checks: row.get(10)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter().map(RawRow::into_record).collect()
    }

    /// Number of recorded attempts.
    pub async fn count(&self) -> Result<u64, AuditError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM access_log", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(AuditError::from)
    }
}

#[async_trait]
impl AuditSink for SqliteAuditLog {
    async fn record(&self, entry: &AuditEntry) -> Result<i64, AuditError> {
        let checks = serde_json::to_string(&entry.checks)?;
        let params = (
            entry.attempt_id.to_string(),
            timestamp(entry.captured_at),
            entry.claimed_code.clone(),
            entry.frame_count as i64,
            entry.decision.as_str(),
            entry.reason.message(),
            entry.score.map(f64::from),
            entry.matched_identity.clone(),
            entry.owner_identity.clone(),
            checks,
        );

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO access_log (attempt_id, captured_at, claimed_code, frame_count,
                         decision, reason, score, matched_identity, owner_identity, checks)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params,
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        tracing::debug!(record_id = id, attempt_id = %entry.attempt_id, "audit entry recorded");
        Ok(id)
    }
}

/// Fixed-width UTC timestamps so text order equals time order.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct RawRow {
    id: i64,
    attempt_id: String,
    captured_at: String,
    claimed_code: String,
    frame_count: i64,
    decision: String,
    reason: String,
    score: Option<f64>,
    matched_identity: Option<String>,
    owner_identity: Option<String>,
    checks: String,
}

impl RawRow {
    fn into_record(self) -> Result<AuditRecord, AuditError> {
        let id = self.id;
        let corrupt = |detail: String| AuditError::Corrupt { id, detail };

        let attempt_id = Uuid::parse_str(&self.attempt_id).map_err(|e| corrupt(e.to_string()))?;
        let captured_at = DateTime::parse_from_rfc3339(&self.captured_at)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc);
        let decision = self
            .decision
            .parse()
            .map_err(|e: ParseError| corrupt(e.to_string()))?;
        let reason = self
            .reason
            .parse()
            .map_err(|e: ParseError| corrupt(e.to_string()))?;
        let frame_count = usize::try_from(self.frame_count).map_err(|e| corrupt(e.to_string()))?;

        Ok(AuditRecord {
            id,
            entry: AuditEntry {
                attempt_id,
                captured_at,
                claimed_code: self.claimed_code,
                frame_count,
                decision,
                reason,
                score: self.score.map(|s| s as f32),
                matched_identity: self.matched_identity,
                owner_identity: self.owner_identity,
                checks: serde_json::from_str(&self.checks)?,
            },
        })
    }
}
