//! Badge credentials as seen by the verifier.
//!
//! The verifier only reads credentials. Users and badges are managed by an
//! external administration surface that writes the same `users` / `badges`
//! tables.

use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use tokio_rusqlite::Connection;

/// Codes at or above this length are rejected before any lookup.
pub const MAX_CODE_LEN: usize = 1000;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("badge {code:?} has unparseable expiry {value:?}")]
    InvalidExpiry { code: String, value: String },
}

/// Account a badge belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub face_id: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub code: String,
    /// Last day the badge is valid. `None` never expires.
    pub expires_on: Option<NaiveDate>,
    /// `None` when the badge references a user that no longer exists.
    pub owner: Option<Owner>,
}

impl Credential {
    /// Expired strictly after the expiry date: a badge is still valid on it.
    pub fn is_expired(&self, on: NaiveDate) -> bool {
        self.expires_on.is_some_and(|expiry| expiry < on)
    }

    /// Owner's face id, if the owner exists and is active.
    pub fn active_owner(&self) -> Option<&str> {
        self.owner
            .as_ref()
            .filter(|owner| owner.active)
            .map(|owner| owner.face_id.as_str())
    }
}

/// Whether a claimed code is worth looking up.
pub fn is_well_formed_code(code: &str) -> bool {
    !code.is_empty() && code.chars().count() < MAX_CODE_LEN
}

/// Read-only credential lookup.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when no badge carries `code`.
    async fn lookup(&self, code: &str) -> Result<Option<Credential>, CredentialError>;
}

/// Credential lookup over the access-control SQLite database.
#[derive(Clone)]
pub struct SqliteCredentialStore {
    conn: Connection,
}

impl SqliteCredentialStore {
    /// Open the database, creating the tables if they do not exist yet.
    pub async fn open(db_path: &Path) -> Result<Self, CredentialError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS users (
                     id INTEGER PRIMARY KEY,
                     face_id TEXT UNIQUE,
                     is_active INTEGER NOT NULL DEFAULT 1,
                     first_name TEXT,
                     last_name TEXT
                 );
                 CREATE TABLE IF NOT EXISTS badges (
                     id INTEGER PRIMARY KEY,
                     qr_code TEXT UNIQUE,
                     valid_until TEXT,
                     user_id INTEGER REFERENCES users(id)
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    #[cfg(test)]
    async fn add_user(&self, face_id: &str, active: bool) -> i64 {
        let face_id = face_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (face_id, is_active) VALUES (?1, ?2)",
                    rusqlite::params![face_id, active],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .unwrap()
    }

    #[cfg(test)]
    async fn add_badge(&self, code: &str, valid_until: Option<&str>, user_id: i64) {
        let code = code.to_string();
        let valid_until = valid_until.map(str::to_string);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO badges (qr_code, valid_until, user_id) VALUES (?1, ?2, ?3)",
                    rusqlite::params![code, valid_until, user_id],
                )?;
                Ok(())
            })
            .await
            .unwrap()
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn lookup(&self, code: &str) -> Result<Option<Credential>, CredentialError> {
        let code_owned = code.to_string();
        let row: Option<(Option<String>, Option<String>, Option<bool>)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT b.valid_until, u.face_id, u.is_active
                     FROM badges b LEFT JOIN users u ON u.id = b.user_id
                     WHERE b.qr_code = ?1",
                )?;
                let mut rows = stmt.query([&code_owned])?;
                match rows.next()? {
                    Some(row) => Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?))),
                    None => Ok(None),
                }
            })
            .await?;

        let Some((valid_until, face_id, is_active)) = row else {
            return Ok(None);
        };

        let expires_on = match valid_until {
            Some(value) => Some(parse_expiry(&value).ok_or_else(|| {
                CredentialError::InvalidExpiry {
                    code: code.to_string(),
                    value,
                }
            })?),
            None => None,
        };

        let owner = face_id.map(|face_id| Owner {
            face_id,
            active: is_active.unwrap_or(false),
        });

        Ok(Some(Credential {
            code: code.to_string(),
            expires_on,
            owner,
        }))
    }
}

/// Accepts plain dates and date-times; only the date part matters.
fn parse_expiry(value: &str) -> Option<NaiveDate> {
    let date = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
