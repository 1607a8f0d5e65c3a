//! SQLite store of raw RPC responses, keyed by a content hash of the request.
//!
//! Only immutable responses belong here (finalized `getBlock` results). The cache lets a
//! reset dataset be rebuilt without hitting the node again, and backs offline mode.

use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ResponseCache {
    conn: Mutex<Connection>,
}

impl ResponseCache {
    /// Open or create the cache database at `path`, creating parent dirs.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS rpc_responses (
                key TEXT PRIMARY KEY,
                method TEXT NOT NULL,
                body TEXT NOT NULL,
                created_utc INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rpc_responses_method ON rpc_responses(method);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// SHA-256 (hex) over the method name and its serialized params.
    pub fn key_for(method: &str, params: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update([0u8]);
        hasher.update(params.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheError> {
        self.conn
            .lock()
            .map_err(|e| CacheError::Io(std::io::Error::other(e.to_string())))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM rpc_responses WHERE key = ?1")?;
        let row = stmt
            .query_row([key], |r| r.get::<_, String>(0))
            .optional()?;
        Ok(row)
    }

    pub fn put(&self, key: &str, method: &str, body: &str) -> Result<(), CacheError> {
        let created = time::OffsetDateTime::now_utc().unix_timestamp();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO rpc_responses (key, method, body, created_utc) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![key, method, body, created],
        )?;
        Ok(())
    }

    /// Number of cached responses.
    pub fn len(&self) -> Result<u64, CacheError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM rpc_responses", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}
