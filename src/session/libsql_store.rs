//! libSQL backend for the session store.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and safe
//! for concurrent async use.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::session::model::Session;
use crate::session::store::{RegionStats, SessionStore, StoreStats};

const SESSION_COLUMNS: &str =
    "id, url, region, proxy_bucket, created_at, last_used, success_count, failure_count, is_valid";

/// libSQL-backed [`SessionStore`].
pub struct LibSqlSessionStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlSessionStore {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn new_local(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StorageError::Pool(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StorageError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Session database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StorageError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StorageError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StorageError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Create the table and indexes if they don't exist. Idempotent.
    async fn init_schema(&self) -> Result<(), StorageError> {
        self.conn()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    url TEXT NOT NULL,
                    region TEXT NOT NULL,
                    proxy_bucket TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    last_used TEXT,
                    success_count INTEGER NOT NULL DEFAULT 0,
                    failure_count INTEGER NOT NULL DEFAULT 0,
                    is_valid INTEGER NOT NULL DEFAULT 1
                );
                CREATE INDEX IF NOT EXISTS idx_sessions_region_valid
                    ON sessions(region, is_valid);
                CREATE INDEX IF NOT EXISTS idx_sessions_created_at
                    ON sessions(created_at DESC);",
            )
            .await
            .map_err(|e| StorageError::Query(format!("init_schema: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 datetime string (our canonical write format).
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Map a row (column order = `SESSION_COLUMNS`) to a [`Session`].
fn row_to_session(row: &libsql::Row) -> Result<Session, libsql::Error> {
    let id: i64 = row.get(0)?;
    let url: String = row.get(1)?;
    let region: String = row.get(2)?;
    let proxy_bucket: String = row.get(3)?;
    let created_str: String = row.get(4)?;
    let last_used_str: Option<String> = row.get::<String>(5).ok();
    let success_count: i64 = row.get(6)?;
    let failure_count: i64 = row.get(7)?;
    let is_valid: i64 = row.get(8)?;

    Ok(Session {
        id: Some(id),
        url,
        region,
        proxy_bucket,
        created_at: parse_datetime(&created_str),
        last_used: last_used_str.as_deref().map(parse_datetime),
        success_count: success_count.max(0) as u32,
        failure_count: failure_count.max(0) as u32,
        is_valid: is_valid != 0,
    })
}

/// Convert `Option<DateTime<Utc>>` to a libsql Value.
fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl SessionStore for LibSqlSessionStore {
    async fn create(&self, mut session: Session) -> Result<Session, StorageError> {
        if session.id.is_some() {
            return Err(StorageError::Constraint(
                "session already has an id".to_string(),
            ));
        }

        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions (url, region, proxy_bucket, created_at, last_used, success_count, failure_count, is_valid) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.url.clone(),
                session.region.clone(),
                session.proxy_bucket.clone(),
                session.created_at.to_rfc3339(),
                opt_datetime(session.last_used),
                session.success_count as i64,
                session.failure_count as i64,
                session.is_valid as i64,
            ],
        )
        .await
        .map_err(|e| StorageError::Constraint(format!("create: {e}")))?;

        session.id = Some(conn.last_insert_rowid());
        debug!(session_id = ?session.id, region = %session.region, "Session created");
        Ok(session)
    }

    async fn get(&self, id: i64) -> Result<Option<Session>, StorageError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| StorageError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let session = row_to_session(&row)
                    .map_err(|e| StorageError::Query(format!("get row parse: {e}")))?;
                Ok(Some(session))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::Query(format!("get: {e}"))),
        }
    }

    async fn update(&self, session: &Session) -> Result<(), StorageError> {
        let id = session.id.ok_or(StorageError::Unpersisted)?;

        self.conn()
            .execute(
                "UPDATE sessions SET url = ?1, region = ?2, proxy_bucket = ?3, last_used = ?4, success_count = ?5, failure_count = ?6, is_valid = ?7 WHERE id = ?8",
                params![
                    session.url.clone(),
                    session.region.clone(),
                    session.proxy_bucket.clone(),
                    opt_datetime(session.last_used),
                    session.success_count as i64,
                    session.failure_count as i64,
                    session.is_valid as i64,
                    id,
                ],
            )
            .await
            .map_err(|e| StorageError::Query(format!("update: {e}")))?;

        Ok(())
    }

    async fn list_valid(
        &self,
        region: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Session>, StorageError> {
        let conn = self.conn();
        // ASC sorts NULLs first, so never-used sessions surface before all
        // used ones.
        let mut rows = match region {
            Some(region) => conn
                .query(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions WHERE is_valid = 1 AND region = ?1 ORDER BY last_used ASC, created_at ASC LIMIT ?2"
                    ),
                    params![region, limit as i64],
                )
                .await,
            None => conn
                .query(
                    &format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions WHERE is_valid = 1 ORDER BY last_used ASC, created_at ASC LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await,
        }
        .map_err(|e| StorageError::Query(format!("list_valid: {e}")))?;

        let mut sessions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_session(&row) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!("Skipping session row: {e}"),
            }
        }
        Ok(sessions)
    }

    async fn list_all(&self) -> Result<Vec<Session>, StorageError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC"),
                (),
            )
            .await
            .map_err(|e| StorageError::Query(format!("list_all: {e}")))?;

        let mut sessions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_session(&row) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!("Skipping session row: {e}"),
            }
        }
        Ok(sessions)
    }

    async fn invalidate(&self, id: i64) -> Result<(), StorageError> {
        self.conn()
            .execute(
                "UPDATE sessions SET is_valid = 0 WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| StorageError::Query(format!("invalidate: {e}")))?;

        debug!(session_id = id, "Session invalidated");
        Ok(())
    }

    async fn purge_older_than(&self, retention: Duration) -> Result<usize, StorageError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);

        let deleted = self
            .conn()
            .execute(
                "DELETE FROM sessions WHERE created_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| StorageError::Query(format!("purge_older_than: {e}")))?;

        if deleted > 0 {
            info!(deleted, "Purged old sessions");
        }
        Ok(deleted as usize)
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        let conn = self.conn();

        let mut rows = conn
            .query(
                "SELECT COUNT(*), TOTAL(is_valid), TOTAL(success_count), TOTAL(failure_count) FROM sessions",
                (),
            )
            .await
            .map_err(|e| StorageError::Query(format!("stats: {e}")))?;

        let (total, valid, total_success, total_failure) = match rows.next().await {
            Ok(Some(row)) => {
                let total: i64 = row.get(0).unwrap_or(0);
                let valid: f64 = row.get(1).unwrap_or(0.0);
                let success: f64 = row.get(2).unwrap_or(0.0);
                let failure: f64 = row.get(3).unwrap_or(0.0);
                (total as u64, valid as u64, success as u64, failure as u64)
            }
            _ => (0, 0, 0, 0),
        };

        let mut regions: HashMap<String, RegionStats> = HashMap::new();
        let mut rows = conn
            .query(
                "SELECT region, COUNT(*), TOTAL(is_valid) FROM sessions GROUP BY region",
                (),
            )
            .await
            .map_err(|e| StorageError::Query(format!("stats regions: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let region: String = match row.get(0) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let region_total: i64 = row.get(1).unwrap_or(0);
            let region_valid: f64 = row.get(2).unwrap_or(0.0);
            regions.insert(
                region,
                RegionStats {
                    total: region_total as u64,
                    valid: region_valid as u64,
                },
            );
        }

        let total_requests = total_success + total_failure;
        let success_rate = if total_requests > 0 {
            total_success as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        };

        Ok(StoreStats {
            total_sessions: total,
            valid_sessions: valid,
            invalid_sessions: total - valid,
            regions,
            total_requests,
            success_rate,
        })
    }
}
