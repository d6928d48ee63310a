//! `SessionStore` trait — the single async interface for session persistence.
//!
//! The store is the sole writer of session state to stable storage; the pool
//! manager and producer go through it for every mutation. Backends must be
//! safe for concurrent access from multiple worker processes (last writer
//! wins, see the pool's locking notes).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StorageError;
use crate::session::model::Session;

/// Per-region session counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegionStats {
    pub total: u64,
    pub valid: u64,
}

/// Aggregate store statistics, computed by scanning.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_sessions: u64,
    pub valid_sessions: u64,
    pub invalid_sessions: u64,
    pub regions: HashMap<String, RegionStats>,
    pub total_requests: u64,
    /// Percentage of successful uses across all sessions; 0 when unused.
    pub success_rate: f64,
}

/// Backend-agnostic persistence for [`Session`] records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a not-yet-persisted session and return it with its assigned id.
    async fn create(&self, session: Session) -> Result<Session, StorageError>;

    /// Fetch a session by id.
    async fn get(&self, id: i64) -> Result<Option<Session>, StorageError>;

    /// Full-record update by id. Last writer wins.
    async fn update(&self, session: &Session) -> Result<(), StorageError>;

    /// Valid sessions, least-recently-used first (never-used sessions sort
    /// before all used ones). Callers must still re-check `is_healthy()` —
    /// age expiry is not expressed as a storage predicate.
    async fn list_valid(
        &self,
        region: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Session>, StorageError>;

    /// All sessions, newest first. For maintenance and monitoring, not the
    /// request path.
    async fn list_all(&self) -> Result<Vec<Session>, StorageError>;

    /// Set `is_valid = false`. Idempotent.
    async fn invalidate(&self, id: i64) -> Result<(), StorageError>;

    /// Hard-delete sessions created more than `retention` ago.
    /// Returns the number of rows deleted.
    async fn purge_older_than(&self, retention: Duration) -> Result<usize, StorageError>;

    /// Aggregate counters for observability.
    async fn stats(&self) -> Result<StoreStats, StorageError>;
}
