//! Session pool manager — the only component the request path talks to for
//! acquiring and reporting on sessions.
//!
//! Encapsulates the refill policy: acquisition never blocks on session
//! minting. When the pool runs low (or dry) for a region, registered refill
//! callbacks are fired and the caller proceeds immediately with whatever the
//! pool had.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::session::model::{Session, SessionLimits};
use crate::session::store::SessionStore;

/// Pool policy knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Low-watermark: fewer healthy sessions than this triggers a refill.
    pub min_sessions_per_region: usize,
    /// How many candidates to pull from the store per acquisition.
    pub candidate_limit: usize,
    pub limits: SessionLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sessions_per_region: 2,
            candidate_limit: 10,
            limits: SessionLimits::default(),
        }
    }
}

/// Refill signal receiver. Callbacks must be fast and non-blocking (the
/// production callback pushes onto a bounded channel); errors are logged per
/// callback and never propagated to the acquiring caller.
pub type RefillCallback = Box<dyn Fn(Option<&str>) -> anyhow::Result<()> + Send + Sync>;

/// Per-region health summary.
#[derive(Debug, Clone, Serialize)]
pub struct RegionHealth {
    pub healthy_count: usize,
    pub is_healthy: bool,
    pub needs_refresh: bool,
}

/// Pool-wide status for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total_sessions: u64,
    pub valid_sessions: u64,
    pub success_rate: f64,
    pub regions: HashMap<String, RegionHealth>,
    pub pool_healthy: bool,
}

/// Policy layer over the session store.
pub struct SessionPool {
    store: Arc<dyn SessionStore>,
    config: PoolConfig,
    callbacks: std::sync::Mutex<Vec<RefillCallback>>,
    /// Serializes read-modify-write mutation within this process. Cross-process
    /// consistency stays last-writer-wins at the store.
    mutate_lock: tokio::sync::Mutex<()>,
}

impl SessionPool {
    pub fn new(store: Arc<dyn SessionStore>, config: PoolConfig) -> Self {
        Self {
            store,
            config,
            callbacks: std::sync::Mutex::new(Vec::new()),
            mutate_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a callback invoked (with the region) whenever the pool wants
    /// more sessions minted.
    pub fn register_refill_callback(&self, callback: RefillCallback) {
        self.callbacks
            .lock()
            .expect("refill callback mutex poisoned")
            .push(callback);
    }

    /// Get a healthy session for the region, least-recently-used first.
    ///
    /// Returns `None` when the pool is dry (after firing a refill signal).
    /// Running low also fires the signal, but the caller still gets its
    /// session immediately.
    pub async fn get_valid_session(
        &self,
        region: Option<&str>,
    ) -> Result<Option<Session>, StorageError> {
        let candidates = self
            .store
            .list_valid(region, self.config.candidate_limit)
            .await?;

        // The store can't express age expiry; re-check here.
        let mut healthy: Vec<Session> = candidates
            .into_iter()
            .filter(|s| s.is_healthy(&self.config.limits))
            .collect();

        if healthy.is_empty() {
            warn!(region = ?region, "No valid sessions available");
            self.trigger_refill(region);
            return Ok(None);
        }

        if healthy.len() < self.config.min_sessions_per_region {
            info!(
                region = ?region,
                remaining = healthy.len(),
                "Session pool running low, triggering refill"
            );
            self.trigger_refill(region);
        }

        Ok(Some(healthy.remove(0)))
    }

    /// Record a successful use and persist it.
    pub async fn mark_success(&self, session: &mut Session) -> Result<(), StorageError> {
        let _guard = self.mutate_lock.lock().await;

        session.mark_success();
        self.store.update(session).await?;

        debug!(
            session_id = ?session.id,
            total = session.success_count,
            "Session marked success"
        );
        Ok(())
    }

    /// Record a failed use and persist it. A session crossing its failure
    /// threshold is invalidated and a refill signal fires for its region.
    pub async fn mark_failure(
        &self,
        session: &mut Session,
        reason: Option<&str>,
    ) -> Result<(), StorageError> {
        let _guard = self.mutate_lock.lock().await;

        session.mark_failure(&self.config.limits);
        self.store.update(session).await?;

        warn!(
            session_id = ?session.id,
            failures = session.failure_count,
            valid = session.is_valid,
            reason = ?reason,
            "Session marked failure"
        );

        if !session.is_valid {
            error!(
                session_id = ?session.id,
                failures = session.failure_count,
                "Session invalidated"
            );
            self.trigger_refill(Some(&session.region));
        }
        Ok(())
    }

    /// Count of healthy sessions for the region.
    pub async fn healthy_count(&self, region: Option<&str>) -> Result<usize, StorageError> {
        let sessions = self.store.list_valid(region, 100).await?;
        Ok(sessions
            .iter()
            .filter(|s| s.is_healthy(&self.config.limits))
            .count())
    }

    /// Whether the pool holds at least the low-watermark of healthy sessions.
    pub async fn is_pool_healthy(&self, region: Option<&str>) -> Result<bool, StorageError> {
        Ok(self.healthy_count(region).await? >= self.config.min_sessions_per_region)
    }

    /// Invalidate sessions that are still marked valid but fail the health
    /// check (age-expired). Returns the count invalidated. Runs from the
    /// janitor, not the request path.
    pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
        let sessions = self.store.list_all().await?;
        let mut invalidated = 0;

        for session in sessions {
            if session.is_valid && !session.is_healthy(&self.config.limits) {
                if let Some(id) = session.id {
                    info!(session_id = id, age_minutes = session.age_minutes(), "Invalidating expired session");
                    self.store.invalidate(id).await?;
                    invalidated += 1;
                }
            }
        }

        if invalidated > 0 {
            info!(invalidated, "Cleaned up expired sessions");
        }
        Ok(invalidated)
    }

    /// Pool status for monitoring: store aggregates plus per-region health.
    pub async fn status(&self) -> Result<PoolStatus, StorageError> {
        let stats = self.store.stats().await?;

        let mut regions = HashMap::new();
        for region in stats.regions.keys() {
            let healthy_count = self.healthy_count(Some(region)).await?;
            let is_healthy = healthy_count >= self.config.min_sessions_per_region;
            regions.insert(
                region.clone(),
                RegionHealth {
                    healthy_count,
                    is_healthy,
                    needs_refresh: !is_healthy,
                },
            );
        }

        let pool_healthy = regions.values().all(|r| r.is_healthy);
        Ok(PoolStatus {
            total_sessions: stats.total_sessions,
            valid_sessions: stats.valid_sessions,
            success_rate: stats.success_rate,
            regions,
            pool_healthy,
        })
    }

    /// Fire every registered refill callback. One failing callback never
    /// breaks acquisition for other callers, and never stops later callbacks.
    fn trigger_refill(&self, region: Option<&str>) {
        let callbacks = self
            .callbacks
            .lock()
            .expect("refill callback mutex poisoned");

        for callback in callbacks.iter() {
            if let Err(e) = callback(region) {
                error!(region = ?region, error = %e, "Refill callback failed");
            }
        }
    }
}

/// Spawn the periodic janitor: invalidates age-expired sessions, then
/// hard-deletes records past the retention window.
pub fn spawn_janitor(
    pool: Arc<SessionPool>,
    store: Arc<dyn SessionStore>,
    interval: Duration,
    retention: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup isn't a sweep.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if let Err(e) = pool.cleanup_expired().await {
                warn!(error = %e, "Session cleanup sweep failed");
            }
            if let Err(e) = store.purge_older_than(retention).await {
                warn!(error = %e, "Session purge failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::session::libsql_store::LibSqlSessionStore;

    async fn test_pool() -> (Arc<SessionPool>, Arc<LibSqlSessionStore>) {
        let store = Arc::new(LibSqlSessionStore::new_memory().await.unwrap());
        let pool = Arc::new(SessionPool::new(store.clone(), PoolConfig::default()));
        (pool, store)
    }

    fn counting_callback(counter: Arc<AtomicUsize>) -> RefillCallback {
        Box::new(move |_region| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn empty_pool_returns_none_and_signals_once() {
        let (pool, _store) = test_pool().await;
        let regions = Arc::new(std::sync::Mutex::new(Vec::<Option<String>>::new()));
        let seen = regions.clone();
        pool.register_refill_callback(Box::new(move |region| {
            seen.lock().unwrap().push(region.map(str::to_string));
            Ok(())
        }));

        let session = pool.get_valid_session(Some("US")).await.unwrap();
        assert!(session.is_none());
        assert_eq!(
            regions.lock().unwrap().as_slice(),
            [Some("US".to_string())]
        );
    }

    #[tokio::test]
    async fn low_pool_returns_session_and_signals() {
        let (pool, store) = test_pool().await;
        let calls = Arc::new(AtomicUsize::new(0));
        pool.register_refill_callback(counting_callback(calls.clone()));

        // One session is below the watermark of two
        store.create(Session::new("u1", "US", "no_proxy")).await.unwrap();

        let session = pool.get_valid_session(Some("US")).await.unwrap();
        assert!(session.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_pool_does_not_signal() {
        let (pool, store) = test_pool().await;
        let calls = Arc::new(AtomicUsize::new(0));
        pool.register_refill_callback(counting_callback(calls.clone()));

        store.create(Session::new("u1", "US", "no_proxy")).await.unwrap();
        store.create(Session::new("u2", "US", "no_proxy")).await.unwrap();

        let session = pool.get_valid_session(Some("US")).await.unwrap();
        assert!(session.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_sessions_are_never_returned() {
        let (pool, store) = test_pool().await;
        let created = store.create(Session::new("u1", "US", "no_proxy")).await.unwrap();
        store.invalidate(created.id.unwrap()).await.unwrap();

        let session = pool.get_valid_session(Some("US")).await.unwrap();
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn expired_sessions_are_skipped() {
        let (pool, store) = test_pool().await;
        let mut expired = Session::new("u1", "US", "no_proxy");
        expired.created_at = chrono::Utc::now() - chrono::Duration::hours(2);
        store.create(expired).await.unwrap();

        let session = pool.get_valid_session(Some("US")).await.unwrap();
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn mark_failure_invalidates_at_threshold_and_signals() {
        let (pool, store) = test_pool().await;
        let calls = Arc::new(AtomicUsize::new(0));
        pool.register_refill_callback(counting_callback(calls.clone()));

        let mut session = store.create(Session::new("u1", "US", "no_proxy")).await.unwrap();
        pool.mark_failure(&mut session, Some("timeout")).await.unwrap();
        pool.mark_failure(&mut session, Some("timeout")).await.unwrap();
        assert!(session.is_valid);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        pool.mark_failure(&mut session, Some("timeout")).await.unwrap();
        assert!(!session.is_valid);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Invalidation is durable: acquisition can't see it any more
        let fetched = store.get(session.id.unwrap()).await.unwrap().unwrap();
        assert!(!fetched.is_valid);
        assert!(pool.get_valid_session(Some("US")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_success_persists() {
        let (pool, store) = test_pool().await;
        let mut session = store.create(Session::new("u1", "US", "no_proxy")).await.unwrap();

        pool.mark_success(&mut session).await.unwrap();

        let fetched = store.get(session.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(fetched.success_count, 1);
        assert!(fetched.last_used.is_some());
    }

    #[tokio::test]
    async fn failing_callback_does_not_stop_others() {
        let (pool, _store) = test_pool().await;
        let calls = Arc::new(AtomicUsize::new(0));

        pool.register_refill_callback(Box::new(|_| anyhow::bail!("refill channel full")));
        pool.register_refill_callback(counting_callback(calls.clone()));

        let session = pool.get_valid_session(Some("US")).await.unwrap();
        assert!(session.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_expired_invalidates_only_aged() {
        let (pool, store) = test_pool().await;

        let mut old = Session::new("u1", "US", "no_proxy");
        old.created_at = chrono::Utc::now() - chrono::Duration::hours(2);
        store.create(old).await.unwrap();
        store.create(Session::new("u2", "US", "no_proxy")).await.unwrap();

        let invalidated = pool.cleanup_expired().await.unwrap();
        assert_eq!(invalidated, 1);

        // Second sweep finds nothing new
        assert_eq!(pool.cleanup_expired().await.unwrap(), 0);

        let valid = store.list_valid(Some("US"), 10).await.unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].url, "u2");
    }

    #[tokio::test]
    async fn concurrent_failure_reports_are_last_writer_wins() {
        // Two callers holding copies of the same session each report a
        // failure; the second write clobbers the first, so only one
        // increment survives. This is the accepted soft-consistency model,
        // not a bug: cross-process counters are advisory, and invalidation
        // still converges once any copy crosses the threshold.
        let (pool, store) = test_pool().await;
        let session = store.create(Session::new("u1", "US", "no_proxy")).await.unwrap();

        let mut copy_a = session.clone();
        let mut copy_b = session.clone();
        pool.mark_failure(&mut copy_a, None).await.unwrap();
        pool.mark_failure(&mut copy_b, None).await.unwrap();

        let stored = store.get(session.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.failure_count, 1);
    }

    #[tokio::test]
    async fn pool_health_tracks_watermark() {
        let (pool, store) = test_pool().await;
        assert!(!pool.is_pool_healthy(Some("US")).await.unwrap());

        store.create(Session::new("u1", "US", "no_proxy")).await.unwrap();
        store.create(Session::new("u2", "US", "no_proxy")).await.unwrap();
        assert!(pool.is_pool_healthy(Some("US")).await.unwrap());
    }

    #[tokio::test]
    async fn status_reports_per_region_health() {
        let (pool, store) = test_pool().await;
        store.create(Session::new("u1", "US-West", "no_proxy")).await.unwrap();
        store.create(Session::new("u2", "US-West", "no_proxy")).await.unwrap();
        store.create(Session::new("u3", "US-East", "no_proxy")).await.unwrap();

        let status = pool.status().await.unwrap();
        assert_eq!(status.total_sessions, 3);
        assert!(status.regions.get("US-West").unwrap().is_healthy);
        let east = status.regions.get("US-East").unwrap();
        assert!(!east.is_healthy);
        assert!(east.needs_refresh);
        assert!(!status.pool_healthy);
    }
}
