//! End-to-end worker scenarios against in-memory fakes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use scrape_pool::error::{ExecError, QueueError};
use scrape_pool::proxy::{Proxy, ProxyConfig, ProxyPool};
use scrape_pool::queue::{
    JobPhase, JobQueue, JobRequest, Product, ResultRecord, StatusRecord,
};
use scrape_pool::session::pool::PoolConfig;
use scrape_pool::session::{LibSqlSessionStore, Session, SessionPool, SessionStore};
use scrape_pool::worker::{
    DispatchWorker, EngineFactory, ItemRequest, ScrapeEngine, WorkerConfig, WorkerDeps,
};

// ── Fakes ───────────────────────────────────────────────────────────────

struct MemoryQueue {
    jobs: Mutex<VecDeque<String>>,
    statuses: Mutex<Vec<(String, StatusRecord, Duration)>>,
    results: Mutex<Vec<(String, ResultRecord, Duration)>>,
}

impl MemoryQueue {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
        }
    }

    fn statuses_for(&self, job_id: &str) -> Vec<StatusRecord> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == job_id)
            .map(|(_, record, _)| record.clone())
            .collect()
    }

    fn last_result(&self, job_id: &str) -> Option<(ResultRecord, Duration)> {
        self.results
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == job_id)
            .map(|(_, record, ttl)| (record.clone(), *ttl))
            .next_back()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn pop(&self, _timeout: Duration) -> Result<Option<(String, String)>, QueueError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .pop_front()
            .map(|payload| ("scrape_queue".to_string(), payload)))
    }

    async fn put_status(
        &self,
        job_id: &str,
        record: &StatusRecord,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        self.statuses
            .lock()
            .unwrap()
            .push((job_id.to_string(), record.clone(), ttl));
        Ok(())
    }

    async fn put_result(
        &self,
        job_id: &str,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        self.results
            .lock()
            .unwrap()
            .push((job_id.to_string(), record.clone(), ttl));
        Ok(())
    }
}

/// Engine that fails items by name and records the partition keys it saw.
struct ScriptedEngine {
    failing_items: Vec<String>,
    block_on: Vec<String>,
    seen_zip_codes: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ScrapeEngine for ScriptedEngine {
    async fn execute(
        &mut self,
        _session: &Session,
        _proxy: Option<&Proxy>,
        request: &ItemRequest,
    ) -> Result<Vec<Product>, ExecError> {
        self.seen_zip_codes
            .lock()
            .unwrap()
            .push(request.zip_code.clone());

        if self.block_on.contains(&request.item) {
            return Err(ExecError::Blocked { status: 403 });
        }
        if self.failing_items.contains(&request.item) {
            return Err(ExecError::Http("connection reset".to_string()));
        }

        Ok(vec![Product {
            title: format!("{} result", request.item),
            price: Some(2.49),
            original_price: None,
            merchant: Some("Test Market".to_string()),
            rating: None,
            review_count: None,
            image_url: None,
            product_id: None,
        }])
    }
}

struct ScriptedFactory {
    failing_items: Vec<String>,
    block_on: Vec<String>,
    seen_zip_codes: Arc<Mutex<Vec<String>>>,
    acquired: AtomicUsize,
}

impl ScriptedFactory {
    fn new() -> Self {
        Self {
            failing_items: Vec::new(),
            block_on: Vec::new(),
            seen_zip_codes: Arc::new(Mutex::new(Vec::new())),
            acquired: AtomicUsize::new(0),
        }
    }

    fn failing_on(items: &[&str]) -> Self {
        Self {
            failing_items: items.iter().map(|s| s.to_string()).collect(),
            ..Self::new()
        }
    }

    fn blocking_on(items: &[&str]) -> Self {
        Self {
            block_on: items.iter().map(|s| s.to_string()).collect(),
            ..Self::new()
        }
    }
}

#[async_trait]
impl EngineFactory for ScriptedFactory {
    async fn acquire(&self) -> Result<Box<dyn ScrapeEngine>, ExecError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            failing_items: self.failing_items.clone(),
            block_on: self.block_on.clone(),
            seen_zip_codes: self.seen_zip_codes.clone(),
        }))
    }
}

/// Factory whose engines can never be acquired.
struct BrokenFactory;

#[async_trait]
impl EngineFactory for BrokenFactory {
    async fn acquire(&self) -> Result<Box<dyn ScrapeEngine>, ExecError> {
        Err(ExecError::EngineUnavailable(
            "browser failed to start".to_string(),
        ))
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    worker: DispatchWorker,
    queue: Arc<MemoryQueue>,
    store: Arc<LibSqlSessionStore>,
    proxies: Arc<ProxyPool>,
}

async fn harness(factory: Arc<dyn EngineFactory>, proxy_entries: &[&str]) -> Harness {
    let store = Arc::new(LibSqlSessionStore::new_memory().await.unwrap());
    let sessions = Arc::new(SessionPool::new(
        store.clone() as Arc<dyn SessionStore>,
        PoolConfig::default(),
    ));
    let entries: Vec<String> = proxy_entries.iter().map(|s| s.to_string()).collect();
    let proxies = Arc::new(ProxyPool::from_list(&entries, ProxyConfig::default()));
    let queue = Arc::new(MemoryQueue::new());

    let worker = DispatchWorker::new(
        WorkerConfig::default(),
        WorkerDeps {
            queue: queue.clone(),
            sessions,
            proxies: proxies.clone(),
            engines: factory,
        },
    );

    Harness {
        worker,
        queue,
        store,
        proxies,
    }
}

fn job(job_id: &str, items: &[&str], zip_code: &str) -> JobRequest {
    let items = items
        .iter()
        .map(|i| format!("\"{i}\""))
        .collect::<Vec<_>>()
        .join(",");
    serde_json::from_str(&format!(
        r#"{{"job_id":"{job_id}","items":[{items}],"zip_code":"{zip_code}"}}"#
    ))
    .unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn partial_item_failure_still_completes_the_job() {
    let factory = Arc::new(ScriptedFactory::failing_on(&["item2"]));
    let mut h = harness(factory.clone(), &[]).await;

    for url in ["u1", "u2", "u3"] {
        h.store
            .create(Session::new(url, "94110", "no_proxy"))
            .await
            .unwrap();
    }

    let job = job("job-b", &["item1", "item2", "item3"], "94110");
    h.worker.process_job(&job).await.unwrap();

    let (record, ttl) = h.queue.last_result("job-b").unwrap();
    assert_eq!(record.status, JobPhase::Complete);
    assert_eq!(ttl, WorkerConfig::default().result_ttl);

    let results = record.results.unwrap();
    assert_eq!(results.get("item2").unwrap().len(), 0);
    assert_eq!(results.get("item1").unwrap().len(), 1);
    assert_eq!(results.get("item3").unwrap().len(), 1);
    assert_eq!(record.zip_code.as_deref(), Some("94110"));
}

#[tokio::test]
async fn status_transitions_processing_then_complete() {
    let factory = Arc::new(ScriptedFactory::new());
    let mut h = harness(factory, &[]).await;
    h.store
        .create(Session::new("u1", "94110", "no_proxy"))
        .await
        .unwrap();
    h.store
        .create(Session::new("u2", "94110", "no_proxy"))
        .await
        .unwrap();

    let job = job("job-s", &["milk"], "94110");
    h.worker.process_job(&job).await.unwrap();

    let statuses = h.queue.statuses_for("job-s");
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].status, JobPhase::Processing);
    assert!(statuses[0].started_at.is_some());
    assert_eq!(statuses[0].zip_code, "94110");
    assert_eq!(statuses[1].status, JobPhase::Complete);
    assert!(statuses[1].completed_at.is_some());
}

#[tokio::test]
async fn partition_key_reaches_every_item_execution() {
    let factory = Arc::new(ScriptedFactory::new());
    let seen = factory.seen_zip_codes.clone();
    let mut h = harness(factory, &[]).await;

    for url in ["u1", "u2", "u3"] {
        h.store
            .create(Session::new(url, "60601", "no_proxy"))
            .await
            .unwrap();
    }

    let job = job("job-z", &["a", "b", "c"], "60601");
    h.worker.process_job(&job).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), ["60601", "60601", "60601"]);
}

#[tokio::test]
async fn engine_acquire_failure_writes_failed_records() {
    let mut h = harness(Arc::new(BrokenFactory), &[]).await;

    let job = job("job-f", &["milk"], "94110");
    let err = h.worker.process_job(&job).await;
    assert!(err.is_err());

    let (record, ttl) = h.queue.last_result("job-f").unwrap();
    assert_eq!(record.status, JobPhase::Failed);
    assert!(record.error.unwrap().contains("browser failed to start"));
    // Failed results stay diagnosable longer than successful ones
    assert_eq!(ttl, WorkerConfig::default().failed_result_ttl);
    assert!(ttl > WorkerConfig::default().result_ttl);

    let statuses = h.queue.statuses_for("job-f");
    assert_eq!(statuses.last().unwrap().status, JobPhase::Failed);
    assert!(statuses.last().unwrap().failed_at.is_some());
}

#[tokio::test]
async fn failing_item_marks_session_failure() {
    let factory = Arc::new(ScriptedFactory::failing_on(&["milk"]));
    let mut h = harness(factory, &[]).await;
    let created = h
        .store
        .create(Session::new("u1", "94110", "no_proxy"))
        .await
        .unwrap();

    let job = job("job-m", &["milk"], "94110");
    h.worker.process_job(&job).await.unwrap();

    let session = h.store.get(created.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(session.failure_count, 1);
    assert!(session.is_valid);
}

#[tokio::test]
async fn blocked_response_permanently_blocks_the_proxy() {
    let factory = Arc::new(ScriptedFactory::blocking_on(&["milk"]));
    let mut h = harness(factory, &["10.0.0.1:8080"]).await;
    h.store
        .create(Session::new("u1", "94110", "no_proxy"))
        .await
        .unwrap();

    let job = job("job-p", &["milk"], "94110");
    h.worker.process_job(&job).await.unwrap();

    let stats = h.proxies.stats();
    assert_eq!(stats.blocked, 1);
    assert!(h.proxies.get_next_proxy().is_none());
}

#[tokio::test]
async fn repeated_failures_invalidate_the_session_and_keep_completing_jobs() {
    let factory = Arc::new(ScriptedFactory::failing_on(&["milk"]));
    let mut h = harness(factory, &[]).await;
    let created = h
        .store
        .create(Session::new("u1", "94110", "no_proxy"))
        .await
        .unwrap();

    // Three failing jobs cross the session's failure threshold
    for i in 0..3 {
        let job = job(&format!("job-{i}"), &["milk"], "94110");
        h.worker.process_job(&job).await.unwrap();
    }

    let session = h.store.get(created.id.unwrap()).await.unwrap().unwrap();
    assert!(!session.is_valid);

    // Pool is now dry; the next job still completes, with an empty entry
    let job = job("job-dry", &["milk"], "94110");
    h.worker.process_job(&job).await.unwrap();
    let (record, _) = h.queue.last_result("job-dry").unwrap();
    assert_eq!(record.status, JobPhase::Complete);
    assert_eq!(record.results.unwrap().get("milk").unwrap().len(), 0);
}
