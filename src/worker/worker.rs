//! Job dispatch worker — a single-threaded sequential loop that pulls jobs
//! from the queue and executes them against the session pool.
//!
//! The worker owns one long-lived engine and replaces it per the restart
//! policy, so the acquisition cost is paid once per policy window and
//! amortized across many jobs. Horizontal scale comes from running more
//! worker processes against the same queue and store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, ExecError};
use crate::proxy::ProxyPool;
use crate::queue::{JobQueue, JobRequest, Product, ResultRecord, StatusRecord};
use crate::session::SessionPool;
use crate::worker::engine::{EngineFactory, ItemRequest, ScrapeEngine};

/// Worker policy knobs.
///
/// The restart-policy and circuit-breaker defaults are production-tuned.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker identifier for logs and records; generated when `None`.
    pub worker_id: Option<String>,
    /// Queue to consume.
    pub queue_name: String,
    /// Blocking-pop timeout; bounds the loop so housekeeping stays live.
    pub pop_timeout: Duration,
    /// Back-off after a queue connectivity error.
    pub queue_retry_delay: Duration,
    /// Restart the engine after this many completed jobs...
    pub max_jobs_per_engine: u64,
    /// ...or once it is this old, whichever comes first.
    pub max_engine_age: Duration,
    /// Consecutive failed jobs before forcing an engine restart.
    pub max_consecutive_failures: u32,
    /// Hard timeout on a single item execution.
    pub item_timeout: Duration,
    /// TTL for `status:{job_id}` records.
    pub status_ttl: Duration,
    /// TTL for successful `result:{job_id}` records.
    pub result_ttl: Duration,
    /// TTL for failed result records; failed jobs must stay diagnosable
    /// longer than successful ones.
    pub failed_result_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            queue_name: "scrape_queue".to_string(),
            pop_timeout: Duration::from_secs(5),
            queue_retry_delay: Duration::from_secs(10),
            max_jobs_per_engine: 50,
            max_engine_age: Duration::from_secs(30 * 60), // 30 minutes
            max_consecutive_failures: 5,
            item_timeout: Duration::from_secs(45),
            status_ttl: Duration::from_secs(60 * 60), // 1 hour
            result_ttl: Duration::from_secs(30),
            failed_result_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Shared dependencies for the worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn JobQueue>,
    pub sessions: Arc<SessionPool>,
    pub proxies: Arc<ProxyPool>,
    pub engines: Arc<dyn EngineFactory>,
}

/// Sequential job consumer with a restartable long-lived engine.
pub struct DispatchWorker {
    deps: WorkerDeps,
    config: WorkerConfig,
    worker_id: String,
    engine: Option<Box<dyn ScrapeEngine>>,
    engine_started: Option<Instant>,
    jobs_since_restart: u64,
    jobs_completed: u64,
}

impl DispatchWorker {
    pub fn new(config: WorkerConfig, deps: WorkerDeps) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", &Uuid::new_v4().to_string()[..8]));

        info!(
            worker_id = %worker_id,
            max_jobs = config.max_jobs_per_engine,
            max_age_secs = config.max_engine_age.as_secs(),
            "Worker initialized"
        );

        Self {
            deps,
            config,
            worker_id,
            engine: None,
            engine_started: None,
            jobs_since_restart: 0,
            jobs_completed: 0,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn should_restart_engine(&self) -> bool {
        let Some(started) = self.engine_started else {
            return true; // never initialized
        };
        if self.engine.is_none() {
            return true;
        }

        if self.jobs_since_restart >= self.config.max_jobs_per_engine {
            info!(
                jobs = self.jobs_since_restart,
                limit = self.config.max_jobs_per_engine,
                "Engine restart due: job count"
            );
            return true;
        }

        let age = started.elapsed();
        if age >= self.config.max_engine_age {
            info!(
                age_secs = age.as_secs(),
                limit_secs = self.config.max_engine_age.as_secs(),
                "Engine restart due: age"
            );
            return true;
        }

        false
    }

    /// Tear down any existing engine and acquire a fresh one.
    async fn restart_engine(&mut self) -> Result<(), ExecError> {
        if let Some(mut old) = self.engine.take() {
            info!("Shutting down old engine");
            old.shutdown().await;
        }

        let start = Instant::now();
        let engine = self.deps.engines.acquire().await?;
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "Engine ready");

        self.engine = Some(engine);
        self.engine_started = Some(Instant::now());
        self.jobs_since_restart = 0;
        Ok(())
    }

    /// Apply the restart policy; may block for the duration of acquiring the
    /// engine. Intentionally synchronous and on the critical path, bounded by
    /// the policy's low frequency.
    pub async fn ensure_engine_ready(&mut self) -> Result<(), ExecError> {
        if self.should_restart_engine() {
            self.restart_engine().await?;
        }
        Ok(())
    }

    /// Process one job. On success the terminal `complete` status/result
    /// records are written inside; on an escaping error this writes a
    /// `failed` result (with the error message and the longer TTL) and a
    /// `failed` status, so the job's consumer never observes a hang.
    pub async fn process_job(&mut self, job: &JobRequest) -> Result<(), Error> {
        info!(
            job_id = %job.job_id,
            items = job.items.len(),
            zip_code = %job.zip_code,
            prioritize_nearby = job.prioritize_nearby,
            max_products = job.max_products_per_item,
            "Starting job"
        );

        match self.execute_job(job).await {
            Ok(()) => {
                self.jobs_completed += 1;
                self.jobs_since_restart += 1;
                Ok(())
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Job failed");

                let result = ResultRecord::failed(&self.worker_id, e.to_string());
                if let Err(qe) = self
                    .deps
                    .queue
                    .put_result(&job.job_id, &result, self.config.failed_result_ttl)
                    .await
                {
                    error!(job_id = %job.job_id, error = %qe, "Failed to persist failed result");
                }

                let status = StatusRecord::failed(job, &self.worker_id);
                if let Err(qe) = self
                    .deps
                    .queue
                    .put_status(&job.job_id, &status, self.config.status_ttl)
                    .await
                {
                    error!(job_id = %job.job_id, error = %qe, "Failed to persist failed status");
                }

                Err(e)
            }
        }
    }

    async fn execute_job(&mut self, job: &JobRequest) -> Result<(), Error> {
        self.ensure_engine_ready().await?;

        let queue = self.deps.queue.clone();
        let sessions = self.deps.sessions.clone();
        let proxies = self.deps.proxies.clone();
        let worker_id = self.worker_id.clone();
        let item_timeout = self.config.item_timeout;

        queue
            .put_status(
                &job.job_id,
                &StatusRecord::processing(job, &worker_id),
                self.config.status_ttl,
            )
            .await?;

        let started = Instant::now();
        let mut results: BTreeMap<String, Vec<Product>> = BTreeMap::new();

        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| ExecError::EngineUnavailable("engine not initialized".to_string()))?;

        for (i, item) in job.items.iter().enumerate() {
            debug!(
                job_id = %job.job_id,
                item = %item,
                position = i + 1,
                total = job.items.len(),
                "Executing item"
            );

            let request = ItemRequest::for_item(job, item);

            // Region = the job's partition key. An empty pool is the item's
            // failure, never the job's.
            let session = match sessions.get_valid_session(Some(&job.zip_code)).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "Session acquisition failed");
                    None
                }
            };

            let (outcome, proxy) = match session.as_ref() {
                None => (Err(ExecError::NoSession), None),
                Some(s) => {
                    let proxy = proxies.get_next_proxy();
                    let outcome = match tokio::time::timeout(
                        item_timeout,
                        engine.execute(s, proxy.as_ref(), &request),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ExecError::Timeout(item_timeout)),
                    };
                    (outcome, proxy)
                }
            };

            match outcome {
                Ok(products) => {
                    if let Some(mut s) = session {
                        if let Err(e) = sessions.mark_success(&mut s).await {
                            warn!(session_id = ?s.id, error = %e, "Failed to record session success");
                        }
                    }
                    info!(item = %item, products = products.len(), "Item complete");
                    results.insert(item.clone(), products);
                }
                Err(err) => {
                    warn!(job_id = %job.job_id, item = %item, error = %err, "Item failed");

                    if let Some(mut s) = session {
                        if let Err(e) = sessions.mark_failure(&mut s, Some(&err.to_string())).await
                        {
                            warn!(session_id = ?s.id, error = %e, "Failed to record session failure");
                        }
                    }
                    if let Some(ref p) = proxy {
                        proxies.report_failure(p, matches!(err, ExecError::Blocked { .. }));
                    }

                    // Partial failure is per-item: record an empty entry and
                    // move on.
                    results.insert(item.clone(), Vec::new());
                }
            }
        }

        let elapsed = started.elapsed();

        queue
            .put_result(
                &job.job_id,
                &ResultRecord::complete(job, &worker_id, results, elapsed),
                self.config.result_ttl,
            )
            .await?;
        queue
            .put_status(
                &job.job_id,
                &StatusRecord::complete(job, &worker_id),
                self.config.status_ttl,
            )
            .await?;

        info!(
            job_id = %job.job_id,
            items = job.items.len(),
            elapsed_secs = elapsed.as_secs_f64(),
            "Job complete"
        );
        Ok(())
    }

    /// Main loop: pop, process, housekeep. Queue connectivity failures back
    /// off and retry; repeated job failures trip the circuit breaker and
    /// force an engine restart regardless of the normal policy.
    pub async fn run(mut self) {
        info!(
            worker_id = %self.worker_id,
            queue = %self.config.queue_name,
            "Worker ready, waiting for jobs"
        );

        let mut consecutive_failures: u32 = 0;

        loop {
            match self.deps.queue.pop(self.config.pop_timeout).await {
                Ok(Some((_, payload))) => {
                    let job: JobRequest = match serde_json::from_str(&payload) {
                        Ok(job) => job,
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed job payload");
                            continue;
                        }
                    };

                    match self.process_job(&job).await {
                        Ok(()) => consecutive_failures = 0,
                        Err(_) => {
                            consecutive_failures += 1;
                            warn!(consecutive_failures, "Job failed");
                        }
                    }

                    if consecutive_failures >= self.config.max_consecutive_failures {
                        error!(
                            consecutive_failures,
                            "Too many consecutive failures, restarting engine"
                        );
                        if let Err(e) = self.restart_engine().await {
                            error!(error = %e, "Engine restart failed");
                        }
                        consecutive_failures = 0;
                    }
                }
                Ok(None) => {
                    // Idle housekeeping tick
                    if self.jobs_completed > 0 && self.jobs_completed % 10 == 0 {
                        debug!(jobs_completed = self.jobs_completed, "No jobs in queue");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Queue connection error, backing off");
                    tokio::time::sleep(self.config.queue_retry_delay).await;
                }
            }
        }
    }
}
