//! Job queue boundary — blocking pop for inbound work, TTL'd status and
//! result records for outbound state.
//!
//! The transport is Redis (`BRPOP` on a named list, `SETEX` for records),
//! behind a trait so tests can substitute an in-memory queue. Payloads are
//! JSON; parsing stays with the worker so a malformed payload can be skipped
//! without tearing down the transport.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::QueueError;

fn default_max_products() -> usize {
    20
}

fn default_true() -> bool {
    true
}

/// An externally-submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    /// Line items, processed in submission order.
    pub items: Vec<String>,
    /// Partition key; forwarded unchanged to every item execution.
    pub zip_code: String,
    #[serde(default = "default_max_products")]
    pub max_products_per_item: usize,
    #[serde(default = "default_true")]
    pub prioritize_nearby: bool,
}

/// One result row from an item execution. Opaque to the core — carried
/// verbatim into the result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
}

/// Terminal and in-flight phases of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Processing,
    Complete,
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Persisted as `status:{job_id}`. Lives longer than the result record so a
/// crashed worker is still diagnosable after the result has expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: JobPhase,
    pub worker_id: String,
    pub zip_code: String,
    pub items: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl StatusRecord {
    pub fn processing(job: &JobRequest, worker_id: &str) -> Self {
        Self {
            status: JobPhase::Processing,
            worker_id: worker_id.to_string(),
            zip_code: job.zip_code.clone(),
            items: job.items.clone(),
            started_at: Some(Utc::now()),
            completed_at: None,
            failed_at: None,
        }
    }

    pub fn complete(job: &JobRequest, worker_id: &str) -> Self {
        Self {
            status: JobPhase::Complete,
            worker_id: worker_id.to_string(),
            zip_code: job.zip_code.clone(),
            items: job.items.clone(),
            started_at: None,
            completed_at: Some(Utc::now()),
            failed_at: None,
        }
    }

    pub fn failed(job: &JobRequest, worker_id: &str) -> Self {
        Self {
            status: JobPhase::Failed,
            worker_id: worker_id.to_string(),
            zip_code: job.zip_code.clone(),
            items: job.items.clone(),
            started_at: None,
            completed_at: None,
            failed_at: Some(Utc::now()),
        }
    }
}

/// Persisted as `result:{job_id}`. Short TTL on success (just long enough to
/// retrieve), longer on failure for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub status: JobPhase,
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<BTreeMap<String, Vec<Product>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    /// Wall-clock seconds spent on the whole job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl ResultRecord {
    pub fn complete(
        job: &JobRequest,
        worker_id: &str,
        results: BTreeMap<String, Vec<Product>>,
        total_time: Duration,
    ) -> Self {
        Self {
            status: JobPhase::Complete,
            worker_id: worker_id.to_string(),
            results: Some(results),
            error: None,
            zip_code: Some(job.zip_code.clone()),
            total_time: Some((total_time.as_secs_f64() * 100.0).round() / 100.0),
            completed_at: Some(Utc::now()),
            failed_at: None,
        }
    }

    pub fn failed(worker_id: &str, error: impl Into<String>) -> Self {
        Self {
            status: JobPhase::Failed,
            worker_id: worker_id.to_string(),
            results: None,
            error: Some(error.into()),
            zip_code: None,
            total_time: None,
            completed_at: None,
            failed_at: Some(Utc::now()),
        }
    }
}

/// Transport for inbound jobs and outbound status/result records.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Blocking pop with a bounded timeout. Returns `(queue_name, payload)`,
    /// or `None` when the timeout elapsed with no job.
    async fn pop(&self, timeout: Duration) -> Result<Option<(String, String)>, QueueError>;

    /// Write `status:{job_id}` with the given TTL.
    async fn put_status(
        &self,
        job_id: &str,
        record: &StatusRecord,
        ttl: Duration,
    ) -> Result<(), QueueError>;

    /// Write `result:{job_id}` with the given TTL.
    async fn put_result(
        &self,
        job_id: &str,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), QueueError>;
}

fn map_redis_err(op: &str, e: redis::RedisError) -> QueueError {
    if e.is_io_error() {
        QueueError::Connection(format!("{op}: {e}"))
    } else {
        QueueError::Command(format!("{op}: {e}"))
    }
}

/// Redis-backed [`JobQueue`].
///
/// A single multiplexed connection, used strictly sequentially by the
/// worker's single-threaded loop (a `BRPOP` completes before the next
/// command is issued).
pub struct RedisQueue {
    conn: Mutex<MultiplexedConnection>,
    queue_name: String,
}

impl RedisQueue {
    /// Connect to Redis and bind to a named queue.
    pub async fn connect(url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::Connection(format!("invalid redis url: {e}")))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(format!("connect: {e}")))?;

        info!(url = %url, queue = %queue_name, "Connected to job queue");
        Ok(Self {
            conn: Mutex::new(conn),
            queue_name: queue_name.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn pop(&self, timeout: Duration) -> Result<Option<(String, String)>, QueueError> {
        let mut conn = self.conn.lock().await;
        let popped: Option<(String, String)> = conn
            .brpop(&self.queue_name, timeout.as_secs_f64())
            .await
            .map_err(|e| map_redis_err("brpop", e))?;
        Ok(popped)
    }

    async fn put_status(
        &self,
        job_id: &str,
        record: &StatusRecord,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.conn.lock().await;
        let _: () = conn
            .set_ex(format!("status:{job_id}"), payload, ttl.as_secs())
            .await
            .map_err(|e| map_redis_err("set_ex status", e))?;
        Ok(())
    }

    async fn put_result(
        &self,
        job_id: &str,
        record: &ResultRecord,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.conn.lock().await;
        let _: () = conn
            .set_ex(format!("result:{job_id}"), payload, ttl.as_secs())
            .await
            .map_err(|e| map_redis_err("set_ex result", e))?;
        Ok(())
    }
}
