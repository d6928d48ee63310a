//! Session producer — the only component permitted to drive the expensive
//! browser-automation step that manufactures new sessions.
//!
//! Minting is strictly confined to background tasks (the periodic loop and
//! the refill listener); it must never run on a worker's request path. Every
//! mint failure is caught here and converted to `None` — nothing propagates
//! to the triggering side.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::MintError;
use crate::proxy::{Proxy, ProxyPool};
use crate::session::model::{Session, SessionLimits};
use crate::session::store::SessionStore;

/// Producer policy knobs.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Regions maintained by the periodic loop.
    pub regions: Vec<String>,
    /// Healthy sessions to keep per region.
    pub target_per_region: usize,
    /// Periodic full-refill interval.
    pub refresh_interval: Duration,
    /// Hard timeout on a single mint attempt.
    pub mint_timeout: Duration,
    /// Pause after a failed mint before the next attempt.
    pub mint_retry_delay: Duration,
    /// Pause between regions during a full refill.
    pub region_pause: Duration,
    pub limits: SessionLimits,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            regions: vec!["US-West".to_string(), "US-East".to_string()],
            target_per_region: 3,
            refresh_interval: Duration::from_secs(30 * 60), // 30 minutes
            mint_timeout: Duration::from_secs(90),
            mint_retry_delay: Duration::from_secs(5),
            region_pause: Duration::from_secs(2),
            limits: SessionLimits::default(),
        }
    }
}

/// The browser-automation boundary: produce one capability URL for a region.
///
/// `Ok(None)` means the driver ran but captured nothing (e.g. the target
/// served no callback); errors carry driver failures. Both count as a failed
/// mint for the producer.
#[async_trait]
pub trait SessionMinter: Send + Sync {
    async fn mint(&self, region: &str, proxy: Option<&Proxy>) -> Result<Option<String>, MintError>;
}

/// Minter that shells out to an external helper command.
///
/// The command receives `MINT_REGION` (and `MINT_PROXY` when a proxy is in
/// play) in its environment and must print the captured capability URL as the
/// first line of stdout. This keeps the browser-automation driver itself
/// out of this crate.
pub struct CommandMinter {
    command: String,
}

impl CommandMinter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl SessionMinter for CommandMinter {
    async fn mint(&self, region: &str, proxy: Option<&Proxy>) -> Result<Option<String>, MintError> {
        let mut command = Command::new("sh");
        command
            .args(["-c", &self.command])
            .env("MINT_REGION", region)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(proxy) = proxy {
            command.env("MINT_PROXY", proxy.url());
        }

        let output = command
            .output()
            .await
            .map_err(|e| MintError::Launch(format!("Failed to spawn minter command: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MintError::Capture(format!(
                "minter exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string))
    }
}

/// Producer counters for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct MintStats {
    pub minted: u64,
    pub failed: u64,
    pub success_rate: f64,
}

/// Mints sessions through the [`SessionMinter`] boundary and persists them.
pub struct SessionProducer {
    store: Arc<dyn SessionStore>,
    minter: Arc<dyn SessionMinter>,
    proxies: Option<Arc<ProxyPool>>,
    config: ProducerConfig,
    minted: AtomicU64,
    failed: AtomicU64,
}

impl SessionProducer {
    pub fn new(
        store: Arc<dyn SessionStore>,
        minter: Arc<dyn SessionMinter>,
        proxies: Option<Arc<ProxyPool>>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            store,
            minter,
            proxies,
            config,
            minted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn target_per_region(&self) -> usize {
        self.config.target_per_region
    }

    /// Drive the minter once for a region and persist the result.
    ///
    /// Every failure mode (driver error, empty capture, mint timeout, store
    /// error) is logged and converted to `None` — callers run this from
    /// background triggers and must never see it escalate.
    pub async fn mint_one(&self, region: &str) -> Option<Session> {
        info!(region = %region, "Minting new session");

        let proxy = self.proxies.as_ref().and_then(|p| p.get_next_proxy());

        let minted = tokio::time::timeout(
            self.config.mint_timeout,
            self.minter.mint(region, proxy.as_ref()),
        )
        .await
        .unwrap_or(Err(MintError::Timeout(self.config.mint_timeout)));

        let url = match minted {
            Ok(Some(url)) => url,
            Ok(None) => {
                warn!(region = %region, "No capability URL captured");
                self.record_mint_failure(proxy.as_ref());
                return None;
            }
            Err(e) => {
                error!(region = %region, error = %e, "Mint failed");
                self.record_mint_failure(proxy.as_ref());
                return None;
            }
        };

        let proxy_bucket = proxy
            .as_ref()
            .map(Proxy::bucket)
            .unwrap_or_else(|| "no_proxy".to_string());

        let session = Session::new(url, region, proxy_bucket);
        match self.store.create(session).await {
            Ok(session) => {
                self.minted.fetch_add(1, Ordering::Relaxed);
                info!(session_id = ?session.id, region = %region, "Session created");
                Some(session)
            }
            Err(e) => {
                error!(region = %region, error = %e, "Failed to persist minted session");
                self.failed.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Mint until the region holds `target` healthy sessions, pausing after
    /// each failed attempt. Returns how many sessions were created.
    pub async fn refill_region(&self, region: &str, target: usize) -> usize {
        let healthy = match self.store.list_valid(Some(region), 100).await {
            Ok(sessions) => sessions
                .iter()
                .filter(|s| s.is_healthy(&self.config.limits))
                .count(),
            Err(e) => {
                error!(region = %region, error = %e, "Failed to count healthy sessions");
                return 0;
            }
        };

        let to_create = target.saturating_sub(healthy);
        if to_create == 0 {
            debug!(region = %region, healthy, "Region already has enough sessions");
            return 0;
        }

        info!(region = %region, healthy, to_create, "Refilling region");

        let mut created = 0;
        for attempt in 1..=to_create {
            match self.mint_one(region).await {
                Some(_) => created += 1,
                None => {
                    warn!(region = %region, attempt, to_create, "Mint attempt failed");
                    tokio::time::sleep(self.config.mint_retry_delay).await;
                }
            }
        }

        info!(region = %region, created, to_create, "Region refill finished");
        created
    }

    /// Sequential per-region refill with a small inter-region pause.
    pub async fn refill_all(&self) -> HashMap<String, usize> {
        info!(regions = ?self.config.regions, "Refilling all regions");

        let mut results = HashMap::new();
        let last = self.config.regions.len().saturating_sub(1);

        for (i, region) in self.config.regions.iter().enumerate() {
            let created = self
                .refill_region(region, self.config.target_per_region)
                .await;
            results.insert(region.clone(), created);

            if i < last {
                tokio::time::sleep(self.config.region_pause).await;
            }
        }

        let total: usize = results.values().sum();
        info!(total, "Refill pass complete");
        results
    }

    /// Immediate refill, then repeat on the configured interval, forever.
    /// Runs as its own background task, decoupled from the worker lifecycle.
    pub async fn run_forever(&self) {
        info!(
            regions = ?self.config.regions,
            interval_secs = self.config.refresh_interval.as_secs(),
            "Session producer starting"
        );

        self.refill_all().await;

        loop {
            tokio::time::sleep(self.config.refresh_interval).await;
            info!("Refresh interval reached, refilling sessions");
            self.refill_all().await;
        }
    }

    pub fn stats(&self) -> MintStats {
        let minted = self.minted.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = minted + failed;
        MintStats {
            minted,
            failed,
            success_rate: if total > 0 {
                minted as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    fn record_mint_failure(&self, proxy: Option<&Proxy>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let (Some(pool), Some(proxy)) = (self.proxies.as_ref(), proxy) {
            pool.report_failure(proxy, false);
        }
    }
}

/// Drain refill signals from the pool's registered callback and service them.
/// `None` regions (pool-wide signals) trigger a full refill pass.
pub fn spawn_refill_listener(
    producer: Arc<SessionProducer>,
    mut rx: mpsc::Receiver<Option<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            match signal {
                Some(region) => {
                    debug!(region = %region, "Refill signal received");
                    producer
                        .refill_region(&region, producer.target_per_region())
                        .await;
                }
                None => {
                    debug!("Pool-wide refill signal received");
                    producer.refill_all().await;
                }
            }
        }
    })
}
