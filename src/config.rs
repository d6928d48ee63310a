//! Service configuration.
//!
//! Component configs (`SessionLimits`, `PoolConfig`, `ProducerConfig`,
//! `ProxyConfig`, `WorkerConfig`) live next to their components with
//! `Default` impls carrying the production-tuned constants. `AppConfig`
//! aggregates them and layers environment overrides for deployment knobs.

use std::time::Duration;

use crate::error::ConfigError;
use crate::proxy::ProxyConfig;
use crate::session::pool::PoolConfig;
use crate::session::producer::ProducerConfig;
use crate::worker::worker::WorkerConfig;

/// Janitor cadence and retention.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// How often to sweep for expired sessions and purge old rows.
    pub interval: Duration,
    /// Hard-delete sessions older than this.
    pub retention: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis_url: String,
    pub db_path: String,
    /// `"host:port"` / `"host:port:user:pass"` proxy entries.
    pub proxies: Vec<String>,
    /// External command that mints capability URLs. Minting is disabled
    /// when absent; the pool then runs down until an operator intervenes.
    pub minter_cmd: Option<String>,
    pub pool: PoolConfig,
    pub producer: ProducerConfig,
    pub proxy: ProxyConfig,
    pub worker: WorkerConfig,
    pub janitor: JanitorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            db_path: "./data/sessions.db".to_string(),
            proxies: Vec::new(),
            minter_cmd: None,
            pool: PoolConfig::default(),
            producer: ProducerConfig::default(),
            proxy: ProxyConfig::default(),
            worker: WorkerConfig::default(),
            janitor: JanitorConfig::default(),
        }
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl AppConfig {
    /// Load from the environment, falling back to defaults.
    ///
    /// Recognized variables: `REDIS_URL`, `SCRAPE_DB_PATH`, `SCRAPE_PROXIES`,
    /// `SCRAPE_REGIONS`, `SCRAPE_MINTER_CMD`, `SCRAPE_QUEUE`, `WORKER_ID`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(path) = std::env::var("SCRAPE_DB_PATH") {
            config.db_path = path;
        }
        if let Ok(proxies) = std::env::var("SCRAPE_PROXIES") {
            config.proxies = split_csv(&proxies);
        }
        if let Ok(regions) = std::env::var("SCRAPE_REGIONS") {
            let regions = split_csv(&regions);
            if regions.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "SCRAPE_REGIONS".to_string(),
                    message: "must name at least one region".to_string(),
                });
            }
            config.producer.regions = regions;
        }
        if let Ok(cmd) = std::env::var("SCRAPE_MINTER_CMD") {
            if !cmd.trim().is_empty() {
                config.minter_cmd = Some(cmd);
            }
        }
        if let Ok(queue) = std::env::var("SCRAPE_QUEUE") {
            config.worker.queue_name = queue;
        }
        if let Ok(worker_id) = std::env::var("WORKER_ID") {
            config.worker.worker_id = Some(worker_id);
        }

        Ok(config)
    }
}
