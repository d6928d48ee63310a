//! Proxy rotation — a static set of egress identities with health demotion.
//!
//! Proxies are created once at startup from configuration and never deleted,
//! only toggled blocked/unblocked. Callers receive clones; every mutation
//! funnels back through the pool's methods, which match proxies by
//! `(host, port)` identity.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

/// Proxy health thresholds.
///
/// The auto-block defaults are production-tuned; override by constructing
/// the struct directly.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Minimum requests before the failure-rate auto-block can fire.
    pub auto_block_min_requests: u64,
    /// Success rate (percent) below which a proxy is auto-blocked.
    pub auto_block_min_success_rate: f64,
    /// How long an auto-block lasts.
    pub temp_block: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            auto_block_min_requests: 10,
            auto_block_min_success_rate: 50.0,
            temp_block: Duration::from_secs(30 * 60), // 30 minutes
        }
    }
}

/// A single egress identity.
#[derive(Debug, Clone, Serialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub is_blocked: bool,
    /// Block deadline. `None` while blocked means the block is permanent.
    pub blocked_until: Option<DateTime<Utc>>,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            total_requests: 0,
            failed_requests: 0,
            last_used: None,
            is_blocked: false,
            blocked_until: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Proxy URL for HTTP clients.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("http://{user}:{pass}@{}:{}", self.host, self.port)
            }
            _ => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// Egress-identity label recorded on sessions minted through this proxy.
    pub fn bucket(&self) -> String {
        format!("proxy_{}_{}", self.host, self.port)
    }

    /// Success rate in percent; 100 when the proxy has never been used.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        (self.total_requests - self.failed_requests) as f64 / self.total_requests as f64 * 100.0
    }

    fn mark_used(&mut self) {
        self.total_requests += 1;
        self.last_used = Some(Utc::now());
    }

    fn mark_failed(&mut self, config: &ProxyConfig) {
        self.failed_requests += 1;

        if self.total_requests >= config.auto_block_min_requests
            && self.success_rate() < config.auto_block_min_success_rate
        {
            self.block_temporary(config.temp_block);
        }
    }

    /// Permanently block (target banned this egress identity).
    fn mark_blocked(&mut self) {
        self.is_blocked = true;
        self.blocked_until = None;
    }

    fn block_temporary(&mut self, duration: Duration) {
        self.is_blocked = true;
        self.blocked_until =
            Some(Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX));
    }

    /// Clear an expired temporary block. Permanent blocks never clear here.
    fn check_unblock(&mut self) -> bool {
        if self.is_blocked {
            if let Some(until) = self.blocked_until {
                if Utc::now() >= until {
                    self.is_blocked = false;
                    self.blocked_until = None;
                    return true;
                }
            }
        }
        false
    }
}

/// Per-proxy stats line.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStat {
    pub host: String,
    pub port: u16,
    pub blocked: bool,
    pub requests: u64,
    pub success_rate: f64,
}

/// Pool-level statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyPoolStats {
    pub total: usize,
    pub available: usize,
    pub blocked: usize,
    pub total_requests: u64,
    pub total_failures: u64,
    pub avg_success_rate: f64,
    pub proxies: Vec<ProxyStat>,
}

/// Pool of egress identities with LRU rotation and automatic health demotion.
pub struct ProxyPool {
    proxies: Mutex<Vec<Proxy>>,
    config: ProxyConfig,
}

impl ProxyPool {
    pub fn new(proxies: Vec<Proxy>, config: ProxyConfig) -> Self {
        Self {
            proxies: Mutex::new(proxies),
            config,
        }
    }

    /// Build a pool from `"host:port"` / `"host:port:user:pass"` strings.
    /// Malformed entries are logged and skipped.
    pub fn from_list(entries: &[String], config: ProxyConfig) -> Self {
        let mut proxies = Vec::new();

        for entry in entries {
            let parts: Vec<&str> = entry.split(':').collect();
            let parsed = match parts.as_slice() {
                [host, port] => port.parse::<u16>().ok().map(|p| Proxy::new(*host, p)),
                [host, port, user, pass] => port
                    .parse::<u16>()
                    .ok()
                    .map(|p| Proxy::new(*host, p).with_auth(*user, *pass)),
                _ => None,
            };

            match parsed {
                Some(proxy) => proxies.push(proxy),
                None => warn!(entry = %entry, "Skipping malformed proxy entry"),
            }
        }

        Self::new(proxies, config)
    }

    pub fn len(&self) -> usize {
        self.proxies.lock().expect("proxy pool mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Least-recently-used available proxy, or `None` if every proxy is
    /// blocked. `None` is a retryable condition, not a fatal one. Expired
    /// temporary blocks are cleared first; the returned proxy is marked used.
    pub fn get_next_proxy(&self) -> Option<Proxy> {
        let mut proxies = self.proxies.lock().expect("proxy pool mutex poisoned");

        for proxy in proxies.iter_mut() {
            if proxy.check_unblock() {
                debug!(host = %proxy.host, port = proxy.port, "Temporary proxy block expired");
            }
        }

        let proxy = proxies
            .iter_mut()
            .filter(|p| !p.is_blocked)
            .min_by_key(|p| p.last_used.unwrap_or(DateTime::<Utc>::MIN_UTC))?;

        proxy.mark_used();
        Some(proxy.clone())
    }

    /// Uniform-random available proxy; used where request-burst correlation
    /// must be avoided rather than fairness.
    pub fn get_random_proxy(&self) -> Option<Proxy> {
        let mut proxies = self.proxies.lock().expect("proxy pool mutex poisoned");

        let available: Vec<usize> = proxies
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_blocked)
            .map(|(i, _)| i)
            .collect();

        if available.is_empty() {
            return None;
        }

        let idx = available[rand::thread_rng().gen_range(0..available.len())];
        let proxy = &mut proxies[idx];
        proxy.mark_used();
        Some(proxy.clone())
    }

    /// Report a failed request through this proxy. `is_blocked = true` means
    /// the target banned the identity; the block becomes permanent.
    pub fn report_failure(&self, proxy: &Proxy, is_blocked: bool) {
        let mut proxies = self.proxies.lock().expect("proxy pool mutex poisoned");

        if let Some(p) = proxies
            .iter_mut()
            .find(|p| p.host == proxy.host && p.port == proxy.port)
        {
            p.mark_failed(&self.config);
            if is_blocked {
                p.mark_blocked();
                warn!(host = %p.host, port = p.port, "Proxy permanently blocked by target");
            }
        }
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let proxies = self.proxies.lock().expect("proxy pool mutex poisoned");

        let total = proxies.len();
        let available = proxies.iter().filter(|p| !p.is_blocked).count();
        let total_requests = proxies.iter().map(|p| p.total_requests).sum();
        let total_failures = proxies.iter().map(|p| p.failed_requests).sum();
        let avg_success_rate = if total > 0 {
            proxies.iter().map(|p| p.success_rate()).sum::<f64>() / total as f64
        } else {
            0.0
        };

        ProxyPoolStats {
            total,
            available,
            blocked: total - available,
            total_requests,
            total_failures,
            avg_success_rate,
            proxies: proxies
                .iter()
                .map(|p| ProxyStat {
                    host: p.host.clone(),
                    port: p.port,
                    blocked: p.is_blocked,
                    requests: p.total_requests,
                    success_rate: p.success_rate(),
                })
                .collect(),
        }
    }

    #[cfg(test)]
    fn with_proxy<F: FnOnce(&mut Proxy)>(&self, host: &str, port: u16, f: F) {
        let mut proxies = self.proxies.lock().unwrap();
        let p = proxies
            .iter_mut()
            .find(|p| p.host == host && p.port == port)
            .unwrap();
        f(p);
    }
}
