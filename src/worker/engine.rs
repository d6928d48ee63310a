//! Execution boundary — the seam where target-specific scraping plugs in.
//!
//! The worker owns one long-lived [`ScrapeEngine`] at a time and replaces it
//! per its restart policy. Engines know nothing about any target's markup;
//! the bundled [`HttpEngine`] only exercises a session's capability URL over
//! HTTP and decodes whatever JSON the callback returns.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::proxy::Proxy;
use crate::queue::{JobRequest, Product};
use crate::session::Session;

/// Everything an engine needs to execute one line item.
#[derive(Debug, Clone)]
pub struct ItemRequest {
    pub item: String,
    /// Partition key, forwarded unchanged from the job.
    pub zip_code: String,
    pub max_products: usize,
    pub prioritize_nearby: bool,
}

impl ItemRequest {
    pub fn for_item(job: &JobRequest, item: &str) -> Self {
        Self {
            item: item.to_string(),
            zip_code: job.zip_code.clone(),
            max_products: job.max_products_per_item,
            prioritize_nearby: job.prioritize_nearby,
        }
    }
}

/// A long-lived execution resource.
#[async_trait]
pub trait ScrapeEngine: Send + Sync {
    /// Execute one line item against the target using the given session and
    /// optional proxy.
    async fn execute(
        &mut self,
        session: &Session,
        proxy: Option<&Proxy>,
        request: &ItemRequest,
    ) -> Result<Vec<Product>, ExecError>;

    /// Tear down underlying resources before the engine is dropped.
    async fn shutdown(&mut self) {}
}

/// Acquires fresh engines. Acquisition may be expensive; the worker's restart
/// policy bounds how often it happens.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn ScrapeEngine>, ExecError>;
}

/// Generic HTTP engine: GET the session's capability URL with the item query,
/// optionally through a proxy, and decode the JSON body as products.
pub struct HttpEngine {
    /// Proxy-less client, reused across items.
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpEngine {
    pub fn new(request_timeout: Duration) -> Result<Self, ExecError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ExecError::EngineUnavailable(format!("http client: {e}")))?;

        Ok(Self {
            client,
            request_timeout,
        })
    }

    /// Client routed through the given proxy. Credentials ride in the proxy
    /// URL.
    fn proxied_client(&self, proxy: &Proxy) -> Result<reqwest::Client, ExecError> {
        let proxy = reqwest::Proxy::all(proxy.url())
            .map_err(|e| ExecError::Http(format!("invalid proxy: {e}")))?;

        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| ExecError::EngineUnavailable(format!("proxied http client: {e}")))
    }
}

#[async_trait]
impl ScrapeEngine for HttpEngine {
    async fn execute(
        &mut self,
        session: &Session,
        proxy: Option<&Proxy>,
        request: &ItemRequest,
    ) -> Result<Vec<Product>, ExecError> {
        let client = match proxy {
            Some(proxy) => self.proxied_client(proxy)?,
            None => self.client.clone(),
        };

        let response = client
            .get(&session.url)
            .query(&[
                ("q", request.item.as_str()),
                ("near", request.zip_code.as_str()),
            ])
            .query(&[("num", request.max_products)])
            .query(&[("nearby", request.prioritize_nearby)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecError::Timeout(self.request_timeout)
                } else {
                    ExecError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 403 || status.as_u16() == 429 {
            return Err(ExecError::Blocked {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(ExecError::Http(format!("unexpected status {status}")));
        }

        response
            .json::<Vec<Product>>()
            .await
            .map_err(|e| ExecError::Decode(e.to_string()))
    }
}

/// Factory for [`HttpEngine`]s.
pub struct HttpEngineFactory {
    request_timeout: Duration,
}

impl HttpEngineFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl EngineFactory for HttpEngineFactory {
    async fn acquire(&self) -> Result<Box<dyn ScrapeEngine>, ExecError> {
        Ok(Box::new(HttpEngine::new(self.request_timeout)?))
    }
}
