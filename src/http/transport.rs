//! The network boundary: anything that can send a request and hand back a response.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Request, Response};
use std::time::Duration;

/// Sends a single HTTP request. Implemented by [`ReqwestTransport`] for real
/// traffic and mocked in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> reqwest::Result<Response>;
}

/// Connection and timeout settings for [`ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Whole-request timeout.
    pub timeout: Duration,
    /// TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            tcp_keepalive: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
        }
    }
}

/// Pooled reqwest client.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        Self::with_settings(&TransportSettings::default())
    }

    pub fn with_settings(settings: &TransportSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.connect_timeout)
            .tcp_keepalive(settings.tcp_keepalive)
            .pool_idle_timeout(settings.pool_idle_timeout)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Wraps an existing reqwest client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Returns a reference to the underlying reqwest Client.
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> reqwest::Result<Response> {
        self.client.execute(request).await
    }
}
