//! The Port API client: builds authenticated requests, dispatches them with
//! retries and turns responses into typed values or structured errors.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use port_client::{CancellationToken, Client, Config};
//!
//! let client = Client::new(&Config::with_client_credentials("id", "secret"))?;
//! let cancel = CancellationToken::new();
//! client.ping(&cancel).await?;
//! let blueprint: serde_json::Value = client.get(&cancel, "/v1/blueprints/service").await?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use bytes::Bytes;
use log::debug;
use reqwest::{Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthService, TokenProvider, token_provider};
use crate::config::{ClientOptions, Config};
use crate::diagnostics::Diagnostics;
use crate::error::{ApiError, ClientError};
use crate::http::{
    BufferPool, DEFAULT_USER_AGENT, OutboundRequest, ReqwestTransport, RetryExecutor, Transport,
};

/// Path of the credential check endpoint.
pub const HEALTH_PATH: &str = "/v1/health";

/// Authenticated client for the Port REST API. Cheap to share between tasks
/// behind an `Arc`; the only mutable state is the token cache and the body
/// buffer pool, both synchronized internally.
pub struct Client {
    base_url: String,
    retry: RetryExecutor,
    tokens: Arc<dyn TokenProvider>,
    user_agent: String,
    retry_attempts: usize,
    response_limit: Option<usize>,
    buffers: BufferPool,
    diagnostics: Diagnostics,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("retry_attempts", &self.retry_attempts)
            .field("response_limit", &self.response_limit)
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Client`], optionally with a custom transport or token provider.
pub struct ClientBuilder {
    config: Config,
    options: ClientOptions,
    transport: Option<Arc<dyn Transport>>,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl ClientBuilder {
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Sends requests through `transport` instead of a default reqwest client.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses `tokens` instead of the provider derived from the credentials.
    pub fn token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Validates the configuration and builds the client. No network traffic
    /// happens here.
    pub fn build(self) -> Result<Client> {
        let credentials = self.config.credentials()?;
        let base_url = self.config.base_endpoint();

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let retry = RetryExecutor::new(transport, self.options.retry_policy.clone());
        let tokens = self
            .tokens
            .unwrap_or_else(|| token_provider(credentials, &base_url, retry.clone()));

        let user_agent = self
            .options
            .user_agent
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        Ok(Client {
            base_url,
            retry,
            tokens,
            user_agent,
            retry_attempts: self.options.retry_attempts.max(1),
            response_limit: self.options.response_limit,
            buffers: BufferPool::default(),
            diagnostics: Diagnostics::new(self.options.verbose, self.options.log_file.as_deref()),
        })
    }
}

impl Client {
    /// Client with default options.
    pub fn new(config: &Config) -> Result<Self> {
        Self::builder(config.clone()).build()
    }

    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder {
            config,
            options: ClientOptions::default(),
            transport: None,
            tokens: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Auth endpoints (token exchange, credential rotation).
    pub fn auth(&self) -> AuthService<'_> {
        AuthService::new(self)
    }

    /// Issues `method path` with an optional JSON body and decodes the JSON
    /// reply into `T`.
    ///
    /// Transient failures (5xx, 429, network) are retried. Any other status of
    /// 300 or above yields an [`ApiError`] carrying the raw body.
    #[tracing::instrument(skip(self, cancel, body))]
    pub async fn execute<B, T>(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.dispatch(cancel, &method, path, body).await?;
        let raw = self.read_limited(cancel, response).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            anyhow::Error::from(ClientError::Decode(format!("{} {}: {}", method, path, e)))
        })
    }

    /// Like [`Client::execute`] but discards the response body.
    #[tracing::instrument(skip(self, cancel, body))]
    pub async fn execute_discard<B>(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<()>
    where
        B: Serialize + ?Sized,
    {
        self.dispatch(cancel, &method, path, body).await?;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        path: &str,
    ) -> Result<T> {
        self.execute(cancel, Method::GET, path, None::<&()>).await
    }

    pub async fn post<B, T>(&self, cancel: &CancellationToken, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(cancel, Method::POST, path, Some(body)).await
    }

    pub async fn put<B, T>(&self, cancel: &CancellationToken, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(cancel, Method::PUT, path, Some(body)).await
    }

    pub async fn patch<B, T>(&self, cancel: &CancellationToken, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(cancel, Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, cancel: &CancellationToken, path: &str) -> Result<()> {
        self.execute_discard(cancel, Method::DELETE, path, None::<&()>).await
    }

    /// Checks that the credentials are accepted, with a single attempt.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let mut request =
            OutboundRequest::new(Method::GET, &format!("{}{}", self.base_url, HEALTH_PATH))
                .context("ping: failed to create request")?;
        request.set_default_user_agent(&self.user_agent);
        let token = self.tokens.token(cancel).await?;
        request.set_bearer(&token)?;

        let response = self.retry.send(cancel, &request, 1).await?;
        let status = response.status();
        if status.as_u16() >= 300 {
            let body = read_error_body(cancel, response).await?;
            return Err(ApiError::new(status.as_u16(), "ping failed", body).into());
        }
        Ok(())
    }

    /// Builds, authenticates and sends one call. Returns the response only when
    /// its status is below 300.
    async fn dispatch<B>(
        &self,
        cancel: &CancellationToken,
        method: &Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = OutboundRequest::new(method.clone(), &url)?;
        if let Some(body) = body {
            request = request.with_json_body(self.encode_body(body)?);
        }
        request.set_default_user_agent(&self.user_agent);

        let token = self.tokens.token(cancel).await?;
        request.set_bearer(&token)?;

        let start = Instant::now();
        self.diagnostics.request_started(method, path);
        let response = match self.retry.send(cancel, &request, self.retry_attempts).await {
            Ok(response) => response,
            Err(e) => {
                self.diagnostics.request_failed(method, path, &e);
                return Err(e);
            }
        };

        let status = response.status();
        self.diagnostics
            .response_received(method, path, status, start.elapsed());
        if status.as_u16() >= 300 {
            debug!("{} {} returned {}", method, path, status);
            let body = read_error_body(cancel, response).await?;
            let message = format!("{} {}", method, path);
            return Err(ApiError::new(status.as_u16(), message, body).into());
        }
        Ok(response)
    }

    /// JSON-encodes `body` in a pooled buffer and captures it for replay.
    fn encode_body<B: Serialize + ?Sized>(&self, body: &B) -> Result<Bytes> {
        let mut buf = self.buffers.get();
        serde_json::to_writer(&mut *buf, body).context("Failed to encode request body")?;
        Ok(Bytes::copy_from_slice(&buf))
    }

    /// Reads a successful response body, enforcing the response size limit.
    async fn read_limited(
        &self,
        cancel: &CancellationToken,
        mut response: Response,
    ) -> Result<Vec<u8>> {
        if let (Some(limit), Some(len)) = (self.response_limit, response.content_length()) {
            if len > limit as u64 {
                return Err(oversized(limit));
            }
        }

        let mut body = Vec::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled.into()),
                chunk = response.chunk() => chunk.map_err(|e| {
                    ClientError::Decode(format!("failed to read response body: {}", e))
                })?,
            };
            let Some(chunk) = chunk else {
                return Ok(body);
            };
            if let Some(limit) = self.response_limit {
                if body.len() + chunk.len() > limit {
                    return Err(oversized(limit));
                }
            }
            body.extend_from_slice(&chunk);
        }
    }
}

fn oversized(limit: usize) -> anyhow::Error {
    ClientError::Decode(format!("response body exceeds the {} byte limit", limit)).into()
}

/// Full body of an error response, or a note explaining why it is missing.
/// Fails only when `cancel` fires first.
async fn read_error_body(cancel: &CancellationToken, response: Response) -> Result<Vec<u8>> {
    let body = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ClientError::Cancelled.into()),
        body = response.bytes() => body,
    };
    Ok(match body {
        Ok(body) => body.to_vec(),
        Err(e) => format!("failed to read error body: {}", e).into_bytes(),
    })
}
