//! Bearer token providers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{AccessTokenRequest, AccessTokenResponse};
use crate::config::Credentials;
use crate::error::ClientError;
use crate::http::{OutboundRequest, RetryExecutor};

/// Path of the client-credentials exchange endpoint.
pub const ACCESS_TOKEN_PATH: &str = "/v1/auth/access_token";

/// A cached token this close to expiry is refreshed instead of reused.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Lifetime assumed when the token endpoint omits `expiresIn` or sends a
/// non-positive value.
pub const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Longest lifetime accepted from the token endpoint.
pub const MAX_EXPIRES_IN: u64 = 365 * 24 * 3600;

const EXCHANGE_ATTEMPTS: usize = 3;

/// Supplies a valid bearer token for each API call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, cancel: &CancellationToken) -> Result<String>;
}

/// Picks the provider matching the configured credentials.
pub fn token_provider(
    credentials: Credentials,
    base_url: &str,
    retry: RetryExecutor,
) -> Arc<dyn TokenProvider> {
    match credentials {
        Credentials::ApiToken(token) => Arc::new(StaticToken::new(token)),
        Credentials::ClientCredentials {
            client_id,
            client_secret,
        } => Arc::new(ClientCredentials::new(
            client_id,
            client_secret,
            base_url,
            retry,
        )),
    }
}

/// A pre-issued token returned as is.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self, _cancel: &CancellationToken) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at.saturating_duration_since(Instant::now()) > EXPIRY_MARGIN
    }
}

/// Exchanges a client id and secret for short-lived tokens and caches them.
///
/// Check and refresh run inside one critical section, so concurrent callers
/// hitting an expired cache trigger a single exchange and share its result.
/// A failed exchange leaves the cache as it was.
pub struct ClientCredentials {
    client_id: String,
    client_secret: String,
    token_url: String,
    retry: RetryExecutor,
    cache: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        base_url: &str,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: format!("{}{}", base_url.trim_end_matches('/'), ACCESS_TOKEN_PATH),
            retry,
            cache: Mutex::new(None),
        }
    }

    #[tracing::instrument(skip(self, cancel))]
    async fn exchange(&self, cancel: &CancellationToken) -> Result<CachedToken> {
        debug!("Requesting access token for client {}", self.client_id);

        let payload = serde_json::to_vec(&AccessTokenRequest {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        })
        .context("port auth: failed to encode credentials")?;
        let mut request = OutboundRequest::new(Method::POST, &self.token_url)?
            .with_json_body(Bytes::from(payload));
        request.set_default_user_agent("");

        let response = self
            .retry
            .send(cancel, &request, EXCHANGE_ATTEMPTS)
            .await
            .context("port auth")?;

        let status = response.status();
        if status.as_u16() >= 300 {
            return Err(ClientError::TokenExchange(format!("port auth failed: {}", status)).into());
        }

        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled.into()),
            raw = response.bytes() => raw.context("port auth: failed to read token response")?,
        };
        let parsed: AccessTokenResponse = serde_json::from_slice(&raw)
            .map_err(|e| ClientError::Decode(format!("port auth: {}", e)))?;
        if parsed.access_token.is_empty() {
            return Err(ClientError::TokenExchange(
                "port auth: empty access token in response".to_string(),
            )
            .into());
        }

        let expires_in = match parsed.expires_in {
            secs if secs <= 0 => DEFAULT_EXPIRES_IN,
            secs => (secs as u64).min(MAX_EXPIRES_IN),
        };
        debug!("Access token obtained, expires in {}s", expires_in);

        Ok(CachedToken {
            token: parsed.access_token,
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentials {
    async fn token(&self, cancel: &CancellationToken) -> Result<String> {
        let mut cache = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled.into()),
            guard = self.cache.lock() => guard,
        };

        if let Some(cached) = cache.as_ref().filter(|c| c.is_fresh()) {
            return Ok(cached.token.clone());
        }

        let fresh = self.exchange(cancel).await?;
        let token = fresh.token.clone();
        *cache = Some(fresh);
        Ok(token)
    }
}
