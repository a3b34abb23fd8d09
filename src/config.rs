//! Client configuration: where to connect, how to authenticate, and how the
//! request pipeline behaves.
//!
//! Loading values from the environment or files is left to the caller; every
//! type here can be built in code or deserialized with serde.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::ClientError;
use crate::http::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};

/// Default cap on the size of a decoded response body (10 MiB).
pub const DEFAULT_RESPONSE_LIMIT: usize = 10 << 20;

/// Connection and credential settings.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// `eu` (default) or `us`; other values map to `api.<region>.port.io`.
    #[serde(default)]
    pub region: String,
    /// Explicit API URL, takes precedence over `region`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("region", &self.region)
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Config {
    /// Configuration that authenticates with a pre-issued API token.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            api_token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Configuration that exchanges a client id and secret for tokens.
    pub fn with_client_credentials(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client_id: Some(client_id.into()),
            client_secret: Some(client_secret.into()),
            ..Self::default()
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Checks that exactly one authentication mode can be resolved.
    pub fn validate(&self) -> Result<()> {
        self.credentials().map(|_| ())
    }

    /// Resolves the active authentication mode. A non-blank API token wins
    /// over client credentials.
    pub fn credentials(&self) -> Result<Credentials> {
        if let Some(token) = non_blank(&self.api_token) {
            return Ok(Credentials::ApiToken(token.to_string()));
        }
        match (non_blank(&self.client_id), non_blank(&self.client_secret)) {
            (Some(id), Some(secret)) => Ok(Credentials::ClientCredentials {
                client_id: id.to_string(),
                client_secret: secret.to_string(),
            }),
            _ => Err(ClientError::Validation(
                "set an API token or both a client id and a client secret".to_string(),
            )
            .into()),
        }
    }

    /// API base URL without a trailing slash.
    pub fn base_endpoint(&self) -> String {
        if let Some(url) = non_blank(&self.base_url) {
            return url.trim_end_matches('/').to_string();
        }
        match self.region.trim().to_lowercase().as_str() {
            "" | "eu" => "https://api.port.io".to_string(),
            "us" => "https://api.us.port.io".to_string(),
            other => format!("https://api.{}.port.io", other),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// The authentication mode in effect for a client.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiToken(String),
    ClientCredentials {
        client_id: String,
        client_secret: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ApiToken(_) => f.write_str("ApiToken([REDACTED])"),
            Credentials::ClientCredentials { client_id, .. } => f
                .debug_struct("ClientCredentials")
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Behaviour of the request pipeline.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Custom `User-Agent`; blank or `None` uses the crate default.
    pub user_agent: Option<String>,
    /// Attempts per API call, at least 1.
    pub retry_attempts: usize,
    /// Maximum decoded response size; `None` means unlimited.
    pub response_limit: Option<usize>,
    /// Emit a line per request and response through the diagnostics log.
    pub verbose: bool,
    /// Append verbose lines to this file instead of the `log` facade.
    pub log_file: Option<PathBuf>,
    pub retry_policy: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: None,
            retry_attempts: DEFAULT_MAX_ATTEMPTS,
            response_limit: Some(DEFAULT_RESPONSE_LIMIT),
            verbose: false,
            log_file: None,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ClientOptions {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sets the attempt count; values below 1 become 1 (no retries).
    pub fn with_retry_attempts(mut self, attempts: usize) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Sets the response size cap in bytes; 0 disables the cap.
    pub fn with_response_limit(mut self, bytes: usize) -> Self {
        self.response_limit = (bytes > 0).then_some(bytes);
        self
    }

    /// Turns on verbose diagnostics, optionally written to `log_file`.
    pub fn with_verbose(mut self, log_file: Option<PathBuf>) -> Self {
        self.verbose = true;
        self.log_file = log_file;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}
