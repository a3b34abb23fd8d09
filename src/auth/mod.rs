//! Authentication: bearer token providers and the auth endpoints.

mod service;
mod token;

use serde::{Deserialize, Serialize};

pub use service::AuthService;
#[cfg(test)]
pub use token::MockTokenProvider;
pub use token::{
    ACCESS_TOKEN_PATH, ClientCredentials, DEFAULT_EXPIRES_IN, EXPIRY_MARGIN, MAX_EXPIRES_IN,
    StaticToken, TokenProvider, token_provider,
};

/// Payload sent to `/v1/auth/access_token`.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenRequest {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for AccessTokenRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenRequest")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Reply from `/v1/auth/access_token`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenResponse {
    #[serde(default)]
    pub access_token: String,
    /// Lifetime in seconds; 0 when the server omits it. Signed because the
    /// endpoint does not promise a positive value.
    #[serde(default)]
    pub expires_in: i64,
}
