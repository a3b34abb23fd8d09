//! Typed wrappers over Port's `auth` endpoints.

use anyhow::Result;
use reqwest::Method;
use tokio_util::sync::CancellationToken;

use super::{ACCESS_TOKEN_PATH, AccessTokenRequest, AccessTokenResponse};
use crate::client::Client;
use crate::error::ClientError;

/// Calls to Port's `auth` endpoints made through an existing [`Client`].
#[derive(Debug, Clone, Copy)]
pub struct AuthService<'a> {
    client: &'a Client,
}

impl<'a> AuthService<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Exchanges client credentials for an access token.
    pub async fn request_access_token(
        &self,
        cancel: &CancellationToken,
        request: &AccessTokenRequest,
    ) -> Result<AccessTokenResponse> {
        self.client
            .execute(cancel, Method::POST, ACCESS_TOKEN_PATH, Some(request))
            .await
    }

    /// Rotates the credentials of the user identified by `email`.
    pub async fn rotate_credentials(&self, cancel: &CancellationToken, email: &str) -> Result<()> {
        if email.trim().is_empty() {
            return Err(ClientError::Validation("email is required".to_string()).into());
        }
        let path = format!("/v1/rotate-credentials/{}", urlencoding::encode(email));
        self.client
            .execute_discard(cancel, Method::POST, &path, None::<&()>)
            .await
    }
}
