//! Error types produced by the request pipeline.
//!
//! Everything is returned as `anyhow::Error`; the typed errors below sit at the
//! root of (or somewhere in) the chain and can be recovered with the helper
//! predicates in this module.

use bytes::Bytes;
use reqwest::StatusCode;

/// A Port API response with a status code of 300 or above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status code of the response.
    pub status_code: u16,
    /// Short summary, usually `"<METHOD> <path>"`.
    pub message: String,
    /// Raw response body, unchanged.
    pub body: Vec<u8>,
}

impl ApiError {
    pub fn new(status_code: u16, message: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status_code,
            message: message.into(),
            body,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code == 404
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status_code == 401
    }

    pub fn is_forbidden(&self) -> bool {
        self.status_code == 403
    }

    pub fn is_conflict(&self) -> bool {
        self.status_code == 409
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status_code == 429
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status_code)
    }

    /// The response body decoded lossily as UTF-8.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = status_text(self.status_code);
        if self.message.is_empty() {
            write!(f, "port api: {} {}", self.status_code, reason)
        } else {
            write!(
                f,
                "port api: {} {}: {}",
                self.status_code, reason, self.message
            )
        }
    }
}

impl std::error::Error for ApiError {}

/// Failures raised by the client itself rather than by the remote API.
#[derive(Debug)]
pub enum ClientError {
    /// Missing or contradictory input, detected before any network call.
    Validation(String),
    /// The caller's cancellation token fired while the call was waiting.
    Cancelled,
    /// Every attempt ended in a retryable status.
    MaxRetriesExceeded {
        attempts: usize,
        status: StatusCode,
        body: Bytes,
    },
    /// The response body was malformed, oversized or could not be read.
    Decode(String),
    /// The token endpoint rejected the credentials or returned no token.
    TokenExchange(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Validation(msg) => write!(f, "Invalid request: {}", msg),
            ClientError::Cancelled => write!(f, "Request cancelled"),
            ClientError::MaxRetriesExceeded {
                attempts, status, ..
            } => {
                write!(
                    f,
                    "max retries exceeded: {} after {} attempt(s)",
                    status, attempts
                )
            }
            ClientError::Decode(msg) => write!(f, "Failed to decode response: {}", msg),
            ClientError::TokenExchange(msg) => write!(f, "Token exchange failed: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

fn status_text(code: u16) -> &'static str {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("status")
}

fn find<T: std::error::Error + 'static>(err: &anyhow::Error) -> Option<&T> {
    err.chain().find_map(|e| e.downcast_ref::<T>())
}

/// Returns the [`ApiError`] carried anywhere in the error chain.
pub fn api_error(err: &anyhow::Error) -> Option<&ApiError> {
    find::<ApiError>(err)
}

/// Returns the [`ClientError`] carried anywhere in the error chain.
pub fn client_error(err: &anyhow::Error) -> Option<&ClientError> {
    find::<ClientError>(err)
}

/// HTTP status of an API error, or `None` for any other failure.
pub fn status_code(err: &anyhow::Error) -> Option<u16> {
    api_error(err).map(|e| e.status_code)
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    api_error(err).is_some_and(ApiError::is_not_found)
}

pub fn is_unauthorized(err: &anyhow::Error) -> bool {
    api_error(err).is_some_and(ApiError::is_unauthorized)
}

pub fn is_forbidden(err: &anyhow::Error) -> bool {
    api_error(err).is_some_and(ApiError::is_forbidden)
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    api_error(err).is_some_and(ApiError::is_conflict)
}

pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    api_error(err).is_some_and(ApiError::is_rate_limited)
}

pub fn is_server_error(err: &anyhow::Error) -> bool {
    api_error(err).is_some_and(ApiError::is_server_error)
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(client_error(err), Some(ClientError::Cancelled))
}

pub fn is_max_retries_exceeded(err: &anyhow::Error) -> bool {
    matches!(
        client_error(err),
        Some(ClientError::MaxRetriesExceeded { .. })
    )
}

pub fn is_validation_error(err: &anyhow::Error) -> bool {
    matches!(client_error(err), Some(ClientError::Validation(_)))
}

pub fn is_decode_error(err: &anyhow::Error) -> bool {
    matches!(client_error(err), Some(ClientError::Decode(_)))
}

/// True when the failure came from the network layer (connect, TLS, timeout).
pub fn is_transport_error(err: &anyhow::Error) -> bool {
    find::<reqwest::Error>(err).is_some()
}

/// A short message suitable for showing to a user.
pub fn error_message(err: &anyhow::Error) -> String {
    match api_error(err) {
        Some(api) if !api.message.is_empty() => api.message.clone(),
        Some(api) => format!("HTTP {}: {}", api.status_code, status_text(api.status_code)),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn api(code: u16) -> anyhow::Error {
        anyhow::Error::from(ApiError::new(code, "", Vec::new()))
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError::new(404, "GET /v1/blueprints/x", b"{}".to_vec());
        assert_eq!(
            err.to_string(),
            "port api: 404 Not Found: GET /v1/blueprints/x"
        );

        let err = ApiError::new(599, "", Vec::new());
        assert_eq!(err.to_string(), "port api: 599 status");
    }

    #[test]
    fn test_status_predicates() {
        assert!(is_not_found(&api(404)));
        assert!(!is_not_found(&api(200)));
        assert!(is_unauthorized(&api(401)));
        assert!(is_forbidden(&api(403)));
        assert!(is_conflict(&api(409)));
        assert!(is_rate_limited(&api(429)));
    }

    #[test]
    fn test_is_server_error() {
        for (code, want) in [
            (500, true),
            (502, true),
            (503, true),
            (400, false),
            (404, false),
            (200, false),
        ] {
            assert_eq!(is_server_error(&api(code)), want, "status {}", code);
        }
    }

    #[test]
    fn test_status_code_through_context() {
        let err = api(409).context("upserting entity");
        assert_eq!(status_code(&err), Some(409));
        assert!(is_conflict(&err));

        let other = anyhow::anyhow!("other error");
        assert_eq!(status_code(&other), None);
    }

    #[test]
    fn test_error_message() {
        let err = anyhow::Error::from(ApiError::new(404, "not found", Vec::new()));
        assert_eq!(error_message(&err), "not found");

        assert_eq!(error_message(&api(403)), "HTTP 403: Forbidden");
        assert_eq!(error_message(&anyhow::anyhow!("boom")), "boom");
    }

    #[test]
    fn test_client_error_kinds_are_distinguishable() {
        let exhausted = anyhow::Error::from(ClientError::MaxRetriesExceeded {
            attempts: 3,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: Bytes::new(),
        });
        assert!(is_max_retries_exceeded(&exhausted));
        assert!(!is_transport_error(&exhausted));
        assert!(!is_cancelled(&exhausted));
        assert!(
            exhausted
                .to_string()
                .contains("max retries exceeded: 500 Internal Server Error")
        );

        let cancelled = anyhow::Error::from(ClientError::Cancelled).context("listing entities");
        assert!(is_cancelled(&cancelled));

        let invalid = anyhow::Error::from(ClientError::Validation("missing id".into()));
        assert!(is_validation_error(&invalid));
        assert!(!is_decode_error(&invalid));
    }

    #[test]
    fn test_body_text() {
        let err = ApiError::new(404, "", br#"{"error":"not found"}"#.to_vec());
        assert_eq!(err.body_text(), r#"{"error":"not found"}"#);
    }
}
