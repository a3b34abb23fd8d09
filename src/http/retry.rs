//! Retry logic for transient failures: 5xx, 429 and network errors.

use anyhow::{Context, Result};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::request::OutboundRequest;
use super::transport::Transport;
use crate::error::ClientError;

/// Attempts made by default for a single API call.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Delay before the second attempt; doubled for every attempt after that.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound (exclusive) of the random jitter added to each backoff.
pub const MAX_JITTER: Duration = Duration::from_millis(500);

/// Largest exponent used when doubling the backoff.
const MAX_BACKOFF_EXPONENT: usize = 16;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_jitter: Duration,
    /// Fixed jitter seed. `None` seeds every call from OS entropy.
    pub seed: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: BASE_DELAY,
            max_jitter: MAX_JITTER,
            seed: None,
        }
    }
}

impl RetryPolicy {
    /// A fresh jitter source for one call.
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `base_delay * 2^(attempt-1)` plus jitter in `[0, max_jitter)`.
    pub fn backoff(&self, attempt: usize, rng: &mut impl Rng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT) as u32;
        let backoff = self.base_delay.saturating_mul(1u32 << exponent);
        let max_jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if max_jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..max_jitter_ms))
        };
        backoff + jitter
    }
}

/// Whether a response status should be retried.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Parses a `Retry-After` header given in whole seconds. Zero, HTTP dates and
/// garbage yield `None` so the regular backoff applies.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

/// Sends requests through a [`Transport`], retrying transient failures.
#[derive(Clone)]
pub struct RetryExecutor {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Sends `request` up to `max_attempts` times (at least once).
    ///
    /// Returns the first response that is neither 5xx nor 429; callers decide
    /// what to do with 3xx and 4xx. When every attempt fails with a retryable
    /// status the result is [`ClientError::MaxRetriesExceeded`] carrying the
    /// last status and body; when every attempt fails at the network level the
    /// last transport error is returned.
    #[tracing::instrument(
        skip(self, cancel, request),
        fields(method = %request.method(), url = %request.url())
    )]
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        request: &OutboundRequest,
        max_attempts: usize,
    ) -> Result<Response> {
        let attempts = max_attempts.max(1);
        let mut rng = self.policy.rng();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::Cancelled.into()),
                outcome = self.transport.send(request.to_request()) => outcome,
            };

            let wait = match outcome {
                Ok(response) if !is_retryable_status(response.status()) => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if attempt >= attempts {
                        let body = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(ClientError::Cancelled.into()),
                            body = response.bytes() => body.unwrap_or_default(),
                        };
                        return Err(ClientError::MaxRetriesExceeded {
                            attempts,
                            status,
                            body,
                        }
                        .into());
                    }
                    let hint = retry_after(response.headers());
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled.into()),
                        _ = drain(response) => {}
                    }
                    let wait = hint.unwrap_or_else(|| self.policy.backoff(attempt, &mut rng));
                    warn!(
                        "{} {}: attempt {}/{} returned {}, retrying in {}ms...",
                        request.method(),
                        request.url().path(),
                        attempt,
                        attempts,
                        status,
                        wait.as_millis()
                    );
                    wait
                }
                Err(err) => {
                    if attempt >= attempts {
                        return Err(err).with_context(|| {
                            format!(
                                "{} {}: request failed after {} attempt(s)",
                                request.method(),
                                request.url().path(),
                                attempts
                            )
                        });
                    }
                    let wait = self.policy.backoff(attempt, &mut rng);
                    warn!(
                        "{} {}: attempt {}/{} failed ({}), retrying in {}ms...",
                        request.method(),
                        request.url().path(),
                        attempt,
                        attempts,
                        err,
                        wait.as_millis()
                    );
                    wait
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("cancelled while waiting to retry");
                    return Err(ClientError::Cancelled.into());
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// Reads a response to the end so its connection can go back to the pool.
async fn drain(mut response: Response) {
    while let Ok(Some(_)) = response.chunk().await {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{is_cancelled, is_max_retries_exceeded, is_transport_error};
    use crate::http::transport::{MockTransport, ReqwestTransport};
    use bytes::Bytes;
    use reqwest::Method;
    use reqwest::header::HeaderValue;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_jitter: Duration::from_millis(5),
            seed: Some(7),
        }
    }

    fn executor(policy: RetryPolicy) -> RetryExecutor {
        RetryExecutor::new(Arc::new(ReqwestTransport::new().unwrap()), policy)
    }

    fn stub_response(status: u16) -> Response {
        Response::from(
            http::Response::builder()
                .status(status)
                .body("")
                .unwrap(),
        )
    }

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::OK));
        assert!(!is_retryable_status(StatusCode::MOVED_PERMANENTLY));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::CONFLICT));
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("0"));
        assert_eq!(retry_after(&headers), None);

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_backoff_grows_exponentially_with_bounded_jitter() {
        let policy = RetryPolicy::default();
        let mut rng = policy.rng();
        for attempt in 1..=4 {
            let base = Duration::from_secs(1 << (attempt - 1));
            let wait = policy.backoff(attempt, &mut rng);
            assert!(wait >= base, "attempt {}: {:?}", attempt, wait);
            assert!(wait < base + MAX_JITTER, "attempt {}: {:?}", attempt, wait);
        }
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let policy = RetryPolicy {
            seed: Some(42),
            ..RetryPolicy::default()
        };
        let first: Vec<_> = {
            let mut rng = policy.rng();
            (1..=3).map(|a| policy.backoff(a, &mut rng)).collect()
        };
        let second: Vec<_> = {
            let mut rng = policy.rng();
            (1..=3).map(|a| policy.backoff(a, &mut rng)).collect()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_jitter() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_jitter: Duration::ZERO,
            seed: None,
        };
        let mut rng = policy.rng();
        assert_eq!(policy.backoff(3, &mut rng), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_send_success_first_attempt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/blueprints")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let request =
            OutboundRequest::new(Method::GET, &format!("{}/v1/blueprints", server.url())).unwrap();
        let response = executor(fast_policy())
            .send(&CancellationToken::new(), &request, 3)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_send_retries_server_errors_and_replays_body() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/v1/entities")
            .match_body(r#"{"identifier":"svc"}"#)
            .with_status(503)
            .expect(2)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/v1/entities")
            .match_body(r#"{"identifier":"svc"}"#)
            .with_status(201)
            .expect(1)
            .create_async()
            .await;

        let request = OutboundRequest::new(Method::POST, &format!("{}/v1/entities", server.url()))
            .unwrap()
            .with_json_body(Bytes::from_static(br#"{"identifier":"svc"}"#));
        let response = executor(fast_policy())
            .send(&CancellationToken::new(), &request, 3)
            .await
            .unwrap();

        failing.assert_async().await;
        ok.assert_async().await;
        assert_eq!(response.status(), 201);
    }

    #[tokio::test]
    async fn test_send_does_not_retry_client_errors() {
        for status in [400u16, 401, 403, 404, 409, 422] {
            let mut server = mockito::Server::new_async().await;
            let mock = server
                .mock("GET", "/v1/x")
                .with_status(status as usize)
                .expect(1)
                .create_async()
                .await;

            let request =
                OutboundRequest::new(Method::GET, &format!("{}/v1/x", server.url())).unwrap();
            let response = executor(fast_policy())
                .send(&CancellationToken::new(), &request, 3)
                .await
                .unwrap();

            mock.assert_async().await;
            assert_eq!(response.status().as_u16(), status);
        }
    }

    #[tokio::test]
    async fn test_send_retries_rate_limit() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("GET", "/v1/x")
            .with_status(429)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/v1/x")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let request = OutboundRequest::new(Method::GET, &format!("{}/v1/x", server.url())).unwrap();
        let response = executor(fast_policy())
            .send(&CancellationToken::new(), &request, 2)
            .await
            .unwrap();

        limited.assert_async().await;
        ok.assert_async().await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_send_honors_retry_after() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("GET", "/v1/x")
            .with_status(429)
            .with_header("Retry-After", "2")
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/v1/x")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let request = OutboundRequest::new(Method::GET, &format!("{}/v1/x", server.url())).unwrap();
        let start = Instant::now();
        executor(fast_policy())
            .send(&CancellationToken::new(), &request, 3)
            .await
            .unwrap();

        limited.assert_async().await;
        ok.assert_async().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_send_max_retries_exceeded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/x")
            .with_status(500)
            .with_body("upstream down")
            .expect(3)
            .create_async()
            .await;

        let request = OutboundRequest::new(Method::GET, &format!("{}/v1/x", server.url())).unwrap();
        let err = executor(fast_policy())
            .send(&CancellationToken::new(), &request, 3)
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(is_max_retries_exceeded(&err));
        assert!(!is_transport_error(&err));
        match err.downcast_ref::<ClientError>() {
            Some(ClientError::MaxRetriesExceeded {
                attempts,
                status,
                body,
            }) => {
                assert_eq!(*attempts, 3);
                assert_eq!(*status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body.as_ref(), b"upstream down");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_zero_attempts_means_one() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/x")
            .with_status(502)
            .expect(1)
            .create_async()
            .await;

        let request = OutboundRequest::new(Method::GET, &format!("{}/v1/x", server.url())).unwrap();
        let err = executor(fast_policy())
            .send(&CancellationToken::new(), &request, 0)
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(is_max_retries_exceeded(&err));
    }

    #[tokio::test]
    async fn test_send_transport_error_after_retries() {
        let request = OutboundRequest::new(Method::GET, "http://127.0.0.1:1/v1/x").unwrap();
        let err = executor(fast_policy())
            .send(&CancellationToken::new(), &request, 2)
            .await
            .unwrap_err();

        assert!(is_transport_error(&err));
        assert!(!is_max_retries_exceeded(&err));
        assert!(err.to_string().contains("failed after 2 attempt(s)"));
    }

    #[tokio::test]
    async fn test_send_cancelled_during_backoff() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/x")
            .with_status(503)
            .with_header("Retry-After", "30")
            .create_async()
            .await;

        let request = OutboundRequest::new(Method::GET, &format!("{}/v1/x", server.url())).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = executor(fast_policy())
            .send(&cancel, &request, 3)
            .await
            .unwrap_err();

        assert!(is_cancelled(&err));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_send_cancelled_while_reading_exhausted_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/x")
            .with_status(500)
            .with_chunked_body(|w| {
                w.write_all(b"upstream")?;
                std::thread::sleep(Duration::from_secs(4));
                w.write_all(b" down")
            })
            .create_async()
            .await;

        let request = OutboundRequest::new(Method::GET, &format!("{}/v1/x", server.url())).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = executor(fast_policy())
            .send(&cancel, &request, 1)
            .await
            .unwrap_err();

        assert!(is_cancelled(&err));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_send_already_cancelled_sends_nothing() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(0);

        let request = OutboundRequest::new(Method::GET, "https://api.port.io/v1/x").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = RetryExecutor::new(Arc::new(transport), fast_policy())
            .send(&cancel, &request, 3)
            .await
            .unwrap_err();
        assert!(is_cancelled(&err));
    }

    #[tokio::test]
    async fn test_send_attempts_are_sequential_with_stub_transport() {
        let calls = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut transport = MockTransport::new();
        let calls_clone = calls.clone();
        let in_flight_clone = in_flight.clone();
        transport.expect_send().times(3).returning(move |request| {
            assert_eq!(in_flight_clone.fetch_add(1, Ordering::SeqCst), 0);
            assert_eq!(request.body().and_then(|b| b.as_bytes()), Some(&b"payload"[..]));
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            in_flight_clone.fetch_sub(1, Ordering::SeqCst);
            Ok(stub_response(if n < 2 { 500 } else { 200 }))
        });

        let request = OutboundRequest::new(Method::POST, "https://api.port.io/v1/x")
            .unwrap()
            .with_json_body(Bytes::from_static(b"payload"));
        let response = RetryExecutor::new(Arc::new(transport), fast_policy())
            .send(&CancellationToken::new(), &request, 5)
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
