//! HTTP plumbing: transport, replayable requests, body buffers and retries.

mod pool;
mod request;
mod retry;
mod transport;

pub use pool::{BufferPool, DEFAULT_POOL_SIZE, PooledBuffer};
pub use request::OutboundRequest;
pub use retry::{
    BASE_DELAY, DEFAULT_MAX_ATTEMPTS, MAX_JITTER, RetryExecutor, RetryPolicy, is_retryable_status,
    retry_after,
};
#[cfg(test)]
pub use transport::MockTransport;
pub use transport::{ReqwestTransport, Transport, TransportSettings};

/// User agent sent when the caller does not configure one.
pub const DEFAULT_USER_AGENT: &str = concat!("port-client/", env!("CARGO_PKG_VERSION"));
