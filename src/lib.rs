//! Async client core for the Port developer-portal REST API.
//!
//! [`Client`] turns method calls into authenticated requests, retries
//! transient failures and decodes JSON replies. Failures are `anyhow` errors
//! whose chain carries an [`ApiError`] or a [`ClientError`]; see the helpers
//! in [`error`] for classifying them.

pub mod auth;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod http;

pub use client::{Client, ClientBuilder};
pub use config::{ClientOptions, Config, Credentials};
pub use error::{ApiError, ClientError};
pub use tokio_util::sync::CancellationToken;
