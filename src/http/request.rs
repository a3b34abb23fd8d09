//! Outbound request captured in a replayable form.

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Method, Url};

use super::DEFAULT_USER_AGENT;
use crate::error::ClientError;

/// An HTTP request whose body is an immutable buffer, so that every retry
/// attempt sends exactly the same bytes.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("Invalid request URL: {}", url))?;
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    /// Attaches a JSON body and the matching content type.
    pub fn with_json_body(mut self, body: Bytes) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets `User-Agent` unless the request already carries one.
    /// A blank `user_agent` falls back to the crate default.
    pub fn set_default_user_agent(&mut self, user_agent: &str) {
        if self.headers.contains_key(USER_AGENT) {
            return;
        }
        let value = match user_agent.trim() {
            "" => HeaderValue::from_static(DEFAULT_USER_AGENT),
            ua => HeaderValue::from_str(ua)
                .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_USER_AGENT)),
        };
        self.headers.insert(USER_AGENT, value);
    }

    /// Sets `Authorization: Bearer <token>`, marked sensitive so it never
    /// shows up in `Debug` output.
    pub fn set_bearer(&mut self, token: &str) -> Result<()> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            ClientError::Validation("bearer token contains invalid header characters".into())
        })?;
        value.set_sensitive(true);
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Builds a fresh `reqwest::Request` for one attempt. The body shares the
    /// captured buffer rather than consuming it.
    pub fn to_request(&self) -> reqwest::Request {
        let mut request = reqwest::Request::new(self.method.clone(), self.url.clone());
        *request.headers_mut() = self.headers.clone();
        if let Some(body) = &self.body {
            *request.body_mut() = Some(reqwest::Body::from(body.clone()));
        }
        request
    }
}
