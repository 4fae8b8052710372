//! Transport capability.
//!
//! The dispatcher only ever talks to a [`Transport`]. A lightweight HTTP
//! client ships with the crate; a browser-rendering engine can be plugged in
//! by the embedding application under [`TransportMode::Browser`].

pub mod reqwest_client;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CACHE_CONTROL, DNT, HeaderMap, HeaderName,
    HeaderValue, InvalidHeaderValue, UPGRADE_INSECURE_REQUESTS, USER_AGENT,
};
use http::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::modules::identity::ProxyAddress;

pub use reqwest_client::ReqwestTransport;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    #[default]
    Http,
    Browser,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportMode::Http => "http",
            TransportMode::Browser => "browser",
        })
    }
}

/// Whether consecutive requests of a run share cookies and connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// One session per identity, kept for the whole run.
    #[default]
    Persistent,
    /// A fresh session for every request.
    PerRequest,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionMode::Persistent => "persistent",
            SessionMode::PerRequest => "per-request",
        })
    }
}

/// Request template reused for every attempt of a run.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl RequestSpec {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
        }
    }

    /// GET with the header set of a desktop browser navigation.
    pub fn browser_like(url: Url) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
        headers.insert(DNT, HeaderValue::from_static("1"));
        headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
        headers.insert(HeaderName::from_static("sec-fetch-dest"), HeaderValue::from_static("document"));
        headers.insert(HeaderName::from_static("sec-fetch-mode"), HeaderValue::from_static("navigate"));
        headers.insert(HeaderName::from_static("sec-fetch-site"), HeaderValue::from_static("none"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

        Self {
            method: Method::GET,
            url,
            headers,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_user_agent(self, user_agent: &str) -> Result<Self, InvalidHeaderValue> {
        let value = HeaderValue::from_str(user_agent)?;
        Ok(self.with_header(USER_AGENT, value))
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get(USER_AGENT).and_then(|value| value.to_str().ok())
    }
}

/// One fetch: request template bound to an identity and a deadline.
#[derive(Debug, Clone, Copy)]
pub struct TransportRequest<'a> {
    pub spec: &'a RequestSpec,
    pub proxy: Option<&'a ProxyAddress>,
    pub timeout: Duration,
    pub session: SessionMode,
    /// Bytes of body worth keeping; the rest is only counted.
    pub body_limit: usize,
}

impl<'a> TransportRequest<'a> {
    pub fn new(spec: &'a RequestSpec, proxy: Option<&'a ProxyAddress>, timeout: Duration) -> Self {
        Self {
            spec,
            proxy,
            timeout,
            session: SessionMode::Persistent,
            body_limit: usize::MAX,
        }
    }

    pub fn with_session(mut self, session: SessionMode) -> Self {
        self.session = session;
        self
    }

    pub fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Body prefix, at most the request's `body_limit` bytes.
    pub body: Bytes,
    /// Size of the whole body as received.
    pub body_size: usize,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            headers: HeaderMap::new(),
            body_size: body.len(),
            body,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("proxy rejected the request: {0}")]
    Proxy(String),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// Contract implemented by every fetch backend.
///
/// Implementations must honour `request.timeout`; the dispatcher also
/// enforces it as an outer bound.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &TransportRequest<'_>) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_like_request_carries_navigation_headers() {
        let spec = RequestSpec::browser_like(Url::parse("https://example.com").unwrap());
        assert_eq!(spec.method, Method::GET);
        assert_eq!(spec.user_agent(), Some(DEFAULT_USER_AGENT));
        assert_eq!(spec.headers.get("sec-fetch-mode").unwrap(), "navigate");
        assert!(spec.headers.contains_key(ACCEPT_LANGUAGE));
    }

    #[test]
    fn user_agent_can_be_overridden_or_emptied() {
        let spec = RequestSpec::browser_like(Url::parse("https://example.com").unwrap())
            .with_user_agent("python-requests/2.31.0")
            .unwrap();
        assert_eq!(spec.user_agent(), Some("python-requests/2.31.0"));

        let spec = spec.with_user_agent("").unwrap();
        assert_eq!(spec.user_agent(), Some(""));

        assert!(RequestSpec::get(Url::parse("https://example.com").unwrap())
            .with_user_agent("bad\nagent")
            .is_err());
    }
}
