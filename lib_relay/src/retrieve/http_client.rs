//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest`, with middleware
//! retries (exponential backoff) and a uniform [`ApiResponse`] carrying
//! the status, headers and either the decoded body or the raw error text.

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Retries applied to transient failures (connect errors, 5xx, 408, 429).
const MAX_RETRIES: u32 = 3;

/// Errors raised before a usable response exists.
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// The base URL or the joined path is not a valid absolute URL.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    /// The underlying `reqwest::Client` could not be built.
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),
    /// The request failed after retries.
    #[error("request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),
    /// The response body could not be read.
    #[error("failed to read response body: {0}")]
    Body(#[from] reqwest::Error),
    /// The body was read but is not the expected JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body of a 2xx response.
    pub data: Option<T>,
    /// The raw body of a non-2xx response.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Whether the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// # Api Client
///
/// Joins relative paths onto a base URL, injects an optional Bearer token
/// and retries transient failures.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client with `reqwest`'s default timeouts.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, RetrieveError> {
        Self::build(base_url, auth_token, reqwest::Client::builder())
    }

    /// Creates a client whose every attempt is bounded by `timeout`.
    pub fn with_timeout(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RetrieveError> {
        Self::build(base_url, auth_token, reqwest::Client::builder().timeout(timeout))
    }

    fn build(
        base_url: &str,
        auth_token: Option<String>,
        builder: reqwest::ClientBuilder,
    ) -> Result<Self, RetrieveError> {
        let base_url = Url::parse(base_url)?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let client = builder.build().map_err(RetrieveError::Build)?;
        let inner = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner,
            base_url,
            auth_token,
        })
    }

    /// The base URL relative paths are joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs one request (with retries) and decodes a 2xx body as `T`.
    ///
    /// A non-2xx status is not an error: it comes back with `success ==
    /// false` and the body text in `error_body`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> Result<ApiResponse<T>, RetrieveError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response = req.send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            let bytes = response.bytes().await?;
            let data = serde_json::from_slice::<T>(&bytes)?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers,
            })
        } else {
            let error_body = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body,
                status: status.as_u16(),
                success: false,
                headers,
            })
        }
    }

    /// `GET path` without extra headers or body.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>, RetrieveError> {
        self.request::<T, ()>(Method::GET, path, None, None).await
    }
}
