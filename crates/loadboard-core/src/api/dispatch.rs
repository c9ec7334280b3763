//! Network transport for the API client.
//!
//! A dispatcher sends exactly one request and reports what happened. It knows
//! nothing about credentials or renewal and never retries.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use super::request::{RequestDescriptor, Response};
use super::ApiError;

#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Send `request` once.
    ///
    /// A request that got no response fails with [`ApiError::Network`]; a
    /// non-2xx response fails with [`ApiError::from_status`].
    async fn dispatch(&self, request: RequestDescriptor) -> Result<Response, ApiError>;
}

/// [`Dispatch`] over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpDispatcher {
    client: Client,
    base_url: String,
}

impl HttpDispatcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, base_url))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve `path` against the base URL. Absolute URLs are only accepted
    /// on the base URL's origin, since the request may carry a bearer token.
    fn url(&self, path: &str) -> Result<String, ApiError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            let target = Url::parse(path)
                .map_err(|e| ApiError::InvalidRequest(format!("{}: {}", path, e)))?;
            let base = Url::parse(&self.base_url)
                .map_err(|e| ApiError::InvalidRequest(format!("{}: {}", self.base_url, e)))?;
            if target.origin() != base.origin() {
                return Err(ApiError::InvalidRequest(format!(
                    "{} is not on {}",
                    path,
                    base.origin().ascii_serialization()
                )));
            }
            Ok(path.to_string())
        } else if path.starts_with('/') {
            Ok(format!("{}{}", self.base_url, path))
        } else {
            Ok(format!("{}/{}", self.base_url, path))
        }
    }
}

#[async_trait]
impl Dispatch for HttpDispatcher {
    async fn dispatch(&self, request: RequestDescriptor) -> Result<Response, ApiError> {
        let url = self.url(&request.path)?;
        debug!(method = %request.method, url = %url, "Dispatching request");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            debug!(url = %url, error = %e, "Request failed before a response arrived");
            ApiError::Network(e.to_string())
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(url = %url, status = status.as_u16(), "Request returned error status");
            return Err(ApiError::from_status(status, &body));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Response {
            status: status.as_u16(),
            headers,
            body: body.to_vec(),
        })
    }
}
