//! Request and response values passed through the client pipeline.

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::ApiError;
use crate::auth::CredentialStore;

/// Immutable description of an outgoing request.
///
/// `path` is relative to the dispatcher's base URL, or an absolute URL on
/// the same origin.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Attach a JSON body.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value =
            serde_json::to_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    /// Value of the `Authorization` header, if set.
    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }
}

/// Successful response with its body fully read.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(ApiError::from)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A request plus the number of times it was already sent again after a
/// session renewal.
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub(crate) request: RequestDescriptor,
    pub(crate) retries: u32,
}

/// A request is sent again at most once after a renewal.
pub(crate) const MAX_AUTH_RETRIES: u32 = 1;

impl Attempt {
    pub(crate) fn fresh(request: RequestDescriptor) -> Self {
        Self {
            request,
            retries: 0,
        }
    }

    pub(crate) fn can_retry(&self) -> bool {
        self.retries < MAX_AUTH_RETRIES
    }

    pub(crate) fn into_retry(self) -> Self {
        Self {
            request: self.request,
            retries: self.retries + 1,
        }
    }
}

/// Return a copy of `request` carrying the store's access token as a bearer
/// credential. With an empty store the request is returned unchanged.
pub fn attach_credentials(request: &RequestDescriptor, store: &CredentialStore) -> RequestDescriptor {
    with_bearer(request, store.access_token().as_deref())
}

/// Like [`attach_credentials`], for a token that was already read from the
/// store.
pub(crate) fn with_bearer(request: &RequestDescriptor, token: Option<&str>) -> RequestDescriptor {
    let mut request = request.clone();
    let Some(token) = token else {
        return request;
    };

    match HeaderValue::from_str(&format!("Bearer {}", token)) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers.insert(header::AUTHORIZATION, value);
        }
        Err(_) => {
            warn!(path = %request.path, "Stored access token is not a valid header value");
        }
    }
    request
}
