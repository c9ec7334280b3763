//! Sign-in and renewal calls against the auth API.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::credentials::{CredentialPair, TokenGrant};
use crate::api::dispatch::Dispatch;
use crate::api::request::RequestDescriptor;
use crate::api::{ApiError, RenewalFailure};

/// Default path of the login endpoint
pub const DEFAULT_LOGIN_PATH: &str = "/auth/login";

/// Default path of the token renewal endpoint
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange a username and password for a fresh credential pair.
    async fn sign_in(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError>;

    /// Exchange a refresh token for a new access token.
    async fn renew(&self, refresh_token: &str) -> Result<TokenGrant, RenewalFailure>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "accessToken", alias = "token")]
    access_token: String,
    #[serde(rename = "refreshToken", default)]
    refresh_token: Option<String>,
}

impl TokenResponse {
    fn into_grant(self) -> Result<TokenGrant, String> {
        if self.access_token.is_empty() {
            return Err("empty access token".to_string());
        }
        Ok(TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|r| !r.is_empty()),
        })
    }
}

/// [`TokenEndpoint`] speaking JSON over any [`Dispatch`].
///
/// Requests go out without an `Authorization` header.
pub struct HttpTokenEndpoint {
    dispatcher: Arc<dyn Dispatch>,
    login_path: String,
    refresh_path: String,
}

impl HttpTokenEndpoint {
    pub fn new(dispatcher: Arc<dyn Dispatch>) -> Self {
        Self::with_paths(dispatcher, DEFAULT_LOGIN_PATH, DEFAULT_REFRESH_PATH)
    }

    pub fn with_paths(
        dispatcher: Arc<dyn Dispatch>,
        login_path: impl Into<String>,
        refresh_path: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            login_path: login_path.into(),
            refresh_path: refresh_path.into(),
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn sign_in(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError> {
        let request =
            RequestDescriptor::post(&self.login_path).json(&LoginRequest { username, password })?;

        let response = self.dispatcher.dispatch(request).await?;
        let grant = response
            .json::<TokenResponse>()?
            .into_grant()
            .map_err(ApiError::InvalidResponse)?;

        debug!(renewable = grant.refresh_token.is_some(), "Sign-in accepted");
        Ok(CredentialPair {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
        })
    }

    async fn renew(&self, refresh_token: &str) -> Result<TokenGrant, RenewalFailure> {
        let request = RequestDescriptor::post(&self.refresh_path)
            .json(&RefreshRequest { refresh_token })
            .map_err(|e| RenewalFailure::from_api_error(&e))?;

        let response = self
            .dispatcher
            .dispatch(request)
            .await
            .map_err(|e| RenewalFailure::from_api_error(&e))?;

        response
            .json::<TokenResponse>()
            .map_err(|e| RenewalFailure::from_api_error(&e))?
            .into_grant()
            .map_err(RenewalFailure::InvalidResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::dispatch::HttpDispatcher;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(server: &MockServer) -> HttpTokenEndpoint {
        let dispatcher = HttpDispatcher::new(server.uri(), Duration::from_secs(5)).unwrap();
        HttpTokenEndpoint::new(Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn test_sign_in_returns_pair() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(serde_json::json!({"username": "dispatch", "password": "pw"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"accessToken": "A1", "refreshToken": "R1"})),
            )
            .mount(&server)
            .await;

        let pair = endpoint(&server).sign_in("dispatch", "pw").await.unwrap();
        assert_eq!(pair, CredentialPair::new("A1", "R1"));
    }

    #[tokio::test]
    async fn test_sign_in_bad_password() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = endpoint(&server).sign_in("dispatch", "wrong").await.unwrap_err();
        assert_eq!(err, ApiError::Unauthorized);
    }

    #[tokio::test]
    async fn test_renew_accepts_token_alias_without_rotation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(serde_json::json!({"refreshToken": "R1"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "A2"})),
            )
            .mount(&server)
            .await;

        let grant = endpoint(&server).renew("R1").await.unwrap();
        assert_eq!(grant.access_token, "A2");
        assert_eq!(grant.refresh_token, None);
    }

    #[tokio::test]
    async fn test_renew_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(403).set_body_string("revoked"))
            .mount(&server)
            .await;

        let failure = endpoint(&server).renew("R1").await.unwrap_err();
        assert_eq!(failure, RenewalFailure::Rejected { status: 403 });
    }

    #[tokio::test]
    async fn test_renew_empty_access_token_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"accessToken": "", "refreshToken": "R2"})),
            )
            .mount(&server)
            .await;

        let failure = endpoint(&server).renew("R1").await.unwrap_err();
        assert!(matches!(failure, RenewalFailure::InvalidResponse(_)));
    }
}
