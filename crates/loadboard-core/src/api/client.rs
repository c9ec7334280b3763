//! API client for the loadboard back-office REST API.
//!
//! `ApiClient` is the single entry point used by the rest of the
//! application: it attaches the stored bearer token, sends the request and
//! transparently renews the session when the token has expired.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use super::dispatch::{Dispatch, HttpDispatcher};
use super::renewal::{RenewalCoordinator, DEFAULT_RENEWAL_TIMEOUT};
use super::request::{RequestDescriptor, Response};
use super::ApiError;
use crate::auth::{
    CredentialStore, HttpTokenEndpoint, InvalidationReason, KeyValueStore, SessionObserver,
    TokenEndpoint,
};
use crate::config::Config;

/// Authenticated API client.
/// Clone is cheap - clones share the connection pool, credential store and
/// renewal state.
#[derive(Clone)]
pub struct ApiClient {
    coordinator: RenewalCoordinator,
    endpoint: Arc<dyn TokenEndpoint>,
}

/// Assembles an [`ApiClient`] from custom parts.
pub struct ApiClientBuilder {
    dispatcher: Arc<dyn Dispatch>,
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<CredentialStore>,
    observer: Arc<SessionObserver>,
    renewal_timeout: Duration,
}

impl ApiClientBuilder {
    pub fn observer(mut self, observer: Arc<SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn renewal_timeout(mut self, timeout: Duration) -> Self {
        self.renewal_timeout = timeout;
        self
    }

    pub fn build(self) -> ApiClient {
        let coordinator = RenewalCoordinator::new(
            self.store,
            self.dispatcher,
            Arc::clone(&self.endpoint),
            self.observer,
            self.renewal_timeout,
        );
        ApiClient {
            coordinator,
            endpoint: self.endpoint,
        }
    }
}

impl ApiClient {
    /// Create a client talking HTTP to `config.base_url`, restoring any
    /// session persisted in `backend`.
    pub fn from_config(config: &Config, backend: Arc<dyn KeyValueStore>) -> Result<Self> {
        let dispatcher: Arc<dyn Dispatch> = Arc::new(HttpDispatcher::new(
            config.base_url.clone(),
            config.request_timeout(),
        )?);
        let endpoint = Arc::new(HttpTokenEndpoint::with_paths(
            Arc::clone(&dispatcher),
            config.login_path.clone(),
            config.refresh_path.clone(),
        ));
        let store = Arc::new(CredentialStore::load(backend));

        Ok(Self::builder(dispatcher, endpoint, store)
            .renewal_timeout(config.renewal_timeout())
            .build())
    }

    pub fn builder(
        dispatcher: Arc<dyn Dispatch>,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<CredentialStore>,
    ) -> ApiClientBuilder {
        ApiClientBuilder {
            dispatcher,
            endpoint,
            store,
            observer: Arc::new(SessionObserver::new()),
            renewal_timeout: DEFAULT_RENEWAL_TIMEOUT,
        }
    }

    /// Send a request with the current credentials.
    pub async fn request(&self, request: RequestDescriptor) -> Result<Response, ApiError> {
        self.coordinator.execute(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(RequestDescriptor::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestDescriptor::post(path).json(body)?)
            .await?
            .json()
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestDescriptor::put(path).json(body)?)
            .await?
            .json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.request(RequestDescriptor::delete(path)).await?;
        Ok(())
    }

    /// Register a callback for when the session can no longer be renewed.
    pub fn on_session_invalidated<F>(&self, callback: F)
    where
        F: Fn(&InvalidationReason) + Send + Sync + 'static,
    {
        self.coordinator.observer().on_invalidated(callback);
    }

    /// Sign in and store the resulting credentials.
    pub async fn sign_in(&self, username: &str, password: &str) -> Result<(), ApiError> {
        match self.endpoint.sign_in(username, password).await {
            Ok(pair) => {
                self.credentials().set(pair);
                info!(username = username, "Signed in");
                Ok(())
            }
            Err(e) => {
                warn!(username = username, error = %e, "Sign-in failed");
                Err(e)
            }
        }
    }

    /// Forget the stored credentials. Does not notify session observers.
    pub fn sign_out(&self) {
        self.credentials().clear();
        info!("Signed out");
    }

    pub fn is_authenticated(&self) -> bool {
        !self.credentials().is_empty()
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        self.coordinator.store()
    }

    /// Number of session renewals performed by this client.
    pub fn renewal_count(&self) -> u64 {
        self.coordinator.renewal_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialPair, MemoryStore};
    use crate::config::CredentialBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> Config {
        Config {
            base_url: server.uri(),
            credential_backend: CredentialBackend::File,
            renewal_timeout_secs: 5,
            ..Config::default()
        }
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"accessToken": "A1", "refreshToken": "R1"})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_sign_in_then_request() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/loads"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 1}])))
            .mount(&server)
            .await;

        let client = ApiClient::from_config(&config_for(&server), Arc::new(MemoryStore::new())).unwrap();
        assert!(!client.is_authenticated());

        client.sign_in("dispatch", "pw").await.unwrap();
        assert!(client.is_authenticated());

        let loads: Vec<serde_json::Value> = client.get_json("/loads").await.unwrap();
        assert_eq!(loads.len(), 1);
        assert_eq!(client.renewal_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_is_renewed_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/shipments"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(serde_json::json!({"refreshToken": "R1"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"accessToken": "A2", "refreshToken": "R2"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/shipments"))
            .and(header("authorization", "Bearer A2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(3)
            .mount(&server)
            .await;

        let backend = Arc::new(MemoryStore::new());
        backend.set("access_token", "A1").unwrap();
        backend.set("refresh_token", "R1").unwrap();
        let client = ApiClient::from_config(&config_for(&server), backend.clone()).unwrap();

        let results = futures::future::join_all(
            (0..3).map(|_| client.get_json::<Vec<serde_json::Value>>("/shipments")),
        )
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(client.renewal_count(), 1);
        assert_eq!(client.credentials().get(), Some(CredentialPair::new("A2", "R2")));
        // Renewed tokens are written through
        assert_eq!(backend.get("access_token").unwrap().as_deref(), Some("A2"));
        assert_eq!(backend.get("refresh_token").unwrap().as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_token_signs_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(CredentialStore::new(Arc::new(MemoryStore::new())));
        store.set(CredentialPair::new("A1", "R1"));
        let dispatcher: Arc<dyn Dispatch> =
            Arc::new(HttpDispatcher::new(server.uri(), Duration::from_secs(5)).unwrap());
        let endpoint = Arc::new(HttpTokenEndpoint::new(Arc::clone(&dispatcher)));
        let client = ApiClient::builder(dispatcher, endpoint, store).build();

        let invalidations = Arc::new(AtomicUsize::new(0));
        {
            let invalidations = Arc::clone(&invalidations);
            client.on_session_invalidated(move |_| {
                invalidations.fetch_add(1, Ordering::SeqCst);
            });
        }

        let err = client.request(RequestDescriptor::get("/users")).await.unwrap_err();

        assert!(err.requires_sign_in());
        assert!(!client.is_authenticated());
        assert_eq!(invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sign_out_twice() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        let client = ApiClient::from_config(&config_for(&server), Arc::new(MemoryStore::new())).unwrap();
        client.sign_in("dispatch", "pw").await.unwrap();

        client.sign_out();
        client.sign_out();
        assert!(!client.is_authenticated());
        assert!(client.credentials().get().is_none());
    }

    #[tokio::test]
    async fn test_failed_sign_in_keeps_store_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = ApiClient::from_config(&config_for(&server), Arc::new(MemoryStore::new())).unwrap();
        let err = client.sign_in("dispatch", "wrong").await.unwrap_err();

        assert_eq!(err, ApiError::Unauthorized);
        assert!(!client.is_authenticated());
    }
}
