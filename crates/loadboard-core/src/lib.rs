//! Loadboard core - authenticated API client for the freight back-office.
//!
//! The [`api::ApiClient`] attaches the stored bearer token to every request.
//! When the server reports the token as expired, exactly one renewal is
//! performed no matter how many requests are in flight; the requests that
//! failed meanwhile are replayed with the new token. If renewal fails the
//! stored session is cleared and every callback registered with
//! [`api::ApiClient::on_session_invalidated`] is called.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, RequestDescriptor, Response};
pub use auth::{CredentialPair, CredentialStore};
pub use config::Config;
