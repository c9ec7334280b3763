//! REST API client module for the loadboard back-office.
//!
//! This module provides the `ApiClient` for talking to the back-office API
//! with bearer token authentication. Expired tokens are renewed
//! transparently: concurrent requests that hit a 401 share a single renewal
//! and are replayed once it succeeds.

pub mod client;
pub mod dispatch;
pub mod error;
pub mod renewal;
pub mod request;

pub use client::{ApiClient, ApiClientBuilder};
pub use dispatch::{Dispatch, HttpDispatcher};
pub use error::{ApiError, ErrorCategory, RenewalFailure};
pub use renewal::RenewalCoordinator;
pub use request::{attach_credentials, RequestDescriptor, Response};
