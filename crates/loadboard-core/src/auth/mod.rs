//! Authentication module for managing user sessions and credentials.
//!
//! This module provides:
//! - `CredentialStore`: the current access and refresh token, persisted
//!   through a `KeyValueStore` (OS keychain or session file)
//! - `TokenEndpoint`: sign-in and token renewal calls
//! - `SessionObserver`: notification when the session cannot be renewed

pub mod credentials;
pub mod endpoint;
pub mod observer;
pub mod storage;

pub use credentials::{CredentialPair, CredentialStore, TokenGrant};
pub use endpoint::{HttpTokenEndpoint, TokenEndpoint};
pub use observer::{InvalidationReason, SessionObserver};
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};
