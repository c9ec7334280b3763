use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::storage::KeyValueStore;

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Access and refresh token held together.
///
/// `refresh_token` is `None` for sessions that cannot be renewed.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: Some(refresh_token.into()),
        }
    }

    pub fn access_only(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
        }
    }

    pub fn can_renew(&self) -> bool {
        self.refresh_token.is_some()
    }
}

// Tokens never end up in logs
impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Result of a successful renewal call.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Rotated refresh token, if the server issued one.
    pub refresh_token: Option<String>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("rotated", &self.refresh_token.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    pair: Option<CredentialPair>,
    generation: u64,
}

/// Holds the current session's tokens and writes them through to a
/// [`KeyValueStore`] so the session survives a restart.
///
/// Every sign-in (`set`) and every `clear` starts a new generation. Renewals
/// go through [`apply_grant`](Self::apply_grant), which refuses to touch a
/// generation other than the one the renewal started from.
pub struct CredentialStore {
    slot: RwLock<Slot>,
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    /// Create an empty store. Nothing is read from `backend`.
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            slot: RwLock::new(Slot::default()),
            backend,
        }
    }

    /// Create a store primed with whatever `backend` holds.
    pub fn load(backend: Arc<dyn KeyValueStore>) -> Self {
        let store = Self::new(backend);
        let restored = store.read_backend();
        debug!(
            restored = restored.is_some(),
            renewable = restored.as_ref().map(|p| p.can_renew()).unwrap_or(false),
            "Credential store loaded"
        );
        store.slot.write().pair = restored;
        store
    }

    fn read_backend(&self) -> Option<CredentialPair> {
        let access = match self.backend.get(ACCESS_TOKEN_KEY) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to read access token");
                None
            }
        };
        let refresh = match self.backend.get(REFRESH_TOKEN_KEY) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to read refresh token");
                None
            }
        };

        match access {
            Some(access_token) if !access_token.is_empty() => Some(CredentialPair {
                access_token,
                refresh_token: refresh.filter(|r| !r.is_empty()),
            }),
            _ => {
                if refresh.is_some() {
                    debug!("Discarding refresh token stored without an access token");
                }
                None
            }
        }
    }

    pub fn get(&self) -> Option<CredentialPair> {
        self.slot.read().pair.clone()
    }

    /// Current pair together with its generation.
    pub fn snapshot(&self) -> (Option<CredentialPair>, u64) {
        let slot = self.slot.read();
        (slot.pair.clone(), slot.generation)
    }

    pub fn access_token(&self) -> Option<String> {
        self.slot.read().pair.as_ref().map(|p| p.access_token.clone())
    }

    pub fn generation(&self) -> u64 {
        self.slot.read().generation
    }

    pub fn is_empty(&self) -> bool {
        self.slot.read().pair.is_none()
    }

    /// Replace both tokens, starting a new generation.
    pub fn set(&self, pair: CredentialPair) {
        let mut slot = self.slot.write();
        self.persist(Some(&pair));
        slot.pair = Some(pair);
        slot.generation += 1;
    }

    /// Remove both tokens. Safe to call on an empty store.
    pub fn clear(&self) {
        let mut slot = self.slot.write();
        Self::clear_locked(&mut slot, &*self.backend);
    }

    /// Remove both tokens only if no sign-in or clear happened since
    /// `generation`. Returns whether the store was cleared.
    pub fn clear_if_generation(&self, generation: u64) -> bool {
        let mut slot = self.slot.write();
        if slot.generation != generation {
            return false;
        }
        Self::clear_locked(&mut slot, &*self.backend);
        true
    }

    fn clear_locked(slot: &mut Slot, backend: &dyn KeyValueStore) {
        slot.generation += 1;
        let had_pair = slot.pair.take().is_some();
        debug!(had_pair, "Credential store cleared");
        persist_to(backend, None);
    }

    /// Apply a renewal result if `generation` is still current.
    ///
    /// A grant without a refresh token keeps the stored one. Returns the new
    /// pair, or `None` if the session changed since the renewal started.
    pub fn apply_grant(&self, generation: u64, grant: TokenGrant) -> Option<CredentialPair> {
        let mut slot = self.slot.write();
        if slot.generation != generation {
            return None;
        }
        let previous_refresh = slot.pair.as_ref().and_then(|p| p.refresh_token.clone());
        let pair = CredentialPair {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh),
        };
        self.persist(Some(&pair));
        slot.pair = Some(pair.clone());
        Some(pair)
    }

    // Callers hold the slot write lock so backend writes land in the same
    // order as in-memory updates.
    fn persist(&self, pair: Option<&CredentialPair>) {
        persist_to(&*self.backend, pair);
    }
}

fn persist_to(backend: &dyn KeyValueStore, pair: Option<&CredentialPair>) {
    let result = match pair {
        Some(pair) => backend
            .set(ACCESS_TOKEN_KEY, &pair.access_token)
            .and_then(|_| match pair.refresh_token {
                Some(ref refresh) => backend.set(REFRESH_TOKEN_KEY, refresh),
                None => backend.remove(REFRESH_TOKEN_KEY),
            }),
        None => backend
            .remove(ACCESS_TOKEN_KEY)
            .and_then(|_| backend.remove(REFRESH_TOKEN_KEY)),
    };

    if let Err(e) = result {
        warn!(error = %e, "Failed to persist credentials");
    }
}
