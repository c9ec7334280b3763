//! Session renewal coordinator.
//!
//! Sends requests with the current access token and, when the server answers
//! 401, renews the session with the stored refresh token. Renewal is
//! single-flight: the first request to see a 401 starts exactly one renewal
//! call, and every request that fails while it is outstanding waits in a FIFO
//! queue. When the renewal settles the queue is either replayed with the new
//! token or rejected, in which case the credential store is cleared and the
//! [`SessionObserver`] is told before any waiter sees its error.
//!
//! A request is sent again at most once after a renewal. A second 401 is
//! reported as [`ApiError::UnauthorizedAfterRenewal`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::dispatch::Dispatch;
use super::request::{with_bearer, Attempt, RequestDescriptor, Response};
use super::{ApiError, RenewalFailure};
use crate::auth::{CredentialStore, InvalidationReason, SessionObserver, TokenEndpoint};

/// Default upper bound for a single renewal call
pub const DEFAULT_RENEWAL_TIMEOUT: Duration = Duration::from_secs(15);

type Responder = oneshot::Sender<Result<Response, ApiError>>;

/// A request parked until the current renewal settles.
struct PendingRequest {
    attempt: Attempt,
    responder: Responder,
}

enum RenewalState {
    Idle,
    Refreshing { queue: VecDeque<PendingRequest> },
}

/// What a request that got a 401 does next.
enum Recovery {
    /// The stored token changed while the request was in flight.
    Retry(Attempt),
    /// Wait for the renewal to settle.
    Wait(oneshot::Receiver<Result<Response, ApiError>>),
    Reject(ApiError),
}

struct Inner {
    state: Mutex<RenewalState>,
    store: Arc<CredentialStore>,
    dispatcher: Arc<dyn Dispatch>,
    endpoint: Arc<dyn TokenEndpoint>,
    observer: Arc<SessionObserver>,
    renewal_timeout: Duration,
    renewals: AtomicU64,
}

/// Returns the coordinator to `Idle` if the renewal task stops before it
/// has an outcome, e.g. because the endpoint panicked.
struct SettleOnDrop<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl SettleOnDrop<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let queue = self.inner.take_queue();
        warn!(rejected = queue.len(), "Session renewal ended without an outcome");
        let err = ApiError::RenewalFailed(RenewalFailure::SessionEnded);
        for pending in queue {
            let _ = pending.responder.send(Err(err.clone()));
        }
    }
}

/// Clone is cheap; clones share the same renewal state.
#[derive(Clone)]
pub struct RenewalCoordinator {
    inner: Arc<Inner>,
}

impl RenewalCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        dispatcher: Arc<dyn Dispatch>,
        endpoint: Arc<dyn TokenEndpoint>,
        observer: Arc<SessionObserver>,
        renewal_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RenewalState::Idle),
                store,
                dispatcher,
                endpoint,
                observer,
                renewal_timeout,
                renewals: AtomicU64::new(0),
            }),
        }
    }

    /// Send `request`, renewing the session once if it is rejected as
    /// unauthorized.
    pub async fn execute(&self, request: RequestDescriptor) -> Result<Response, ApiError> {
        self.inner.execute(Attempt::fresh(request)).await
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.state.lock(), RenewalState::Refreshing { .. })
    }

    /// Number of renewal calls issued so far.
    pub fn renewal_count(&self) -> u64 {
        self.inner.renewals.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    pub fn observer(&self) -> &Arc<SessionObserver> {
        &self.inner.observer
    }
}

impl Inner {
    async fn execute(self: &Arc<Self>, mut attempt: Attempt) -> Result<Response, ApiError> {
        loop {
            let sent_with = self.store.access_token();
            let request = with_bearer(&attempt.request, sent_with.as_deref());

            match self.dispatcher.dispatch(request).await {
                Err(ApiError::Unauthorized) if attempt.can_retry() => {}
                Err(ApiError::Unauthorized) => return Err(ApiError::UnauthorizedAfterRenewal),
                other => return other,
            }

            match self.recover(attempt, sent_with.as_deref()) {
                Recovery::Retry(next) => attempt = next,
                Recovery::Wait(rx) => {
                    return rx
                        .await
                        .unwrap_or(Err(ApiError::RenewalFailed(RenewalFailure::SessionEnded)));
                }
                Recovery::Reject(err) => return Err(err),
            }
        }
    }

    /// Decide what to do with a fresh attempt that came back 401.
    fn recover(self: &Arc<Self>, attempt: Attempt, sent_with: Option<&str>) -> Recovery {
        let mut state = self.state.lock();
        let (current, generation) = self.store.snapshot();

        if let Some(ref pair) = current {
            if sent_with != Some(pair.access_token.as_str()) {
                debug!(path = %attempt.request.path, "Credential changed in flight, retrying");
                return Recovery::Retry(attempt.into_retry());
            }
        }

        if let RenewalState::Refreshing { ref mut queue } = *state {
            debug!(path = %attempt.request.path, queued = queue.len() + 1, "Waiting for session renewal");
            let (tx, rx) = oneshot::channel();
            queue.push_back(PendingRequest {
                attempt,
                responder: tx,
            });
            return Recovery::Wait(rx);
        }

        let Some(refresh_token) = current.as_ref().and_then(|p| p.refresh_token.clone()) else {
            // Never guess a renewal without a refresh token
            let had_session = current.is_some();
            if had_session && !self.store.clear_if_generation(generation) {
                debug!(path = %attempt.request.path, "Signed in again meanwhile, retrying");
                return Recovery::Retry(attempt.into_retry());
            }
            drop(state);

            let failure = RenewalFailure::MissingRefreshToken;
            if had_session {
                warn!("Access token rejected and no refresh token stored");
                self.observer.notify_invalidated(InvalidationReason {
                    failure: failure.clone(),
                });
            }
            return Recovery::Reject(ApiError::RenewalFailed(failure));
        };

        let (tx, rx) = oneshot::channel();
        let mut queue = VecDeque::new();
        queue.push_back(PendingRequest {
            attempt,
            responder: tx,
        });
        *state = RenewalState::Refreshing { queue };
        drop(state);

        self.renewals.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(Arc::clone(self).renew(refresh_token, generation));
        Recovery::Wait(rx)
    }

    /// Runs detached from any caller so the queue is settled even if the
    /// request that started the renewal is dropped.
    async fn renew(self: Arc<Self>, refresh_token: String, generation: u64) {
        debug!(timeout_ms = self.renewal_timeout.as_millis() as u64, "Renewing session");
        let mut guard = SettleOnDrop {
            inner: &*self,
            armed: true,
        };

        let outcome = match tokio::time::timeout(
            self.renewal_timeout,
            self.endpoint.renew(&refresh_token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RenewalFailure::TimedOut),
        };
        guard.disarm();

        match outcome {
            Ok(grant) => {
                if self.store.apply_grant(generation, grant).is_some() {
                    let queue = self.take_queue();
                    info!(queued = queue.len(), "Session renewed");
                    self.replay(queue).await;
                } else {
                    self.settle_superseded().await;
                }
            }
            Err(failure) => {
                let queue = {
                    let mut state = self.state.lock();
                    if self.store.clear_if_generation(generation) {
                        Some(Self::drain(&mut state))
                    } else {
                        None
                    }
                };

                let Some(queue) = queue else {
                    self.settle_superseded().await;
                    return;
                };

                warn!(error = %failure, rejected = queue.len(), "Session renewal failed");
                self.observer.notify_invalidated(InvalidationReason {
                    failure: failure.clone(),
                });
                let err = ApiError::RenewalFailed(failure);
                for pending in queue {
                    let _ = pending.responder.send(Err(err.clone()));
                }
            }
        }
    }

    /// The session was signed out or replaced while the renewal ran.
    async fn settle_superseded(&self) {
        let queue = self.take_queue();
        info!(queued = queue.len(), "Session changed during renewal, discarding result");

        if self.store.is_empty() {
            let err = ApiError::RenewalFailed(RenewalFailure::SessionEnded);
            for pending in queue {
                let _ = pending.responder.send(Err(err.clone()));
            }
        } else {
            self.replay(queue).await;
        }
    }

    /// Send every queued request once more with the current token. Replays
    /// start in queue order.
    async fn replay(&self, queue: VecDeque<PendingRequest>) {
        let replays = queue.into_iter().map(|pending| async move {
            let result = self.send_once(pending.attempt.into_retry()).await;
            // The caller may have stopped waiting
            let _ = pending.responder.send(result);
        });
        join_all(replays).await;
    }

    async fn send_once(&self, attempt: Attempt) -> Result<Response, ApiError> {
        let token = self.store.access_token();
        let request = with_bearer(&attempt.request, token.as_deref());
        match self.dispatcher.dispatch(request).await {
            Err(ApiError::Unauthorized) => {
                debug!(path = %attempt.request.path, "Still unauthorized after renewal");
                Err(ApiError::UnauthorizedAfterRenewal)
            }
            other => other,
        }
    }

    fn take_queue(&self) -> VecDeque<PendingRequest> {
        Self::drain(&mut self.state.lock())
    }

    fn drain(state: &mut RenewalState) -> VecDeque<PendingRequest> {
        match std::mem::replace(state, RenewalState::Idle) {
            RenewalState::Refreshing { queue } => queue,
            RenewalState::Idle => VecDeque::new(),
        }
    }
}
