//! Request gate: credential attachment and transparent renewal.
//!
//! Every business call goes through `RequestGate::execute`. A call rejected
//! with 401 is parked in a FIFO queue; a single drain task renews the
//! credential once for the whole queue and then replays it. Callers only
//! ever see the replay's outcome, or `SessionExpired` if renewal failed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::auth::{Grant, SessionManager};

use super::error::ApiError;
use super::transport::{ApiRequest, ApiResponse, Transport};

/// A call parked until renewal settles. Consumed exactly once.
struct PendingRequest {
    request: ApiRequest,
    /// Generation of the credential the server rejected
    generation: u64,
    reply: oneshot::Sender<Result<ApiResponse, ApiError>>,
}

#[derive(Default)]
struct Queue {
    waiting: VecDeque<PendingRequest>,
    draining: bool,
}

struct GateInner {
    session: SessionManager,
    transport: Arc<dyn Transport>,
    queue: Mutex<Queue>,
}

/// Wraps the transport for business calls.
/// Clone is cheap - clones share the queue and the session.
#[derive(Clone)]
pub struct RequestGate {
    inner: Arc<GateInner>,
}

impl RequestGate {
    pub fn new(session: SessionManager, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                session,
                transport,
                queue: Mutex::new(Queue::default()),
            }),
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.inner.session
    }

    /// Send a request with the current credential attached.
    ///
    /// Non-auth failures come back untouched. A 401 on an authenticated call
    /// waits for renewal and resolves with the replay's outcome.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let grant = self.inner.session.grant();
        let response = self.send(request.clone(), grant.as_ref()).await?;
        if !response.is_unauthorized() {
            return response.into_result();
        }

        let Some(grant) = grant else {
            // Nothing to renew for an anonymous call
            return response.into_result();
        };

        debug!(
            path = %request.path,
            generation = grant.generation,
            "Request unauthorized, waiting for renewal"
        );
        let reply = self.enqueue(request, grant.generation);
        reply.await.unwrap_or(Err(ApiError::SessionExpired))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.execute(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.execute(ApiRequest::post(path, body)).await?.json()
    }

    pub async fn put_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.execute(ApiRequest::put(path, body)).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::delete(path)).await
    }

    async fn send(&self, request: ApiRequest, grant: Option<&Grant>) -> Result<ApiResponse, ApiError> {
        let request = request.with_bearer(grant.map(|g| g.access_token.clone()));
        Ok(self.inner.transport.send(request).await?)
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a rejected call and make sure a drain task is running.
    fn enqueue(
        &self,
        request: ApiRequest,
        generation: u64,
    ) -> oneshot::Receiver<Result<ApiResponse, ApiError>> {
        let (reply, receiver) = oneshot::channel();
        let start_drain = {
            let mut queue = self.lock_queue();
            queue.waiting.push_back(PendingRequest {
                request,
                generation,
                reply,
            });
            !std::mem::replace(&mut queue.draining, true)
        };

        if start_drain {
            let gate = self.clone();
            tokio::spawn(gate.drain());
        }
        receiver
    }

    /// Renew once per batch, then settle the batch in FIFO order.
    ///
    /// Runs until the queue is empty; calls parked while a batch is being
    /// settled form the next batch.
    async fn drain(self) {
        loop {
            let newest = {
                let mut queue = self.lock_queue();
                match queue.waiting.iter().map(|p| p.generation).max() {
                    Some(generation) => generation,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            match self.inner.session.renew_from(newest).await {
                Ok(_) => {
                    // Calls rejected with the credential just installed need
                    // a renewal of their own on the next pass.
                    let batch = self.take_settled(self.inner.session.generation());
                    info!(count = batch.len(), "Replaying queued requests");
                    // join_all starts futures in order, so dispatch stays FIFO
                    let replays = batch.into_iter().map(|pending| {
                        let gate = self.clone();
                        async move {
                            let outcome = gate.replay(pending.request).await;
                            let _ = pending.reply.send(outcome);
                        }
                    });
                    join_all(replays).await;
                }
                Err(e) => {
                    let batch: Vec<PendingRequest> = self.lock_queue().waiting.drain(..).collect();
                    warn!(count = batch.len(), error = %e, "Renewal failed, failing queued requests");
                    for pending in batch {
                        let _ = pending.reply.send(Err(ApiError::SessionExpired));
                    }
                }
            }
        }
    }

    /// Remove the calls rejected with a credential older than `current`,
    /// keeping queue order.
    fn take_settled(&self, current: u64) -> Vec<PendingRequest> {
        let mut queue = self.lock_queue();
        let (settled, later): (VecDeque<_>, VecDeque<_>) = queue
            .waiting
            .drain(..)
            .partition(|pending| pending.generation < current);
        queue.waiting = later;
        Vec::from(settled)
    }

    /// Resend a parked call with the renewed credential.
    ///
    /// A second 401 for the same call ends the session instead of renewing
    /// again, which bounds every call to one replay.
    async fn replay(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let Some(grant) = self.inner.session.grant() else {
            return Err(ApiError::SessionExpired);
        };
        let path = request.path.clone();
        let response = self.send(request, Some(&grant)).await?;
        if response.is_unauthorized() {
            warn!(path = %path, "Replayed request rejected again, ending session");
            self.inner.session.expire();
            return Err(ApiError::SessionExpired);
        }
        response.into_result()
    }
}

// ============================================================================
// Tests
// ============================================================================
