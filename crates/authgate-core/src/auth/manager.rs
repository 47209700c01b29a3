//! Session orchestration: login, logout and credential renewal.
//!
//! `SessionManager` owns the session state machine and is the only writer
//! of the `CredentialStore`. It is cheap to clone and meant to be handed to
//! the request gate and the navigation guard at construction time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::api::client::{AuthApi, Registration};
use crate::api::error::AuthError;
use crate::api::transport::Transport;
use crate::routes::Navigator;

use super::credentials::CredentialStore;
use super::session::{Credential, Identity, SessionState};

/// A renewal that has not settled within this window counts as failed.
pub const DEFAULT_RENEWAL_TIMEOUT_SECS: u64 = 15;

/// Where the presentation layer is sent when a session ends involuntarily.
pub const DEFAULT_LOGIN_PATH: &str = "/login";

/// The single in-flight renewal every concurrent caller attaches to.
type RenewalTicket = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

/// Ticket slot entry: generation the renewal started from, the shared
/// outcome, and a handle to stop the exchange when the session ends.
struct InFlight {
    generation: u64,
    ticket: RenewalTicket,
    task: AbortHandle,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub renewal_timeout: Duration,
    pub login_path: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            renewal_timeout: Duration::from_secs(DEFAULT_RENEWAL_TIMEOUT_SECS),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
        }
    }
}

/// Access token to attach to a call, tagged with the credential generation
/// it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub access_token: String,
    pub generation: u64,
}

/// In-memory session. `credential` is `Some` exactly when `state` is
/// `Authenticated` or `Renewing` (or a re-login is in flight).
struct Slot {
    state: SessionState,
    credential: Option<Credential>,
    /// Bumped on every credential install and every session end
    generation: u64,
}

struct Inner {
    api: AuthApi,
    store: CredentialStore,
    navigator: Arc<dyn Navigator>,
    settings: SessionSettings,
    // Lock order: `ticket` before `slot`.
    ticket: Mutex<Option<InFlight>>,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<SessionState>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionManager {
    /// Create a manager, hydrating from the store once.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        navigator: Arc<dyn Navigator>,
        settings: SessionSettings,
    ) -> Self {
        let (state, credential) = match store.load() {
            Some((credential, identity)) => {
                (SessionState::Authenticated(identity), Some(credential))
            }
            None => (SessionState::Anonymous, None),
        };
        info!(state = %state, "Session hydrated");

        let (state_tx, _) = watch::channel(state.clone());
        Self {
            inner: Arc::new(Inner {
                api: AuthApi::new(transport),
                store,
                navigator,
                settings,
                ticket: Mutex::new(None),
                slot: Mutex::new(Slot {
                    state,
                    credential,
                    generation: 0,
                }),
                state_tx,
            }),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> SessionState {
        lock(&self.inner.slot).state.clone()
    }

    /// Observe state transitions. Each value is a complete state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Observe writes to the credential store.
    pub fn store_changes(&self) -> watch::Receiver<u64> {
        self.inner.store.changes()
    }

    pub fn identity(&self) -> Option<Identity> {
        lock(&self.inner.slot).state.identity().cloned()
    }

    pub fn credential(&self) -> Option<Credential> {
        lock(&self.inner.slot).credential.clone()
    }

    pub fn generation(&self) -> u64 {
        lock(&self.inner.slot).generation
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.inner.slot).state.is_authenticated()
    }

    pub fn is_admin(&self) -> bool {
        lock(&self.inner.slot).state.is_admin()
    }

    pub fn renewal_in_flight(&self) -> bool {
        lock(&self.inner.ticket).is_some()
    }

    /// Token to attach to an outgoing call, if the session is live.
    pub fn grant(&self) -> Option<Grant> {
        let slot = lock(&self.inner.slot);
        if !slot.state.is_authenticated() {
            return None;
        }
        slot.credential.as_ref().map(|credential| Grant {
            access_token: credential.access_token.clone(),
            generation: slot.generation,
        })
    }

    // =========================================================================
    // Login / Logout
    // =========================================================================

    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::InvalidCredentials(
                "Username and password required".to_string(),
            ));
        }

        let previous = {
            let mut slot = lock(&self.inner.slot);
            let previous = slot.state.clone();
            self.commit(&mut slot, SessionState::Authenticating);
            previous
        };

        match self.inner.api.login(username, password).await {
            Ok(grant) => {
                // A renewal for the previous session must not outlive it.
                let mut ticket = lock(&self.inner.ticket);
                if let Some(in_flight) = ticket.take() {
                    in_flight.task.abort();
                }
                let mut slot = lock(&self.inner.slot);
                if let Err(e) = self.inner.store.save(&grant.credential, &grant.identity) {
                    warn!(error = %e, "Failed to persist session, keeping it in memory only");
                }
                slot.credential = Some(grant.credential);
                slot.generation += 1;
                self.commit(&mut slot, SessionState::Authenticated(grant.identity.clone()));
                info!(
                    subject = %grant.identity.subject,
                    admin = grant.identity.is_admin,
                    "Login successful"
                );
                Ok(grant.identity)
            }
            Err(e) => {
                self.restore_after_failed_login(previous);
                warn!(error = %e, "Login failed");
                Err(e)
            }
        }
    }

    /// Put back the session a failed login attempt interrupted.
    ///
    /// A renewal may have settled meanwhile, so the state is rebuilt from the
    /// credential actually held rather than copied from before the attempt.
    /// A logout or expiry during the attempt wins.
    fn restore_after_failed_login(&self, previous: SessionState) {
        let ticket = lock(&self.inner.ticket);
        let mut slot = lock(&self.inner.slot);
        if slot.state != SessionState::Authenticating {
            return;
        }
        let identity = previous
            .identity()
            .cloned()
            .or_else(|| self.inner.store.current_identity());
        let restored = match (identity, slot.credential.is_some()) {
            (Some(identity), true) if ticket.is_some() => SessionState::Renewing(identity),
            (Some(identity), true) => SessionState::Authenticated(identity),
            _ => SessionState::Anonymous,
        };
        self.commit(&mut slot, restored);
    }

    /// End the session. Safe to call in any state, any number of times.
    pub fn logout(&self) {
        if self.reset() {
            info!("Logged out");
        }
    }

    /// End the session involuntarily and send the user to the login page.
    ///
    /// Only the call that actually ends a live session redirects, so a
    /// burst of concurrent expiries produces a single redirect.
    pub fn expire(&self) {
        if self.reset() {
            info!(to = %self.inner.settings.login_path, "Session expired, redirecting");
            self.inner.navigator.navigate(&self.inner.settings.login_path);
        }
    }

    /// Clear memory and storage. Returns whether a session was live.
    fn reset(&self) -> bool {
        let mut ticket = lock(&self.inner.ticket);
        if let Some(in_flight) = ticket.take() {
            in_flight.task.abort();
        }
        let mut slot = lock(&self.inner.slot);

        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear stored session");
        }

        let was_live = slot.state != SessionState::Anonymous || slot.credential.is_some();
        if was_live {
            slot.credential = None;
            slot.generation += 1;
            self.commit(&mut slot, SessionState::Anonymous);
        }
        was_live
    }

    // =========================================================================
    // Renewal
    // =========================================================================

    /// Renew the access token, or attach to the renewal already in flight.
    pub async fn renew(&self) -> Result<Credential, AuthError> {
        match self.acquire_ticket() {
            Some(ticket) => ticket.await,
            None => {
                warn!("No refresh token available, ending session");
                self.expire();
                Err(AuthError::SessionExpired)
            }
        }
    }

    /// Renew unless the credential has already moved past `generation`.
    ///
    /// Used by callers whose request was rejected with an older credential:
    /// if someone else already renewed, the current credential is returned
    /// without another exchange.
    pub async fn renew_from(&self, generation: u64) -> Result<Credential, AuthError> {
        {
            let slot = lock(&self.inner.slot);
            if slot.generation > generation {
                if let Some(credential) = slot.credential.clone() {
                    debug!(
                        rejected = generation,
                        current = slot.generation,
                        "Credential already renewed"
                    );
                    return Ok(credential);
                }
            }
        }
        self.renew().await
    }

    /// Attach to the renewal in flight, or start one.
    ///
    /// The exchange runs as its own task, so it settles (or times out) even
    /// if every caller stops waiting for it.
    fn acquire_ticket(&self) -> Option<RenewalTicket> {
        let mut ticket = lock(&self.inner.ticket);
        if let Some(in_flight) = ticket.as_ref() {
            debug!("Attaching to in-flight renewal");
            return Some(in_flight.ticket.clone());
        }

        let mut slot = lock(&self.inner.slot);
        let identity = slot.state.identity().cloned()?;
        let refresh_token = slot
            .credential
            .as_ref()
            .map(|c| c.refresh_token.clone())
            .filter(|token| !token.is_empty())?;

        let generation = slot.generation;
        self.commit(&mut slot, SessionState::Renewing(identity.clone()));

        let task = tokio::spawn(self.clone().run_renewal(refresh_token, identity, generation));
        let abort = task.abort_handle();
        let inner = Arc::downgrade(&self.inner);
        let renewal = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Self::abandoned(inner, e.is_panic()),
            }
        }
        .boxed()
        .shared();

        *ticket = Some(InFlight {
            generation,
            ticket: renewal.clone(),
            task: abort,
        });
        Some(renewal)
    }

    /// Outcome for callers of a renewal task that never finished.
    ///
    /// An aborted task was superseded by a login or a session end, so the
    /// current credential (if any) is the answer. A panicked one ends the
    /// session.
    fn abandoned(inner: Weak<Inner>, panicked: bool) -> Result<Credential, AuthError> {
        let inner = inner.upgrade().ok_or(AuthError::SessionExpired)?;
        let manager = SessionManager { inner };
        if panicked {
            warn!("Renewal task panicked, ending session");
            manager.expire();
            return Err(AuthError::SessionExpired);
        }
        manager.credential().ok_or(AuthError::SessionExpired)
    }

    async fn run_renewal(
        self,
        refresh_token: String,
        identity: Identity,
        generation: u64,
    ) -> Result<Credential, AuthError> {
        info!(generation, "Renewing access token");
        let timeout = self.inner.settings.renewal_timeout;
        let outcome = match tokio::time::timeout(timeout, self.inner.api.refresh(&refresh_token)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Token renewal timed out");
                Err(AuthError::SessionExpired)
            }
        };

        let failure = {
            let mut ticket = lock(&self.inner.ticket);
            if matches!(ticket.as_ref(), Some(in_flight) if in_flight.generation == generation) {
                ticket.take();
            }
            let mut slot = lock(&self.inner.slot);

            if slot.generation != generation {
                debug!("Session changed during renewal, discarding outcome");
                return slot.credential.clone().ok_or(AuthError::SessionExpired);
            }

            match outcome {
                Ok(tokens) => {
                    let refresh_token = tokens.refresh_token.unwrap_or(refresh_token);
                    let credential = Credential::new(tokens.access_token, refresh_token);
                    if let Err(e) = self.inner.store.save(&credential, &identity) {
                        warn!(error = %e, "Failed to persist renewed credential");
                    }
                    slot.credential = Some(credential.clone());
                    slot.generation += 1;
                    // A login attempt in progress owns the state until it settles.
                    if slot.state != SessionState::Authenticating {
                        self.commit(&mut slot, SessionState::Authenticated(identity));
                    }
                    info!(generation = slot.generation, "Access token renewed");
                    return Ok(credential);
                }
                Err(e) => e,
            }
        };

        warn!(error = %failure, "Token renewal failed, ending session");
        self.expire();
        Err(AuthError::SessionExpired)
    }

    // =========================================================================
    // Profile
    // =========================================================================

    /// Merge a profile update into the cached identity and persist it.
    ///
    /// Returns the merged identity, or `None` when no session is live.
    pub fn update_identity(&self, patch: Map<String, Value>) -> Option<Identity> {
        let mut slot = lock(&self.inner.slot);
        let credential = slot.credential.clone()?;
        let mut state = slot.state.clone();
        let identity = state.identity_mut()?;
        identity.merge(patch);
        let updated = identity.clone();

        if let Err(e) = self.inner.store.save(&credential, &updated) {
            warn!(error = %e, "Failed to persist profile update");
        }
        self.commit(&mut slot, state);
        Some(updated)
    }

    // =========================================================================
    // Account flows (anonymous, state-neutral)
    // =========================================================================

    pub async fn register(&self, registration: &Registration) -> Result<String, AuthError> {
        self.inner.api.register(registration).await
    }

    pub async fn forgot_password(&self, email: &str) -> Result<String, AuthError> {
        self.inner.api.forgot_password(email).await
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<String, AuthError> {
        self.inner.api.reset_password(token, new_password).await
    }

    pub async fn verify_email(&self, token: &str) -> Result<String, AuthError> {
        self.inner.api.verify_email(token).await
    }

    pub async fn resend_verification(&self, email: &str) -> Result<String, AuthError> {
        self.inner.api.resend_verification(email).await
    }

    /// Publish a new state. Callers hold the slot lock, so observers only
    /// ever see whole transitions.
    fn commit(&self, slot: &mut Slot, state: SessionState) {
        if slot.state != state {
            debug!(from = slot.state.label(), to = state.label(), "Session transition");
        }
        slot.state = state.clone();
        self.inner.state_tx.send_replace(state);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::TransportError;
    use crate::api::transport::ApiResponse;
    use crate::auth::backend::{MemoryBackend, StorageBackend, StoreError, StoredMap};
    use crate::test_support::{
        identity, login_body, manager_with, seeded_store, MockTransport, RecordingNavigator, Reply,
    };
    use serde_json::json;

    fn refresh_ok(token: &str) -> Reply {
        Reply::json(200, json!({ "access_token": token }))
    }

    #[tokio::test]
    async fn test_cold_start_without_session_is_anonymous() {
        let transport = MockTransport::new(|_| Reply::json(500, json!({})));
        let (manager, _) = manager_with(transport, CredentialStore::new(Box::new(MemoryBackend::new())));
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(manager.grant().is_none());
    }

    #[tokio::test]
    async fn test_cold_start_hydrates_from_store() {
        let transport = MockTransport::new(|_| Reply::json(500, json!({})));
        let (manager, _) = manager_with(transport, seeded_store("access-0", "refresh-0", "dave", false));
        assert_eq!(
            manager.state(),
            SessionState::Authenticated(identity("dave", false))
        );
        assert_eq!(manager.grant().unwrap().access_token, "access-0");
    }

    #[tokio::test]
    async fn test_login_success_persists_and_authenticates() {
        let transport = MockTransport::new(|_| {
            Reply::json(200, login_body("access-1", "refresh-1", "alice", false))
        });
        let (manager, _) = manager_with(transport, CredentialStore::new(Box::new(MemoryBackend::new())));
        let changes = manager.store_changes();

        let identity = manager.login("alice", "pw").await.unwrap();
        assert_eq!(identity.subject, "alice");
        assert!(manager.is_authenticated());
        assert!(!manager.is_admin());
        assert_eq!(manager.credential().unwrap().refresh_token, "refresh-1");
        assert_eq!(*changes.borrow(), 1);
    }

    #[tokio::test]
    async fn test_login_requires_both_fields() {
        let transport = MockTransport::new(|_| Reply::json(200, json!({})));
        let (manager, _) = manager_with(transport.clone(), CredentialStore::new(Box::new(MemoryBackend::new())));
        assert!(matches!(
            manager.login("  ", "pw").await,
            Err(AuthError::InvalidCredentials(_))
        ));
        assert!(matches!(
            manager.login("alice", "").await,
            Err(AuthError::InvalidCredentials(_))
        ));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_login_failure_stores_nothing() {
        let transport = MockTransport::new(|_| {
            Reply::json(401, json!({ "detail": "Incorrect username or password" }))
        });
        let (manager, _) = manager_with(transport, CredentialStore::new(Box::new(MemoryBackend::new())));
        let changes = manager.store_changes();

        let err = manager.login("alice", "bad").await.unwrap_err();
        assert_eq!(
            err,
            AuthError::InvalidCredentials("Incorrect username or password".to_string())
        );
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(manager.credential().is_none());
        assert_eq!(*changes.borrow(), 0);
    }

    #[tokio::test]
    async fn test_login_network_failure() {
        let transport = MockTransport::new(|_| Reply::Now(Err(TransportError::Timeout)));
        let (manager, _) = manager_with(transport, CredentialStore::new(Box::new(MemoryBackend::new())));
        assert!(matches!(
            manager.login("alice", "pw").await,
            Err(AuthError::NetworkError(_))
        ));
        assert_eq!(manager.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_state_observers_see_whole_transitions() {
        let transport = MockTransport::new(|_| {
            Reply::json(200, login_body("access-1", "refresh-1", "alice", true))
        });
        let (manager, _) = manager_with(transport, CredentialStore::new(Box::new(MemoryBackend::new())));
        let mut rx = manager.subscribe();
        assert_eq!(*rx.borrow_and_update(), SessionState::Anonymous);

        manager.login("alice", "pw").await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            *rx.borrow_and_update(),
            SessionState::Authenticated(identity("alice", true))
        );
    }

    #[tokio::test]
    async fn test_logout_is_idempotent_from_every_state() {
        let transport = MockTransport::new(|_| Reply::Hang);
        let (manager, navigator) = manager_with(transport, seeded_store("a", "r", "erin", false));
        let changes = manager.store_changes();

        manager.logout();
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(manager.credential().is_none());
        assert_eq!(*changes.borrow(), 1);

        manager.logout();
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert_eq!(*changes.borrow(), 1);
        // Voluntary logout never redirects
        assert!(navigator.visits().is_empty());
    }

    #[tokio::test]
    async fn test_logout_while_renewing() {
        let transport = MockTransport::new(|_| Reply::Hang);
        let (manager, _) = manager_with(transport, seeded_store("a", "r", "erin", false));

        let ticket = manager.acquire_ticket().unwrap();
        assert!(manager.state().is_renewing());
        assert!(manager.renewal_in_flight());

        manager.logout();
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(!manager.renewal_in_flight());
        // The exchange is stopped and its waiters learn the session is gone
        assert_eq!(ticket.await.unwrap_err(), AuthError::SessionExpired);
    }

    #[tokio::test]
    async fn test_login_supersedes_in_flight_renewal() {
        let transport = MockTransport::new(|request| match request.path.as_str() {
            "/auth/refresh" => Reply::Hang,
            _ => Reply::json(200, login_body("access-9", "refresh-9", "alice", false)),
        });
        let (manager, _) = manager_with(transport, seeded_store("a", "r", "erin", false));

        let ticket = manager.acquire_ticket().unwrap();
        manager.login("alice", "pw").await.unwrap();
        assert!(!manager.renewal_in_flight());
        assert_eq!(ticket.await.unwrap().access_token, "access-9");
        assert_eq!(manager.state(), SessionState::Authenticated(identity("alice", false)));
    }

    #[tokio::test]
    async fn test_renew_success_rotates_access_token_only() {
        let transport = MockTransport::new(|_| refresh_ok("access-2"));
        let (manager, navigator) = manager_with(transport, seeded_store("access-1", "refresh-1", "fay", false));
        let before = manager.generation();

        let credential = manager.renew().await.unwrap();
        assert_eq!(credential.access_token, "access-2");
        assert_eq!(credential.refresh_token, "refresh-1");
        assert_eq!(manager.generation(), before + 1);
        assert_eq!(manager.state(), SessionState::Authenticated(identity("fay", false)));
        assert!(!manager.renewal_in_flight());
        assert!(navigator.visits().is_empty());
    }

    #[tokio::test]
    async fn test_renew_uses_rotated_refresh_token() {
        let transport = MockTransport::new(|_| {
            Reply::json(200, json!({ "access_token": "access-2", "refresh_token": "refresh-2" }))
        });
        let (manager, _) = manager_with(transport, seeded_store("access-1", "refresh-1", "fay", false));
        assert_eq!(manager.renew().await.unwrap().refresh_token, "refresh-2");
    }

    #[tokio::test]
    async fn test_renew_without_refresh_token_expires() {
        let transport = MockTransport::new(|_| refresh_ok("never"));
        let (manager, navigator) =
            manager_with(transport.clone(), CredentialStore::new(Box::new(MemoryBackend::new())));
        assert_eq!(manager.renew().await.unwrap_err(), AuthError::SessionExpired);
        assert!(transport.calls().is_empty());
        // Already anonymous: nothing to end, nowhere to redirect from
        assert!(navigator.visits().is_empty());
    }

    #[tokio::test]
    async fn test_renew_rejected_clears_session_and_redirects_once() {
        let transport = MockTransport::new(|_| Reply::json(401, json!({ "detail": "expired" })));
        let (manager, navigator) = manager_with(transport, seeded_store("a", "r", "gus", false));

        assert_eq!(manager.renew().await.unwrap_err(), AuthError::SessionExpired);
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert_eq!(navigator.visits(), vec![DEFAULT_LOGIN_PATH.to_string()]);

        // A second attempt finds nothing to renew and does not redirect again
        assert_eq!(manager.renew().await.unwrap_err(), AuthError::SessionExpired);
        assert_eq!(navigator.visits().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_renew_calls_share_one_exchange() {
        let transport = MockTransport::new(|_| {
            Reply::After(Duration::from_millis(50), Ok(ApiResponse::json_body(
                200,
                &json!({ "access_token": "access-2" }),
            )))
        });
        let (manager, _) = manager_with(transport.clone(), seeded_store("a", "r", "hal", false));

        let (first, second, third) = tokio::join!(manager.renew(), manager.renew(), manager.renew());
        assert_eq!(first.unwrap().access_token, "access-2");
        assert_eq!(second.unwrap().access_token, "access-2");
        assert_eq!(third.unwrap().access_token, "access-2");
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_renewal_times_out() {
        let transport = MockTransport::new(|_| Reply::Hang);
        let (manager, navigator) = manager_with(transport, seeded_store("a", "r", "ivy", false));

        assert_eq!(manager.renew().await.unwrap_err(), AuthError::SessionExpired);
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(!manager.renewal_in_flight());
        assert_eq!(navigator.visits().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_renewal_still_times_out() {
        let transport = MockTransport::new(|_| Reply::Hang);
        let (manager, navigator) = manager_with(transport, seeded_store("a", "r", "ivy", false));

        // The only caller gives up almost immediately
        let gave_up = tokio::time::timeout(Duration::from_millis(1), manager.renew()).await;
        assert!(gave_up.is_err());
        assert!(manager.renewal_in_flight());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(!manager.renewal_in_flight());
        assert_eq!(navigator.visits().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_during_failed_login_keeps_identity() {
        let transport = MockTransport::new(|request| match request.path.as_str() {
            "/auth/refresh" => Reply::After(
                Duration::from_millis(20),
                Ok(ApiResponse::json_body(200, &json!({ "access_token": "access-2" }))),
            ),
            _ => Reply::After(
                Duration::from_millis(40),
                Ok(ApiResponse::json_body(
                    401,
                    &json!({ "detail": "Incorrect username or password" }),
                )),
            ),
        });
        let (manager, navigator) =
            manager_with(transport, seeded_store("access-1", "refresh-1", "root", true));

        let (renewed, login) = tokio::join!(manager.renew(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            manager.login("someone", "wrong").await
        });

        assert_eq!(renewed.unwrap().access_token, "access-2");
        assert!(matches!(login, Err(AuthError::InvalidCredentials(_))));
        assert_eq!(manager.state(), SessionState::Authenticated(identity("root", true)));
        assert_eq!(manager.inner.store.current_identity(), Some(identity("root", true)));
        assert_eq!(manager.grant().unwrap().access_token, "access-2");
        assert!(navigator.visits().is_empty());
    }

    #[tokio::test]
    async fn test_renew_from_skips_exchange_when_already_renewed() {
        let transport = MockTransport::new(|_| refresh_ok("access-2"));
        let (manager, _) = manager_with(transport.clone(), seeded_store("a", "r", "jo", false));
        let stale = manager.generation();

        manager.renew().await.unwrap();
        let credential = manager.renew_from(stale).await.unwrap();
        assert_eq!(credential.access_token, "access-2");
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_update_identity_merges_and_persists() {
        let transport = MockTransport::new(|_| Reply::Hang);
        let (manager, _) = manager_with(transport, seeded_store("a", "r", "kim", false));

        let mut patch = Map::new();
        patch.insert("nickname".into(), json!("k"));
        let updated = manager.update_identity(patch).unwrap();
        assert_eq!(updated.attribute_str("nickname"), Some("k"));
        assert_eq!(manager.identity(), Some(updated));
        assert!(manager.state().is_authenticated());
    }

    #[tokio::test]
    async fn test_update_identity_when_anonymous_is_noop() {
        let transport = MockTransport::new(|_| Reply::Hang);
        let (manager, _) = manager_with(transport, CredentialStore::new(Box::new(MemoryBackend::new())));
        assert!(manager.update_identity(Map::new()).is_none());
    }

    struct BrokenBackend;

    impl StorageBackend for BrokenBackend {
        fn read(&self) -> Result<StoredMap, StoreError> {
            Err(StoreError::Unavailable("locked".into()))
        }

        fn write(&self, _entries: &StoredMap) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("locked".into()))
        }
    }

    #[tokio::test]
    async fn test_unavailable_storage_degrades_to_memory_session() {
        let transport = MockTransport::new(|_| {
            Reply::json(200, login_body("access-1", "refresh-1", "lee", false))
        });
        let (manager, _) = manager_with(transport, CredentialStore::new(Box::new(BrokenBackend)));
        assert_eq!(manager.state(), SessionState::Anonymous);

        manager.login("lee", "pw").await.unwrap();
        assert!(manager.is_authenticated());

        manager.logout();
        assert_eq!(manager.state(), SessionState::Anonymous);
    }
}
