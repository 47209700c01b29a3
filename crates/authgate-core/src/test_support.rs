//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};

use crate::api::{ApiRequest, ApiResponse, Transport, TransportError};
use crate::auth::backend::StoredMap;
use crate::auth::credentials::{ISSUED_AT_KEY, REFRESH_TOKEN_KEY, TOKEN_KEY, USER_KEY};
use crate::auth::{Credential, CredentialStore, Identity, MemoryBackend, SessionManager, SessionSettings};
use crate::routes::Navigator;

/// Scripted outcome for one request.
pub enum Reply {
    Now(Result<ApiResponse, TransportError>),
    After(Duration, Result<ApiResponse, TransportError>),
    /// Never resolves
    Hang,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Reply::Now(Ok(ApiResponse::json_body(status, &body)))
    }
}

type Responder = dyn Fn(&ApiRequest) -> Reply + Send + Sync;

/// Transport answering from a closure and recording every request in send order.
pub struct MockTransport {
    responder: Box<Responder>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new(responder: impl Fn(&ApiRequest) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, path: &str) -> usize {
        self.calls().iter().filter(|r| r.path == path).count()
    }

    /// Paths sent with the given bearer token, in send order.
    pub fn paths_with_bearer(&self, token: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|r| r.bearer.as_deref() == Some(token))
            .map(|r| r.path)
            .collect()
    }
}

impl Transport for MockTransport {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, TransportError>> {
        let reply = (self.responder)(&request);
        self.calls.lock().unwrap().push(request);
        match reply {
            Reply::Now(outcome) => futures::future::ready(outcome).boxed(),
            Reply::After(delay, outcome) => async move {
                tokio::time::sleep(delay).await;
                outcome
            }
            .boxed(),
            Reply::Hang => futures::future::pending().boxed(),
        }
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    visits: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, path: &str) {
        self.visits.lock().unwrap().push(path.to_string());
    }
}

fn user_payload(subject: &str, admin: bool) -> Map<String, Value> {
    match json!({ "username": subject, "is_admin": admin }) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Identity as the server's login response would produce it.
pub fn identity(subject: &str, admin: bool) -> Identity {
    Identity::from_user_payload(user_payload(subject, admin))
}

pub fn login_body(access: &str, refresh: &str, subject: &str, admin: bool) -> Value {
    json!({
        "access_token": access,
        "refresh_token": refresh,
        "user": Value::Object(user_payload(subject, admin)),
    })
}

/// In-memory store holding a session from a previous run.
///
/// Written straight into the backend, so the store's revision starts at 0.
pub fn seeded_store(access: &str, refresh: &str, subject: &str, admin: bool) -> CredentialStore {
    let credential = Credential::new(access.to_string(), refresh.to_string());
    let mut entries = StoredMap::new();
    entries.insert(TOKEN_KEY.to_string(), credential.access_token.clone());
    entries.insert(REFRESH_TOKEN_KEY.to_string(), credential.refresh_token.clone());
    entries.insert(
        USER_KEY.to_string(),
        serde_json::to_string(&identity(subject, admin)).unwrap(),
    );
    entries.insert(ISSUED_AT_KEY.to_string(), credential.issued_at.to_rfc3339());
    CredentialStore::new(Box::new(MemoryBackend::with_entries(entries)))
}

pub fn manager_with(
    transport: Arc<MockTransport>,
    store: CredentialStore,
) -> (SessionManager, Arc<RecordingNavigator>) {
    let navigator = Arc::new(RecordingNavigator::default());
    let manager = SessionManager::new(transport, store, navigator.clone(), SessionSettings::default());
    (manager, navigator)
}
