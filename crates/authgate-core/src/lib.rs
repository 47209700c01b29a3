//! Session and credential lifecycle for clients of a token-authenticated
//! REST service.
//!
//! - `auth`: credential storage and the session state machine
//! - `api`: transport, auth endpoints and the request gate
//! - `routes`: route requirements and the navigation guard
//! - `config`: persisted settings

pub mod api;
pub mod auth;
pub mod config;
pub mod routes;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiError, ApiRequest, ApiResponse, AuthError, RequestGate, ReqwestTransport, Transport};
pub use auth::{Credential, CredentialStore, Identity, SessionManager, SessionSettings, SessionState};
pub use config::{Config, StorageKind};
pub use routes::{Decision, LandingPages, LogNavigator, NavigationGuard, Navigator, RouteTable};
