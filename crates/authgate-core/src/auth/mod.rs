//! Authentication module for managing sessions and credentials.
//!
//! This module provides:
//! - `SessionManager`: login, logout and exactly-once credential renewal
//! - `CredentialStore`: durable holder of the token pair and identity
//! - Storage backends: in-memory, JSON file and OS keychain
//!
//! The session state machine is `Anonymous`, `Authenticating`,
//! `Authenticated` and `Renewing`; see `SessionState`.

pub mod backend;
pub mod credentials;
pub mod manager;
pub mod session;

pub use backend::{FileBackend, KeyringBackend, MemoryBackend, StorageBackend, StoreError};
pub use credentials::CredentialStore;
pub use manager::{Grant, SessionManager, SessionSettings};
pub use session::{Credential, Identity, SessionState};
