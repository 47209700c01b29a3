use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::backend::{StorageBackend, StoreError, StoredMap};
use super::session::{Credential, Identity};

/// Stable storage keys. Only these are touched by save/clear.
pub const TOKEN_KEY: &str = "token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USER_KEY: &str = "user";
pub const ISSUED_AT_KEY: &str = "token_issued_at";

const OWNED_KEYS: [&str; 4] = [TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY, ISSUED_AT_KEY];

/// Durable holder of the current credential pair and identity snapshot.
///
/// Holds no session logic. The `SessionManager` is its only writer.
pub struct CredentialStore {
    backend: Box<dyn StorageBackend>,
    revision: watch::Sender<u64>,
}

impl CredentialStore {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        let (revision, _) = watch::channel(0);
        Self { backend, revision }
    }

    /// Load the persisted session.
    ///
    /// Missing keys, an unreadable backend or unparsable content all read
    /// as no session.
    pub fn load(&self) -> Option<(Credential, Identity)> {
        let entries = match self.backend.read() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Credential storage unreadable, starting anonymous");
                return None;
            }
        };

        let access_token = entries.get(TOKEN_KEY)?.clone();
        let refresh_token = entries.get(REFRESH_TOKEN_KEY)?.clone();
        let identity = Self::parse_identity(entries.get(USER_KEY)?)?;
        let issued_at = entries
            .get(ISSUED_AT_KEY)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        debug!(subject = %identity.subject, "Stored session loaded");
        Some((
            Credential {
                access_token,
                refresh_token,
                issued_at,
            },
            identity,
        ))
    }

    /// Persist credential and identity in a single backend write.
    pub fn save(&self, credential: &Credential, identity: &Identity) -> Result<(), StoreError> {
        let user = serde_json::to_string(identity).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut entries = self.read_for_update();
        entries.insert(TOKEN_KEY.to_string(), credential.access_token.clone());
        entries.insert(REFRESH_TOKEN_KEY.to_string(), credential.refresh_token.clone());
        entries.insert(USER_KEY.to_string(), user);
        entries.insert(ISSUED_AT_KEY.to_string(), credential.issued_at.to_rfc3339());
        self.backend.write(&entries)?;
        self.bump();
        Ok(())
    }

    /// Remove the session keys, leaving unrelated keys in place.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut entries = self.read_for_update();
        let had_session = OWNED_KEYS.iter().any(|k| entries.contains_key(*k));
        for key in OWNED_KEYS {
            entries.remove(key);
        }
        if had_session {
            self.backend.write(&entries)?;
            self.bump();
        }
        Ok(())
    }

    pub fn current_identity(&self) -> Option<Identity> {
        let entries = self.backend.read().ok()?;
        Self::parse_identity(entries.get(USER_KEY)?)
    }

    /// Receiver that ticks after every successful save or clear.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn parse_identity(raw: &str) -> Option<Identity> {
        match serde_json::from_str(raw) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!(error = %e, "Stored user is not a valid identity");
                None
            }
        }
    }

    // A corrupt map is replaced rather than blocking writes forever.
    fn read_for_update(&self) -> StoredMap {
        match self.backend.read() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable credential storage");
                StoredMap::new()
            }
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}
