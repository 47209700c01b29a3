use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys in the server `user` object that can name the subject, in priority order.
const SUBJECT_KEYS: [&str; 3] = ["username", "email", "id"];

/// Access/refresh token pair for the live session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(access_token: String, refresh_token: String) -> Self {
        Self {
            access_token,
            refresh_token,
            issued_at: Utc::now(),
        }
    }

    /// Minutes since the access token was issued (for display)
    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.issued_at).num_minutes().max(0)
    }
}

// Tokens are never written to logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Profile and role flags of the authenticated subject.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Identity {
    pub subject: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    #[cfg_attr(feature = "ts", ts(type = "Record<string, unknown>"))]
    pub attributes: Map<String, Value>,
}

impl Identity {
    /// Build an identity from the `user` object of a login response.
    ///
    /// The subject is the first of `username`, `email` or `id` present.
    /// Everything except `is_admin` is kept in `attributes`.
    pub fn from_user_payload(user: Map<String, Value>) -> Self {
        let subject = SUBJECT_KEYS
            .iter()
            .find_map(|key| match user.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_default();

        let mut attributes = user;
        let is_admin = attributes
            .remove("is_admin")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Self {
            subject,
            is_admin,
            attributes,
        }
    }

    /// Merge a partial profile update into this identity.
    ///
    /// `subject` and `is_admin` update the typed fields, anything else lands
    /// in `attributes` (overwriting existing keys).
    pub fn merge(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            match (key.as_str(), &value) {
                ("subject", Value::String(s)) => self.subject = s.clone(),
                ("is_admin", Value::Bool(b)) => self.is_admin = *b,
                _ => {
                    self.attributes.insert(key, value);
                }
            }
        }
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// The session state machine value.
///
/// Exactly one of these is active at a time. Authorization booleans are
/// projections of it, never stored separately.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "state", content = "identity", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionState {
    #[default]
    Anonymous,
    Authenticating,
    Authenticated(Identity),
    Renewing(Identity),
}

impl SessionState {
    /// True when a credential is live (including while it is being renewed)
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_) | Self::Renewing(_))
    }

    pub fn is_admin(&self) -> bool {
        self.identity().map(|i| i.is_admin).unwrap_or(false)
    }

    pub fn is_renewing(&self) -> bool {
        matches!(self, Self::Renewing(_))
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated(identity) | Self::Renewing(identity) => Some(identity),
            Self::Anonymous | Self::Authenticating => None,
        }
    }

    pub fn identity_mut(&mut self) -> Option<&mut Identity> {
        match self {
            Self::Authenticated(identity) | Self::Renewing(identity) => Some(identity),
            Self::Anonymous | Self::Authenticating => None,
        }
    }

    /// Short label for logs and status output
    pub fn label(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Authenticating => "authenticating",
            Self::Authenticated(_) => "authenticated",
            Self::Renewing(_) => "renewing",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity() {
            Some(identity) => write!(f, "{} as {}", self.label(), identity.subject),
            None => f.write_str(self.label()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
