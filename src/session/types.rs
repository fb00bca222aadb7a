//! Application session created from a validated assertion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::protocol::{AssertionResult, NameId};

/// Unique session identifier (16-byte random value, hex-encoded for storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Convert to hex string for storage/cookies.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A logged-in user agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    /// Subject NameID value.
    pub name_id: String,

    /// NameID format (e.g., emailAddress, persistent).
    pub name_id_format: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Never later than the IdP's `SessionNotOnOrAfter`.
    pub expires_at: DateTime<Utc>,

    /// Last access time (updated on each request).
    pub last_accessed: DateTime<Utc>,

    /// Assertion attributes as key → values.
    pub attributes: HashMap<String, Vec<String>>,

    pub assertion_id: String,

    /// IdP entity ID that issued this session.
    pub idp_entity_id: String,

    /// IdP session index, sent back on logout.
    pub session_index: Option<String>,

    /// Client IP at session creation (optional binding).
    pub client_ip: Option<String>,
}

impl Session {
    /// Start a session for a validated assertion.
    pub fn from_assertion(assertion: &AssertionResult, ttl_secs: u64, now: DateTime<Utc>) -> Self {
        let mut expires_at = i64::try_from(ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Some(idp_limit) = assertion.session_not_on_or_after {
            expires_at = expires_at.min(idp_limit);
        }
        Self {
            id: SessionId::new(),
            name_id: assertion.name_id.value.clone(),
            name_id_format: assertion.name_id.format.clone(),
            created_at: now,
            expires_at,
            last_accessed: now,
            attributes: assertion.attributes.clone(),
            assertion_id: assertion.assertion_id.clone(),
            idp_entity_id: assertion.issuer.clone(),
            session_index: assertion.session_index.clone(),
            client_ip: None,
        }
    }

    /// The subject as the IdP named it, for a LogoutRequest.
    pub fn subject(&self) -> NameId {
        NameId {
            value: self.name_id.clone(),
            format: self.name_id_format.clone(),
            name_qualifier: None,
            sp_name_qualifier: None,
        }
    }

    /// Check if the session is expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Update last accessed time.
    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    /// Get a single-valued attribute.
    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(|s| s.as_str())
    }

    /// True if this session matches an IdP logout for `name_id`, restricted
    /// to `session_indexes` when any are given.
    pub fn matches_logout(&self, name_id: &str, session_indexes: &[String]) -> bool {
        if self.name_id != name_id {
            return false;
        }
        if session_indexes.is_empty() {
            return true;
        }
        self.session_index
            .as_ref()
            .is_some_and(|index| session_indexes.contains(index))
    }
}

#[cfg(test)]
pub(crate) fn test_session(name_id: &str, session_index: Option<&str>) -> Session {
    let assertion = AssertionResult {
        name_id: NameId::new(name_id),
        session_index: session_index.map(str::to_string),
        attributes: HashMap::from([("mail".to_string(), vec![name_id.to_string()])]),
        not_before: None,
        not_on_or_after: None,
        session_not_on_or_after: None,
        issuer: "https://idp.example.com/metadata".to_string(),
        assertion_id: crate::crypto::generate_id(),
        in_response_to: None,
    };
    Session::from_assertion(&assertion, 3600, Utc::now())
}
