//! In-memory stores for request correlation and assertion replay.
//!
//! Both are plain `Mutex<HashMap>`s: every check-and-update happens under a
//! single lock acquisition, so two concurrent responses can never both see
//! the same entry as fresh.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{SamlError, SamlResult};

/// What an outstanding request was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Authn,
    Logout,
}

/// An outstanding request awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outstanding request IDs with TTL and one-time consumption.
#[derive(Debug, Default)]
pub struct PendingRequestStore {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request ID.
    ///
    /// Fails if `now + ttl` is not representable; nothing is registered then.
    pub fn insert(
        &self,
        id: String,
        kind: RequestKind,
        now: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> SamlResult<()> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| SamlError::Internal(format!("request TTL of {}s is out of range", ttl.as_secs())))?;
        let entry = PendingRequest {
            kind,
            created_at: now,
            expires_at,
        };
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SamlError::Internal("pending request store lock poisoned".to_string()))?;
        entries.insert(id, entry);
        Ok(())
    }

    /// Atomically check and remove `id`.
    ///
    /// Returns the entry only if it exists, has the expected kind and has
    /// not expired. Expired entries are removed and treated as unknown.
    pub fn consume(&self, id: &str, kind: RequestKind, now: DateTime<Utc>) -> Option<PendingRequest> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(id) {
            Some(entry) if entry.kind != kind => {
                debug!(request_id = %id, expected = ?kind, actual = ?entry.kind, "Pending request kind mismatch");
                None
            }
            Some(entry) if entry.is_expired(now) => {
                entries.remove(id);
                debug!(request_id = %id, "Pending request expired");
                None
            }
            Some(_) => entries.remove(id),
            None => None,
        }
    }

    /// True if `id` is pending and unexpired. Does not consume.
    pub fn contains(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.get(id).is_some_and(|e| !e.is_expired(now)))
            .unwrap_or(false)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        match self.entries.lock() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, entry| !entry.is_expired(now));
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accepted assertion IDs, kept until the assertion itself expires.
#[derive(Debug, Default)]
pub struct AssertionReplayCache {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AssertionReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted assertion ID until `keep_until`.
    ///
    /// Returns false if the ID was already recorded and is still live, which
    /// means the assertion is being replayed.
    pub fn record(&self, assertion_id: &str, keep_until: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let Ok(mut seen) = self.seen.lock() else {
            warn!("Assertion replay cache lock poisoned, rejecting assertion");
            return false;
        };
        match seen.get(assertion_id) {
            Some(until) if *until > now => false,
            _ => {
                seen.insert(assertion_id.to_string(), keep_until);
                true
            }
        }
    }

    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        match self.seen.lock() {
            Ok(mut seen) => {
                let before = seen.len();
                seen.retain(|_, until| *until > now);
                before - seen.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn test_consume_is_one_time() {
        let store = PendingRequestStore::new();
        let now = Utc::now();
        store.insert("_abc".to_string(), RequestKind::Authn, now, TTL).unwrap();

        assert!(store.contains("_abc", now));
        let entry = store.consume("_abc", RequestKind::Authn, now).unwrap();
        assert_eq!(entry.expires_at, now + chrono::Duration::seconds(300));
        assert!(store.consume("_abc", RequestKind::Authn, now).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_out_of_range_ttl_is_rejected() {
        let store = PendingRequestStore::new();
        let now = Utc::now();
        let err = store
            .insert("_far".to_string(), RequestKind::Authn, now, Duration::from_secs(10_000_000_000_000))
            .unwrap_err();
        assert!(matches!(err, SamlError::Internal(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_expired_entry_is_unknown() {
        let store = PendingRequestStore::new();
        let now = Utc::now();
        store.insert("_old".to_string(), RequestKind::Authn, now, TTL).unwrap();

        let later = now + chrono::Duration::seconds(300);
        assert!(!store.contains("_old", later));
        assert!(store.consume("_old", RequestKind::Authn, later).is_none());
        // Removed on lookup.
        assert!(store.is_empty());
    }

    #[test]
    fn test_kind_must_match() {
        let store = PendingRequestStore::new();
        let now = Utc::now();
        store.insert("_logout".to_string(), RequestKind::Logout, now, TTL).unwrap();

        assert!(store.consume("_logout", RequestKind::Authn, now).is_none());
        assert!(store.consume("_logout", RequestKind::Logout, now).is_some());
    }

    #[test]
    fn test_evict_expired() {
        let store = PendingRequestStore::new();
        let now = Utc::now();
        store.insert("_a".to_string(), RequestKind::Authn, now, Duration::from_secs(1)).unwrap();
        store.insert("_b".to_string(), RequestKind::Authn, now, TTL).unwrap();

        assert_eq!(store.evict_expired(now + chrono::Duration::seconds(2)), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_consume_succeeds_once() {
        let store = Arc::new(PendingRequestStore::new());
        let now = Utc::now();
        store.insert("_race".to_string(), RequestKind::Authn, now, TTL).unwrap();

        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if store.consume("_race", RequestKind::Authn, now).is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replay_cache() {
        let cache = AssertionReplayCache::new();
        let now = Utc::now();
        let until = now + chrono::Duration::minutes(5);

        assert!(cache.record("_assertion", until, now));
        assert!(!cache.record("_assertion", until, now));

        // Once the assertion has expired the record may go.
        let later = until + chrono::Duration::seconds(1);
        assert_eq!(cache.evict_expired(later), 1);
        assert!(cache.is_empty());
    }
}
