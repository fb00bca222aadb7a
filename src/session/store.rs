//! Session store backed by redb embedded database.
//!
//! Sessions are written through to disk as MessagePack and mirrored in an
//! in-memory cache. Assertion replay is handled before a session is created,
//! so this store only deals with established sessions.

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, warn};

use super::types::{Session, SessionId};

/// Sessions keyed by hex session ID, stored as MessagePack.
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sp_sessions");

const MAX_CACHE_SIZE: usize = 10_000;

pub struct SessionStore {
    db: Database,
    cache: RwLock<HashMap<SessionId, Session>>,
    default_ttl_secs: u64,
}

impl SessionStore {
    /// Open or create a session store at the given path.
    pub fn open(path: impl AsRef<Path>, default_ttl_secs: u64) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(path)
            .with_context(|| format!("Failed to open session database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
        }
        write_txn.commit()?;

        let cache = Self::load_active_sessions(&db)?;
        debug!(sessions = cache.len(), "Loaded active sessions into cache");

        Ok(Self {
            db,
            cache: RwLock::new(cache),
            default_ttl_secs,
        })
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    /// Store a new session.
    pub fn create(&self, session: Session) -> Result<SessionId> {
        let id = session.id;
        self.persist(&session)?;

        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= MAX_CACHE_SIZE {
                evict_cache_lru(&mut cache);
            }
            cache.insert(id, session);
        }

        debug!(session = %id, "Session created");
        Ok(id)
    }

    /// Get a live session by ID, updating its last access time.
    pub fn get(&self, id: SessionId) -> Result<Option<Session>> {
        if let Ok(mut cache) = self.cache.write() {
            if let Some(session) = cache.get_mut(&id) {
                if session.is_expired() {
                    cache.remove(&id);
                    return Ok(None);
                }
                session.touch();
                let session = session.clone();
                drop(cache);
                if let Err(e) = self.persist(&session) {
                    warn!(error = %e, "Failed to persist session access time");
                }
                return Ok(Some(session));
            }
        }

        let stored = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;
            let key = id.to_hex();
            let session = match table.get(key.as_str())? {
                Some(bytes) => Some(
                    rmp_serde::from_slice::<Session>(bytes.value())
                        .context("Failed to deserialize session")?,
                ),
                None => None,
            };
            session
        };

        let Some(mut session) = stored else {
            return Ok(None);
        };
        if session.is_expired() {
            return Ok(None);
        }

        session.touch();
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(id, session.clone());
        }
        if let Err(e) = self.persist(&session) {
            warn!(error = %e, "Failed to persist session access time");
        }

        Ok(Some(session))
    }

    /// Delete a session by ID.
    pub fn delete(&self, id: SessionId) -> Result<bool> {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&id);
        }

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            let key = id.to_hex();
            let result = table.remove(key.as_str())?;
            result.is_some()
        };
        write_txn.commit()?;

        Ok(removed)
    }

    /// Delete the sessions an IdP-initiated logout names.
    ///
    /// With no session indexes, every session of `name_id` goes.
    pub fn delete_by_name_id(&self, name_id: &str, session_indexes: &[String]) -> Result<usize> {
        let matching: Vec<SessionId> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let session: Session = rmp_serde::from_slice(value.value())?;
                if session.matches_logout(name_id, session_indexes) {
                    ids.push(session.id);
                }
            }
            ids
        };

        let mut deleted = 0;
        for id in matching {
            if self.delete(id)? {
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    /// Evict all expired sessions. Returns the number removed from disk.
    pub fn evict_expired(&self) -> Result<usize> {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, session| !session.is_expired());
        }

        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SESSIONS_TABLE)?;

            let mut ids = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<Session>(value.value()) {
                    Ok(session) if session.is_expired() => {
                        ids.push(key.value().to_string());
                    }
                    Err(e) => {
                        warn!(key = key.value(), error = %e, "Failed to deserialize session, marking for deletion");
                        ids.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            ids
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        let mut evicted = 0;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            for key in &expired {
                if table.remove(key.as_str())?.is_some() {
                    evicted += 1;
                }
            }
        }
        write_txn.commit()?;

        Ok(evicted)
    }

    pub fn session_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let data = rmp_serde::to_vec(session).context("Failed to serialize session")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.insert(session.id.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_active_sessions(db: &Database) -> Result<HashMap<SessionId, Session>> {
        let mut sessions = HashMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        for entry in table.iter()? {
            let (_, value) = entry?;
            if let Ok(session) = rmp_serde::from_slice::<Session>(value.value()) {
                if !session.is_expired() {
                    sessions.insert(session.id, session);
                }
            }
        }

        Ok(sessions)
    }
}

/// Drop the least recently accessed session from the cache.
fn evict_cache_lru(cache: &mut HashMap<SessionId, Session>) {
    if let Some(oldest_id) = cache
        .iter()
        .min_by_key(|(_, s)| s.last_accessed)
        .map(|(id, _)| *id)
    {
        cache.remove(&oldest_id);
    }
}
