use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::auth::token::{jwt_expiry, TokenPair};
use crate::error::{AuthError, AuthResult};

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "benchdash.access_token";
/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "benchdash.refresh_token";

/// Persistent key/value store for opaque strings
pub trait Storage: Send + Sync {
    /// Missing or unreadable values come back as None
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> AuthResult<()>;
    fn remove(&self, key: &str) -> AuthResult<()>;
}

/// Volatile storage, used in tests and when no file is configured
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> AuthResult<()> {
        let mut values = self.values.lock().map_err(|e| AuthError::Storage {
            reason: e.to_string(),
        })?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> AuthResult<()> {
        let mut values = self.values.lock().map_err(|e| AuthError::Storage {
            reason: e.to_string(),
        })?;
        values.remove(key);
        Ok(())
    }
}

/// JSON-object file storage. The whole object is rewritten on every change.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl FileStorage {
    /// Open (or lazily create) the store at `path`. A corrupt file is
    /// treated as empty.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(map) => {
                    debug!(path = %path.display(), entries = map.len(), "Loaded token storage");
                    map
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Token storage is corrupt, starting empty");
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };

        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &Map<String, Value>) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| AuthError::Storage {
                    reason: format!("Failed to create {}: {}", parent.display(), e),
                })?;
            }
        }

        let contents = serde_json::to_string_pretty(values).map_err(|e| AuthError::Storage {
            reason: e.to_string(),
        })?;
        fs::write(&self.path, contents).map_err(|e| AuthError::Storage {
            reason: format!("Failed to write {}: {}", self.path.display(), e),
        })
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().ok()?;
        values.get(key)?.as_str().map(str::to_string)
    }

    fn set(&self, key: &str, value: &str) -> AuthResult<()> {
        let mut values = self.values.lock().map_err(|e| AuthError::Storage {
            reason: e.to_string(),
        })?;
        values.insert(key.to_string(), Value::String(value.to_string()));
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> AuthResult<()> {
        let mut values = self.values.lock().map_err(|e| AuthError::Storage {
            reason: e.to_string(),
        })?;
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// Default `Authorization` header shared with the HTTP transport.
///
/// Only the token store writes it.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationHeader {
    value: Arc<RwLock<Option<String>>>,
}

impl AuthorizationHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current header value, e.g. `Bearer abc`
    pub fn value(&self) -> Option<String> {
        self.value.read().ok()?.clone()
    }

    fn set_bearer(&self, access_token: &str) {
        let mut value = self.value.write().unwrap_or_else(|e| e.into_inner());
        *value = Some(format!("Bearer {}", access_token));
    }

    fn clear(&self) {
        let mut value = self.value.write().unwrap_or_else(|e| e.into_inner());
        *value = None;
    }
}

#[derive(Debug, Default)]
struct StoreState {
    pair: Option<TokenPair>,
    generation: u64,
}

/// Owner of the session's token pair.
///
/// Writes replace both tokens, the transport header and the generation
/// counter under one lock, so readers never see a half-updated pair.
pub struct TokenStore {
    storage: Arc<dyn Storage>,
    header: AuthorizationHeader,
    state: RwLock<StoreState>,
}

impl TokenStore {
    /// Build the store and restore any persisted pair
    pub fn load(storage: Arc<dyn Storage>, header: AuthorizationHeader) -> Self {
        let pair = match (storage.get(ACCESS_TOKEN_KEY), storage.get(REFRESH_TOKEN_KEY)) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                // Only the two strings are persisted; recover expiry from the JWT or
                // assume it already lapsed so the first validation refreshes it
                let expires_at = jwt_expiry(&access).unwrap_or_else(|| {
                    debug!("Stored access token has no readable expiry, treating as expired");
                    DateTime::<Utc>::from_timestamp(0, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
                });
                info!(expires_at = %expires_at, "Restored token pair from storage");
                Some(TokenPair::new(access, refresh, expires_at))
            }
            _ => None,
        };

        if let Some(pair) = &pair {
            header.set_bearer(pair.access_token());
        } else {
            header.clear();
        }

        Self {
            storage,
            header,
            state: RwLock::new(StoreState { pair, generation: 0 }),
        }
    }

    pub fn get(&self) -> Option<TokenPair> {
        self.read_state().pair.clone()
    }

    /// Pair plus the generation it was read at
    pub fn snapshot(&self) -> (Option<TokenPair>, u64) {
        let state = self.read_state();
        (state.pair.clone(), state.generation)
    }

    /// Bumped on every `set`/`clear`
    pub fn generation(&self) -> u64 {
        self.read_state().generation
    }

    pub fn has_tokens(&self) -> bool {
        self.read_state().pair.is_some()
    }

    pub fn set(&self, pair: TokenPair) {
        let mut state = self.write_state();
        self.persist(&pair);
        self.header.set_bearer(pair.access_token());
        state.pair = Some(pair);
        state.generation += 1;
        debug!(generation = state.generation, "Token pair stored");
    }

    /// Store `pair` only if nobody wrote since `generation` was observed
    pub fn set_if_generation(&self, pair: TokenPair, generation: u64) -> bool {
        let mut state = self.write_state();
        if state.generation != generation {
            return false;
        }
        self.persist(&pair);
        self.header.set_bearer(pair.access_token());
        state.pair = Some(pair);
        state.generation += 1;
        true
    }

    pub fn clear(&self) {
        let mut state = self.write_state();
        self.erase();
        self.header.clear();
        state.pair = None;
        state.generation += 1;
        debug!(generation = state.generation, "Token pair cleared");
    }

    /// Clear only if nobody wrote since `generation` was observed
    pub fn clear_if_generation(&self, generation: u64) -> bool {
        let mut state = self.write_state();
        if state.generation != generation {
            return false;
        }
        self.erase();
        self.header.clear();
        state.pair = None;
        state.generation += 1;
        true
    }

    pub fn authorization_header(&self) -> &AuthorizationHeader {
        &self.header
    }

    fn persist(&self, pair: &TokenPair) {
        let result = self
            .storage
            .set(ACCESS_TOKEN_KEY, pair.access_token())
            .and_then(|_| self.storage.set(REFRESH_TOKEN_KEY, pair.refresh_token()));
        if let Err(e) = result {
            error!(error = %e, "Failed to persist tokens, keeping them in memory only");
        }
    }

    fn erase(&self) {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
            if let Err(e) = self.storage.remove(key) {
                error!(key, error = %e, "Failed to remove persisted token");
            }
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pair() -> TokenPair {
        TokenPair::new("access-1", "refresh-1", Utc::now() + Duration::hours(1))
    }

    #[test]
    fn test_round_trip() {
        let storage = Arc::new(MemoryStorage::new());
        let store = TokenStore::load(storage.clone(), AuthorizationHeader::new());

        let pair = pair();
        store.set(pair.clone());
        assert_eq!(store.get(), Some(pair));
        assert_eq!(storage.get(ACCESS_TOKEN_KEY).as_deref(), Some("access-1"));
        assert_eq!(storage.get(REFRESH_TOKEN_KEY).as_deref(), Some("refresh-1"));

        store.clear();
        assert_eq!(store.get(), None);
        assert_eq!(storage.get(ACCESS_TOKEN_KEY), None);
    }

    #[test]
    fn test_header_follows_store() {
        let header = AuthorizationHeader::new();
        let store = TokenStore::load(Arc::new(MemoryStorage::new()), header.clone());
        assert_eq!(header.value(), None);

        store.set(pair());
        assert_eq!(header.value().as_deref(), Some("Bearer access-1"));

        store.clear();
        assert_eq!(header.value(), None);
    }

    #[test]
    fn test_generation_guards_clear() {
        let store = TokenStore::load(Arc::new(MemoryStorage::new()), AuthorizationHeader::new());
        store.set(pair());
        let observed = store.generation();

        store.set(TokenPair::new("access-2", "refresh-2", Utc::now()));
        assert!(!store.clear_if_generation(observed));
        assert!(store.has_tokens());

        assert!(store.clear_if_generation(store.generation()));
        assert!(!store.has_tokens());
    }

    #[test]
    fn test_restore_without_readable_expiry_is_expired() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(ACCESS_TOKEN_KEY, "opaque").unwrap();
        storage.set(REFRESH_TOKEN_KEY, "refresh").unwrap();

        let header = AuthorizationHeader::new();
        let store = TokenStore::load(storage, header.clone());
        let restored = store.get().expect("pair restored");

        assert!(restored.is_expired_at(Utc::now()));
        assert_eq!(header.value().as_deref(), Some("Bearer opaque"));
    }

    #[test]
    fn test_half_persisted_pair_is_ignored() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(ACCESS_TOKEN_KEY, "orphan").unwrap();

        let store = TokenStore::load(storage, AuthorizationHeader::new());
        assert_eq!(store.get(), None);
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let path = std::env::temp_dir().join(format!("benchdash-{}.json", uuid::Uuid::new_v4()));

        {
            let storage = FileStorage::open(&path);
            storage.set(ACCESS_TOKEN_KEY, "persisted").unwrap();
        }

        let reopened = FileStorage::open(&path);
        assert_eq!(reopened.get(ACCESS_TOKEN_KEY).as_deref(), Some("persisted"));
        reopened.remove(ACCESS_TOKEN_KEY).unwrap();
        assert_eq!(FileStorage::open(&path).get(ACCESS_TOKEN_KEY), None);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_reads_as_empty() {
        let path = std::env::temp_dir().join(format!("benchdash-{}.json", uuid::Uuid::new_v4()));
        fs::write(&path, "{not json").unwrap();

        let storage = FileStorage::open(&path);
        assert_eq!(storage.get(ACCESS_TOKEN_KEY), None);

        let _ = fs::remove_file(&path);
    }
}
