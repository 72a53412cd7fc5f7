//! Session store with load-and-lock / commit-and-unlock transactions
//!
//! Both the engine loop and the HTTP request handlers reach session state
//! only through a [`SessionTxn`], so no two mutations of one session can
//! interleave. A transaction works on its own copy of the state; only
//! [`SessionTxn::commit`] writes it back; dropping it discards the changes.

use super::{SessionError, SessionState, MAX_SESSION_ID_LEN};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Identity of one incarnation of a session. A session destroyed and
/// created again under the same id gets a new generation.
pub type Generation = u64;

/// Client-chosen session key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Validate a session key: 1 to 128 characters of `[A-Za-z0-9_-]`
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_SESSION_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(SessionError::InvalidId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write-back half of a transaction, held by the store for as long as the
/// session is locked. Dropping it releases the lock without writing.
#[async_trait]
pub trait SessionLock: Send {
    /// Replace the stored state with `state`
    async fn commit(&mut self, state: SessionState);
}

/// Exclusive access to one session
pub struct SessionTxn {
    id: SessionId,
    generation: Generation,
    state: SessionState,
    lock: Box<dyn SessionLock>,
}

impl SessionTxn {
    /// Transaction over `state`, loaded while `lock` is held
    pub fn new(
        id: SessionId,
        generation: Generation,
        state: SessionState,
        lock: Box<dyn SessionLock>,
    ) -> Self {
        Self {
            id,
            generation,
            state,
            lock,
        }
    }

    /// Generation of the session this transaction loaded
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Write the state back and unlock
    pub async fn commit(self) {
        let Self {
            id,
            state,
            mut lock,
            ..
        } = self;
        lock.commit(state).await;
        trace!(session = %id, "Session committed");
    }
}

impl Deref for SessionTxn {
    type Target = SessionState;

    fn deref(&self) -> &SessionState {
        &self.state
    }
}

impl DerefMut for SessionTxn {
    fn deref_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }
}

/// Key-value store of session state
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert `state` under `id` unless a session already exists there.
    /// Returns the new session's generation, or `None` if one existed.
    async fn create(&self, id: &SessionId, state: SessionState) -> Option<Generation>;

    /// Lock the session for a load-modify-commit sequence.
    /// Returns `None` once the session has been destroyed.
    async fn load_and_lock(&self, id: &SessionId) -> Option<SessionTxn>;

    /// Remove the session. Returns whether it existed.
    async fn destroy(&self, id: &SessionId) -> bool;
}

/// One stored session
struct Slot {
    generation: Generation,
    state: SessionState,
}

/// Lock on a [`MemoryStore`] slot
struct MemoryLock {
    guard: OwnedMutexGuard<Slot>,
}

#[async_trait]
impl SessionLock for MemoryLock {
    async fn commit(&mut self, state: SessionState) {
        self.guard.state = state;
    }
}

/// In-process session store
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<Slot>>>>,
    generations: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, id: &SessionId, state: SessionState) -> Option<Generation> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(id) {
            return None;
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        sessions.insert(id.clone(), Arc::new(Mutex::new(Slot { generation, state })));
        Some(generation)
    }

    async fn load_and_lock(&self, id: &SessionId) -> Option<SessionTxn> {
        let slot = self.sessions.lock().await.get(id).cloned()?;
        let guard = slot.lock_owned().await;
        let generation = guard.generation;
        let state = guard.state.clone();
        Some(SessionTxn::new(
            id.clone(),
            generation,
            state,
            Box::new(MemoryLock { guard }),
        ))
    }

    async fn destroy(&self, id: &SessionId) -> bool {
        self.sessions.lock().await.remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_validation() {
        assert!(SessionId::parse("abc-DEF_123").is_ok());
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("../etc").is_err());
        assert!(SessionId::parse(&"a".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = MemoryStore::new();
        let id = SessionId::parse("s1").unwrap();

        assert!(store.create(&id, SessionState::new()).await.is_some());
        {
            let mut txn = store.load_and_lock(&id).await.unwrap();
            txn.stop();
            txn.commit().await;
        }
        assert!(store.create(&id, SessionState::new()).await.is_none());

        let txn = store.load_and_lock(&id).await.unwrap();
        assert!(!txn.is_running());
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_discarded() {
        let store = MemoryStore::new();
        let id = SessionId::parse("rollback").unwrap();
        store.create(&id, SessionState::new()).await;

        {
            let mut txn = store.load_and_lock(&id).await.unwrap();
            txn.stop();
            txn.admit(0, Vec::new()).unwrap();
        }

        let txn = store.load_and_lock(&id).await.unwrap();
        assert!(txn.is_running());
        assert_eq!(txn.in_seq(), 0);
    }

    #[tokio::test]
    async fn test_recreated_session_has_new_generation() {
        let store = MemoryStore::new();
        let id = SessionId::parse("again").unwrap();

        let first = store.create(&id, SessionState::new()).await.unwrap();
        assert_eq!(store.load_and_lock(&id).await.unwrap().generation(), first);

        assert!(store.destroy(&id).await);
        let second = store.create(&id, SessionState::new()).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.load_and_lock(&id).await.unwrap().generation(), second);
    }

    #[tokio::test]
    async fn test_destroy_ends_access() {
        let store = MemoryStore::new();
        let id = SessionId::parse("gone").unwrap();
        store.create(&id, SessionState::new()).await;

        assert!(store.destroy(&id).await);
        assert!(store.load_and_lock(&id).await.is_none());
        assert!(!store.destroy(&id).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_transactions_are_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let id = SessionId::parse("busy").unwrap();
        store.create(&id, SessionState::new()).await;

        let mut held = store.load_and_lock(&id).await.unwrap();
        held.exchange(Vec::new());

        let contender = {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move { store.load_and_lock(&id).await.map(|txn| txn.control()) })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        held.commit().await;
        assert_eq!(contender.await.unwrap(), Some(1));
    }
}
