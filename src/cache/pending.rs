use parking_lot::Mutex;
use std::{collections::HashSet, fmt, sync::Arc};
use tracing::debug;

use super::CacheState;

/// Claves que alguien está resolviendo ahora mismo contra el proveedor
#[derive(Debug, Default)]
pub struct PendingSet {
    keys: HashSet<String>,
}

impl PendingSet {
    /// Inserts `key` unless it is already pending.
    pub fn try_insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        self.keys.insert(key.to_string())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.keys.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Proof that the holder owns the pending marker for a key.
///
/// Dropping the guard releases the marker, so every exit path of a
/// resolution (success, upstream error, panic unwinding) frees the key.
#[must_use = "dropping the guard releases the claim immediately"]
pub struct ClaimGuard {
    state: Arc<Mutex<CacheState>>,
    key: String,
}

impl ClaimGuard {
    pub(super) fn new(state: Arc<Mutex<CacheState>>, key: String) -> Self {
        Self { state, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.state.lock().pending.remove(&self.key) {
            debug!("🔓 Liberada: {}", self.key);
        }
    }
}

impl fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimGuard").field("key", &self.key).finish()
    }
}

/// Resultado de `try_claim`
#[derive(Debug)]
pub enum Claim {
    Claimed(ClaimGuard),
    AlreadyPending,
}

impl Claim {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Claim::Claimed(_))
    }
}

/// How a caller that must hit the upstream got there.
#[derive(Debug)]
pub enum Resolver {
    /// Holds the marker; other callers wait on it.
    Owner(ClaimGuard),
    /// Gave up waiting on a marker that never cleared. Resolves without
    /// owning the marker, so a second resolver may run concurrently.
    Fallback,
}

impl Resolver {
    pub fn is_owner(&self) -> bool {
        matches!(self, Resolver::Owner(_))
    }
}

/// Outcome of [`super::CacheManager::claim_or_wait`].
#[derive(Debug)]
pub enum Coalesced<T> {
    Ready(T),
    Resolve(Resolver),
}
