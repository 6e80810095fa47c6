//! # Cache Module
//!
//! In-memory cache for everything the gateway learns from upstream
//! providers, plus the bookkeeping that keeps concurrent requests from
//! paying for the same upstream call twice.
//!
//! ## Tiers
//!
//! Three independent namespaces share one lock and one snapshot file:
//!
//! - **Playlists**: filtered toplist listings and toplist details
//! - **Streams**: resolved playback URLs (short TTL, the links expire)
//! - **Metadata**: canonical song metadata, including lyrics
//!
//! Entries only remember when they were written. Each read passes the TTL
//! that matters to that caller, and an entry seen expired is dropped on the
//! spot.
//!
//! ## Coalescing
//!
//! Before a costly upstream call the caller claims the key. Anyone else
//! asking for the same key polls the cache until the result shows up,
//! takes over if the claim disappears without a result, or gives up waiting
//! and resolves on its own once `max_wait` runs out.
//!
//! ## Persistence
//!
//! [`CacheManager::save`] writes all tiers to one JSON file;
//! [`CacheManager::load`] reads it back at startup and never fails: a
//! missing or corrupt file just means an empty cache.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tunehub_gateway::cache::{CacheManager, CacheSettings, CacheTier};
//! use std::time::Duration;
//!
//! # fn example() -> tunehub_gateway::error::Result<()> {
//! let cache = CacheManager::open(CacheSettings::new("./data/server_cache.json"));
//!
//! cache.set(CacheTier::Streams, "stream_netease:186016_320k", &"https://m701.music.126.net/x.mp3")?;
//!
//! let url: Option<String> = cache.get(CacheTier::Streams, "stream_netease:186016_320k", Duration::from_secs(1800));
//! assert!(url.is_some());
//!
//! cache.close()?;
//! # Ok(())
//! # }
//! ```

pub mod expiring;
pub mod pending;
pub mod snapshot;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, path::PathBuf, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;

pub use expiring::{CacheEntry, ExpiringCache};
pub use pending::{Claim, ClaimGuard, Coalesced, PendingSet, Resolver};
pub use snapshot::LoadReport;

/// Los tres espacios de nombres de la caché
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Playlists,
    Streams,
    Metadata,
}

impl CacheTier {
    pub const ALL: [CacheTier; 3] = [CacheTier::Playlists, CacheTier::Streams, CacheTier::Metadata];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Playlists => "playlists",
            CacheTier::Streams => "streams",
            CacheTier::Metadata => "metadata",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache key layout shared by the gateway, the refresh scheduler and the
/// snapshot purge.
pub mod keys {
    use crate::sources::AudioQuality;

    /// Listings filtered through the allow-list. Stale as soon as the
    /// allow-list changes, so they never survive a restart.
    pub const FILTERED_PLAYLISTS_PREFIX: &str = "playlists_filtered_";
    pub const PLAYLIST_DETAIL_PREFIX: &str = "playlist_detail_";

    pub fn filtered_playlists(scope: &str) -> String {
        format!("{}{}", FILTERED_PLAYLISTS_PREFIX, scope)
    }

    pub fn playlist_detail(collection_id: &str) -> String {
        format!("{}{}", PLAYLIST_DETAIL_PREFIX, collection_id)
    }

    pub fn stream_url(item_id: &str, quality: AudioQuality) -> String {
        format!("stream_{}_{}", item_id, quality)
    }

    /// Metadata-tier key for a lyrics lookup. Empty string means the song
    /// has none.
    pub fn lyrics(item_id: &str) -> String {
        format!("lyrics_{}", item_id)
    }
}

/// Configuración inyectada en el gestor de caché
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub snapshot_path: PathBuf,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// Playlist-tier key prefixes derived from mutable configuration.
    /// Entries under them are dropped when a snapshot is loaded.
    pub config_derived_prefixes: Vec<String>,
}

impl CacheSettings {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            poll_interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(20),
            config_derived_prefixes: vec![keys::FILTERED_PLAYLISTS_PREFIX.to_string()],
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.pending_poll_interval,
            max_wait: config.pending_max_wait,
            ..Self::new(config.snapshot_path())
        }
    }
}

/// Everything guarded by the single cache lock.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) playlists: ExpiringCache,
    pub(crate) streams: ExpiringCache,
    pub(crate) metadata: ExpiringCache,
    pub(crate) pending: PendingSet,
}

impl CacheState {
    pub(crate) fn tier(&self, tier: CacheTier) -> &ExpiringCache {
        match tier {
            CacheTier::Playlists => &self.playlists,
            CacheTier::Streams => &self.streams,
            CacheTier::Metadata => &self.metadata,
        }
    }

    pub(crate) fn tier_mut(&mut self, tier: CacheTier) -> &mut ExpiringCache {
        match tier {
            CacheTier::Playlists => &mut self.playlists,
            CacheTier::Streams => &mut self.streams,
            CacheTier::Metadata => &mut self.metadata,
        }
    }
}

/// Gestor de caché con tres niveles, coalescing y snapshot en disco.
///
/// Cheap to clone; clones share state. No method holds the lock across an
/// `.await`.
#[derive(Clone)]
pub struct CacheManager {
    state: Arc<Mutex<CacheState>>,
    // Serializa las escrituras del snapshot
    save_lock: Arc<Mutex<()>>,
    settings: Arc<CacheSettings>,
}

impl CacheManager {
    /// Empty cache; nothing is read from disk.
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            save_lock: Arc::new(Mutex::new(())),
            settings: Arc::new(settings),
        }
    }

    /// Creates the manager and loads the snapshot, if any.
    pub fn open(settings: CacheSettings) -> Self {
        let cache = Self::new(settings);
        cache.load();
        cache
    }

    /// Flushes the snapshot. The manager stays usable.
    pub fn close(&self) -> Result<()> {
        self.save()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Typed read. A value that no longer decodes as `T` is evicted.
    pub fn get<T: DeserializeOwned>(&self, tier: CacheTier, key: &str, ttl: Duration) -> Option<T> {
        let mut state = self.state.lock();
        decode_fresh(&mut state, tier, key, ttl)
    }

    pub fn get_value(&self, tier: CacheTier, key: &str, ttl: Duration) -> Option<serde_json::Value> {
        self.state.lock().tier_mut(tier).get(key, ttl).cloned()
    }

    pub fn set<T: Serialize + ?Sized>(&self, tier: CacheTier, key: &str, value: &T) -> Result<()> {
        // Serializar fuera del lock
        let value = serde_json::to_value(value)?;
        self.set_value(tier, key, value);
        Ok(())
    }

    pub fn set_value(&self, tier: CacheTier, key: &str, value: serde_json::Value) {
        self.state.lock().tier_mut(tier).insert(key, value);
        debug!("💾 [{}] {}", tier, key);
    }

    pub fn invalidate(&self, tier: CacheTier, key: &str) -> bool {
        self.state.lock().tier_mut(tier).remove(key)
    }

    pub fn invalidate_prefix(&self, tier: CacheTier, prefix: &str) -> usize {
        self.state.lock().tier_mut(tier).remove_prefix(prefix)
    }

    /// Drops every entry of `tier` older than `ttl`.
    pub fn purge_expired(&self, tier: CacheTier, ttl: Duration) -> usize {
        let removed = self.state.lock().tier_mut(tier).cleanup_expired(ttl);
        if removed > 0 {
            info!("🧹 Cache cleanup [{}]: removed {} expired entries", tier, removed);
        }
        removed
    }

    pub fn len(&self, tier: CacheTier) -> usize {
        self.state.lock().tier(tier).len()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_pending(&self, tier: CacheTier, key: &str) -> bool {
        self.state.lock().pending.contains(&pending_key(tier, key))
    }

    /// Marks `key` as being resolved, unless someone already did.
    pub fn try_claim(&self, tier: CacheTier, key: &str) -> Claim {
        let pending_key = pending_key(tier, key);
        let claimed = self.state.lock().pending.try_insert(&pending_key);

        if claimed {
            Claim::Claimed(ClaimGuard::new(Arc::clone(&self.state), pending_key))
        } else {
            Claim::AlreadyPending
        }
    }

    /// Explicit form of dropping the guard.
    pub fn release(&self, guard: ClaimGuard) {
        drop(guard);
    }

    /// Returns the cached value, or decides who resolves it.
    ///
    /// Polls every `poll_interval`, sleeping outside the lock:
    /// - the value shows up: [`Coalesced::Ready`]
    /// - the key is free (never claimed, or the previous resolver gave up
    ///   without a result): claims it, [`Resolver::Owner`]
    /// - `max_wait` elapses with the key still claimed: [`Resolver::Fallback`]
    pub async fn claim_or_wait<T: DeserializeOwned>(
        &self,
        tier: CacheTier,
        key: &str,
        ttl: Duration,
    ) -> Coalesced<T> {
        let pending_key = pending_key(tier, key);
        let deadline = Instant::now() + self.settings.max_wait;
        let mut waited = false;

        loop {
            {
                let mut state = self.state.lock();

                if let Some(value) = decode_fresh(&mut state, tier, key, ttl) {
                    if waited {
                        debug!("✅ Resultado disponible tras esperar: {}", key);
                    }
                    return Coalesced::Ready(value);
                }

                if state.pending.try_insert(&pending_key) {
                    if waited {
                        info!("🔁 Marker for {} vanished without a result, taking over", key);
                    }
                    return Coalesced::Resolve(Resolver::Owner(ClaimGuard::new(
                        Arc::clone(&self.state),
                        pending_key,
                    )));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "⌛ {} still pending after {:?}, resolving directly",
                    key, self.settings.max_wait
                );
                return Coalesced::Resolve(Resolver::Fallback);
            }

            if !waited {
                info!("⏳ [PENDING] Request already in progress for {}, waiting...", key);
                waited = true;
            }

            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheManager")
            .field("playlists", &state.playlists.len())
            .field("streams", &state.streams.len())
            .field("metadata", &state.metadata.len())
            .field("pending", &state.pending.len())
            .field("snapshot", &self.settings.snapshot_path)
            .finish()
    }
}

fn pending_key(tier: CacheTier, key: &str) -> String {
    format!("{}:{}", tier, key)
}

fn decode_fresh<T: DeserializeOwned>(state: &mut CacheState, tier: CacheTier, key: &str, ttl: Duration) -> Option<T> {
    let cache = state.tier_mut(tier);
    let decoded = T::deserialize(cache.get(key, ttl)?);

    match decoded {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("⚠️ [{}] {} no longer decodes, evicting: {}", tier, key, e);
            cache.remove(key);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{CanonicalCollection, CanonicalItem};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(dir: &tempfile::TempDir) -> CacheSettings {
        CacheSettings {
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_millis(400),
            ..CacheSettings::new(dir.path().join("server_cache.json"))
        }
    }

    #[test]
    fn test_typed_roundtrip_within_tier() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(settings(&dir));
        let collection = CanonicalCollection {
            id: "netease_19723756".into(),
            name: "飙升榜".into(),
            items: vec![CanonicalItem {
                id: "netease:1".into(),
                ..Default::default()
            }],
            ..Default::default()
        };

        cache.set(CacheTier::Playlists, "playlist_detail_netease_19723756", &collection).unwrap();

        let hit: Option<CanonicalCollection> =
            cache.get(CacheTier::Playlists, "playlist_detail_netease_19723756", Duration::from_secs(60));
        assert_eq!(hit, Some(collection));
    }

    #[test]
    fn test_tiers_are_independent_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(settings(&dir));
        let ttl = Duration::from_secs(60);

        cache.set(CacheTier::Streams, "netease:1", "https://a").unwrap();

        assert_eq!(cache.get::<String>(CacheTier::Metadata, "netease:1", ttl), None);
        assert_eq!(cache.get::<String>(CacheTier::Playlists, "netease:1", ttl), None);
        assert_eq!(cache.len(CacheTier::Streams), 1);

        assert!(cache.invalidate(CacheTier::Streams, "netease:1"));
        assert_eq!(cache.len(CacheTier::Streams), 0);
    }

    #[test]
    fn test_undecodable_value_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(settings(&dir));
        cache.set(CacheTier::Metadata, "netease:1", "not an item").unwrap();

        let item: Option<CanonicalItem> = cache.get(CacheTier::Metadata, "netease:1", Duration::from_secs(60));
        assert!(item.is_none());
        assert_eq!(cache.len(CacheTier::Metadata), 0);
    }

    #[test]
    fn test_claim_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(settings(&dir));

        let first = cache.try_claim(CacheTier::Streams, "stream_netease:1_320k");
        assert!(first.is_claimed());
        assert!(!cache.try_claim(CacheTier::Streams, "stream_netease:1_320k").is_claimed());
        // Otra clave, otro marcador
        assert!(cache.try_claim(CacheTier::Streams, "stream_netease:2_320k").is_claimed());

        match first {
            Claim::Claimed(guard) => cache.release(guard),
            Claim::AlreadyPending => unreachable!(),
        }

        assert!(cache.try_claim(CacheTier::Streams, "stream_netease:1_320k").is_claimed());
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn test_guard_releases_on_error_path() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(settings(&dir));

        let failing = |cache: &CacheManager| -> std::result::Result<(), &'static str> {
            let _guard = match cache.try_claim(CacheTier::Playlists, "k") {
                Claim::Claimed(guard) => guard,
                Claim::AlreadyPending => return Err("pending"),
            };
            Err("upstream exploded")
        };

        assert_eq!(failing(&cache), Err("upstream exploded"));
        assert!(!cache.is_pending(CacheTier::Playlists, "k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(settings(&dir));
        let winners = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let winners = winners.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let claim = cache.try_claim(CacheTier::Streams, "hot");
                if claim.is_claimed() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                // Mantener el guard vivo hasta que todos hayan intentado
                tokio::time::sleep(Duration::from_millis(50)).await;
                drop(claim);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(cache.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_waiter_receives_owner_result() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(settings(&dir));
        let ttl = Duration::from_secs(60);

        let guard = match cache.try_claim(CacheTier::Streams, "k") {
            Claim::Claimed(guard) => guard,
            Claim::AlreadyPending => unreachable!(),
        };

        let owner = {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cache.set(CacheTier::Streams, "k", "https://resolved").unwrap();
                drop(guard);
            })
        };

        match cache.claim_or_wait::<String>(CacheTier::Streams, "k", ttl).await {
            Coalesced::Ready(url) => assert_eq!(url, "https://resolved"),
            Coalesced::Resolve(_) => panic!("waiter should have received the owner's result"),
        }
        owner.await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_takes_over_when_owner_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(settings(&dir));

        let guard = match cache.try_claim(CacheTier::Streams, "k") {
            Claim::Claimed(guard) => guard,
            Claim::AlreadyPending => unreachable!(),
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            // Falla sin escribir resultado
            drop(guard);
        });

        let resolver = match cache.claim_or_wait::<String>(CacheTier::Streams, "k", Duration::from_secs(60)).await {
            Coalesced::Resolve(resolver) => resolver,
            Coalesced::Ready(_) => panic!("nothing was cached"),
        };
        assert!(resolver.is_owner());
        assert!(cache.is_pending(CacheTier::Streams, "k"));

        drop(resolver);
        assert!(!cache.is_pending(CacheTier::Streams, "k"));
    }

    #[tokio::test]
    async fn test_stuck_marker_falls_back_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(settings(&dir));

        let _stuck = cache.try_claim(CacheTier::Playlists, "k");
        let started = Instant::now();

        match cache.claim_or_wait::<String>(CacheTier::Playlists, "k", Duration::from_secs(60)).await {
            Coalesced::Resolve(Resolver::Fallback) => {}
            other => panic!("expected fallback, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(400));
        // El marcador ajeno sigue en su sitio
        assert!(cache.is_pending(CacheTier::Playlists, "k"));
    }
}
