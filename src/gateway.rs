//! # Gateway
//!
//! The service the outward protocol layer talks to. It owns the cache
//! manager, the audio store and the background tasks, and decides for each
//! request whether the answer comes from disk, from cache, or from one
//! (coalesced) upstream call.
//!
//! ## Request paths
//!
//! - **Listings and toplists**: cache, then one coalesced normalizer call.
//! - **Streams**: local file, then cached URL, then one coalesced metered
//!   resolution that also caches the song's metadata and starts a download.
//! - **Songs, lyrics, cover art**: read mostly from the metadata tier that
//!   the other paths seed.

use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cache::{keys, CacheManager, CacheSettings, CacheTier, Coalesced};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::sources::{
    collection_id, parse_collection_id, parse_item_id, AudioFetcher, AudioQuality,
    CanonicalCollection, CanonicalItem, Platform, SourceNormalizer, UpstreamError, UpstreamResult,
};
use crate::storage::{AssetLabel, DiskStore};
use crate::tasks::BackgroundTasks;

const ALL_PLATFORMS: &str = "all";

const NETEASE_PLAYLIST_COVER: &str = "https://p1.music.126.net/playlist_cover_";
const NETEASE_SONG_COVER: &str = "https://p1.music.126.net/song_cover_";
const QQ_DEFAULT_COVER: &str = "https://y.qq.com/mediastyle/global/img/album_300.png";
const PLAYLIST_PLACEHOLDER_COVER: &str = "https://via.placeholder.com/300x300?text=TuneHub";
const SONG_PLACEHOLDER_COVER: &str = "https://via.placeholder.com/300x300?text=Music";

/// Where a stream request should be served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Fully downloaded asset on disk.
    LocalFile {
        path: PathBuf,
        content_type: &'static str,
    },
    /// Upstream URL for a 302.
    Redirect(String),
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) cache: CacheManager,
    pub(crate) store: DiskStore,
    pub(crate) normalizer: Arc<dyn SourceNormalizer>,
    pub(crate) fetcher: Arc<dyn AudioFetcher>,
    pub(crate) tasks: BackgroundTasks,
    pub(crate) refresh_signal: Notify,
    pub(crate) refresh_started: AtomicBool,
}

/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Gateway {
    pub(crate) inner: Arc<Inner>,
}

impl Gateway {
    /// Loads the snapshot, opens the audio store and returns a ready
    /// gateway. The refresh scheduler is not started; see
    /// [`Gateway::start_refresh`].
    pub async fn open(
        config: Config,
        normalizer: Arc<dyn SourceNormalizer>,
        fetcher: Arc<dyn AudioFetcher>,
    ) -> Result<Self> {
        let cache = CacheManager::open(CacheSettings::from_config(&config));
        let store = DiskStore::open(&config.cache_dir, config.audio_cache_max_size).await?;
        let tasks = BackgroundTasks::new(config.max_concurrent_downloads);

        info!("🚀 Gateway ready ({:?})", cache);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cache,
                store,
                normalizer,
                fetcher,
                tasks,
                refresh_signal: Notify::new(),
                refresh_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.inner.cache
    }

    pub fn store(&self) -> &DiskStore {
        &self.inner.store
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.inner.tasks
    }

    /// Toplists of one platform, or of every allow-listed platform for
    /// `"all"`, filtered through the allow-list.
    ///
    /// Platforms that fail are skipped. If all of them fail the error is
    /// returned and nothing is cached.
    pub async fn playlists(&self, scope: &str) -> Result<Vec<CanonicalCollection>> {
        let scope = scope.trim();
        let scope = if scope.is_empty() { ALL_PLATFORMS } else { scope };

        let platforms: Vec<Platform> = if scope == ALL_PLATFORMS {
            self.inner.config.allowed_playlists.platforms().collect()
        } else {
            vec![scope.parse()?]
        };

        let key = keys::filtered_playlists(scope);
        let ttl = self.inner.config.playlist_ttl;

        self.resolve_coalesced(CacheTier::Playlists, &key, ttl, move || async move {
            info!("🌐 [API CALL] Fetching toplists from {}", scope);

            let mut fetched = Vec::new();
            let mut last_error = None;

            for platform in &platforms {
                let platform = *platform;
                match self
                    .upstream(platform, self.inner.normalizer.resolve_collection_list(platform))
                    .await
                {
                    Ok(lists) => fetched.extend(lists.into_iter().map(|mut list| {
                        list.platform.get_or_insert(platform);
                        list
                    })),
                    Err(e) => {
                        warn!("⚠️ Failed to get toplists from {}: {}", platform, e);
                        last_error = Some(e);
                    }
                }
            }

            if fetched.is_empty() {
                if let Some(e) = last_error {
                    return Err(e.into());
                }
            }

            let total = fetched.len();
            let allowed = &self.inner.config.allowed_playlists;
            let filtered: Vec<CanonicalCollection> = fetched
                .into_iter()
                .filter_map(|mut list| {
                    let platform = list.platform?;
                    if !allowed.contains(platform, &list.id) {
                        return None;
                    }
                    list.id = collection_id(platform, &list.id);
                    Some(list)
                })
                .collect();

            info!("🔍 [FILTER] Filtered {} -> {} playlists", total, filtered.len());
            Ok::<_, GatewayError>(filtered)
        })
        .await
    }

    /// One toplist with its songs. `id` is `platform_toplistId`; without a
    /// prefix it belongs to the default platform.
    pub async fn playlist(&self, id: &str) -> Result<CanonicalCollection> {
        let id = id.trim();
        if id.is_empty() {
            return Err(GatewayError::MissingParameter("id"));
        }

        let (platform, actual_id) = parse_collection_id(id, self.inner.config.default_platform)?;
        let key = keys::playlist_detail(id);
        let ttl = self.inner.config.playlist_ttl;

        self.resolve_coalesced(CacheTier::Playlists, &key, ttl, move || async move {
            info!("🌐 [API CALL] Fetching playlist detail: {}", id);

            let mut collection = self
                .upstream(
                    platform,
                    self.inner.normalizer.resolve_collection_items(platform, actual_id),
                )
                .await?;

            collection.id = id.to_string();
            collection.platform = Some(platform);
            for item in &mut collection.items {
                item.platform.get_or_insert(platform);
            }

            let seeded = self.seed_metadata(collection.items.iter().filter(|item| !item.id.is_empty()), true);
            info!(
                "💾 [CACHED] Stored playlist {} with {} songs ({} metadata seeded)",
                id,
                collection.items.len(),
                seeded
            );
            Ok::<_, GatewayError>(collection)
        })
        .await
    }

    /// Searches one platform, or every configured search platform in
    /// parallel. Results are not cached, but songs with a cover seed the
    /// metadata tier.
    pub async fn search(&self, query: &str, platform: Option<&str>) -> Result<Vec<CanonicalItem>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(GatewayError::MissingParameter("query"));
        }

        let items = match platform.map(str::trim).filter(|p| !p.is_empty()) {
            Some(platform) => {
                let platform: Platform = platform.parse()?;
                self.upstream(platform, self.inner.normalizer.resolve_search(platform, query))
                    .await?
            }
            None => {
                let searches = self.inner.config.search_platforms.iter().map(move |&platform| async move {
                    match self
                        .upstream(platform, self.inner.normalizer.resolve_search(platform, query))
                        .await
                    {
                        Ok(items) => items,
                        Err(e) => {
                            warn!("⚠️ Search failed for {}: {}", platform, e);
                            Vec::new()
                        }
                    }
                });
                join_all(searches).await.into_iter().flatten().collect()
            }
        };

        self.seed_metadata(items.iter().filter(|item| !item.id.is_empty() && item.has_cover()), false);
        debug!("🔍 Search '{}' -> {} results", query, items.len());
        Ok(items)
    }

    /// Decides how to serve a song. `id` is `platform:songId`.
    pub async fn stream(&self, id: &str, max_bit_rate: Option<u32>) -> Result<StreamOutcome> {
        let id = id.trim();
        if id.is_empty() {
            return Err(GatewayError::MissingParameter("id"));
        }

        let (platform, actual_id) = parse_item_id(id, self.inner.config.default_platform)?;
        let quality = AudioQuality::from_max_bit_rate(max_bit_rate, self.inner.config.default_quality);

        if let Some(path) = self.inner.store.path(id, quality).await {
            info!("📀 [LOCAL CACHE HIT] Serving audio from disk: {}", id);
            return Ok(StreamOutcome::LocalFile {
                path,
                content_type: quality.content_type(),
            });
        }

        let key = keys::stream_url(id, quality);
        let ttl = self.inner.config.stream_url_ttl;

        let (url, resolved_here): (String, bool) = self
            .resolve_coalesced_tracked(CacheTier::Streams, &key, ttl, move || async move {
                info!("💳 [API CALL - 1 CREDIT] Parsing song: {} quality: {}", id, quality);

                let resolution = self
                    .upstream(
                        platform,
                        self.inner.normalizer.resolve_playback_url(platform, actual_id, quality),
                    )
                    .await?;

                if resolution.url.is_empty() {
                    return Err(UpstreamError::NotFound(id.to_string()).into());
                }

                let mut metadata = CanonicalItem {
                    id: id.to_string(),
                    platform: Some(platform),
                    ..resolution.item
                }
                .with_https_cover();
                if metadata.title.is_empty() {
                    metadata.title = "Unknown".to_string();
                }
                if metadata.artist.is_empty() {
                    metadata.artist = "Unknown".to_string();
                }

                self.inner.cache.set(CacheTier::Metadata, id, &metadata)?;
                self.spawn_download(resolution.url.clone(), id, quality, &metadata);

                Ok::<_, GatewayError>(resolution.url)
            })
            .await?;

        if resolved_here {
            info!("💾 [CACHED] Stored stream URL and metadata for {}", id);
            self.persist().await;
        } else {
            debug!("🔗 [URL CACHE HIT] {}", id);
        }

        Ok(StreamOutcome::Redirect(url))
    }

    /// Cached metadata, or a "Loading..." placeholder until the song has
    /// been resolved once.
    pub fn song(&self, id: &str) -> Result<CanonicalItem> {
        let id = id.trim();
        if id.is_empty() {
            return Err(GatewayError::MissingParameter("id"));
        }

        Ok(self
            .inner
            .cache
            .get(CacheTier::Metadata, id, self.inner.config.metadata_ttl)
            .unwrap_or_else(|| CanonicalItem::placeholder(id)))
    }

    /// Lyrics for a song. Empty when nobody has them; upstream failures are
    /// logged and also yield an empty string.
    pub async fn lyrics(&self, id: &str) -> Result<String> {
        let id = id.trim();
        if id.is_empty() {
            return Err(GatewayError::MissingParameter("id"));
        }

        let ttl = self.inner.config.metadata_ttl;
        let cached: Option<CanonicalItem> = self.inner.cache.get(CacheTier::Metadata, id, ttl);
        if let Some(lyrics) = cached.as_ref().and_then(|item| item.lyrics.clone()).filter(|l| !l.is_empty()) {
            debug!("📝 [CACHE HIT] Returning cached lyrics for {}", id);
            return Ok(lyrics);
        }

        let (platform, actual_id) = match parse_item_id(id, self.inner.config.default_platform) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("⚠️ Not fetching lyrics for {}: {}", id, e);
                return Ok(String::new());
            }
        };

        let resolved = self
            .resolve_coalesced(CacheTier::Metadata, &keys::lyrics(id), ttl, move || async move {
                let lyrics = self
                    .upstream(platform, self.inner.normalizer.resolve_lyrics(platform, actual_id))
                    .await?;
                Ok::<_, GatewayError>(lyrics.unwrap_or_default())
            })
            .await;

        let lyrics = match resolved {
            Ok(lyrics) if !lyrics.is_empty() => lyrics,
            Ok(_) => return Ok(String::new()),
            Err(e) => {
                warn!("⚠️ Failed to fetch lyrics for {}: {}", id, e);
                return Ok(String::new());
            }
        };

        let mut metadata = self
            .inner
            .cache
            .get(CacheTier::Metadata, id, ttl)
            .or(cached)
            .unwrap_or_else(|| CanonicalItem {
                id: id.to_string(),
                platform: Some(platform),
                ..CanonicalItem::default()
            });
        if metadata.lyrics.as_deref() != Some(lyrics.as_str()) {
            metadata.lyrics = Some(lyrics.clone());
            if let Err(e) = self.inner.cache.set(CacheTier::Metadata, id, &metadata) {
                warn!("⚠️ Could not cache lyrics for {}: {}", id, e);
            }
        }

        debug!("📝 Lyrics ready for {}", id);
        Ok(lyrics)
    }

    /// Image URL for a cover id:
    /// - `pl-<platform>_<toplist>`: toplist cover
    /// - `al-<platform>:<song>` and `<platform>:<song>`: song cover
    ///
    /// Cached covers win, then per-provider fallbacks.
    pub fn cover_art_url(&self, cover_id: &str) -> Option<String> {
        let cover_id = cover_id.trim();

        if let Some(playlist_id) = cover_id.strip_prefix("pl-") {
            let (platform, actual_id) = playlist_id.split_once('_')?;
            let cached: Option<CanonicalCollection> = self.inner.cache.get(
                CacheTier::Playlists,
                &keys::playlist_detail(playlist_id),
                self.inner.config.playlist_ttl,
            );
            if let Some(cover) = cached.map(|c| c.cover_url).filter(|c| !c.is_empty()) {
                return Some(cover);
            }
            return Some(match platform {
                "netease" => format!("{}{}.jpg", NETEASE_PLAYLIST_COVER, actual_id),
                "qq" => QQ_DEFAULT_COVER.to_string(),
                _ => PLAYLIST_PLACEHOLDER_COVER.to_string(),
            });
        }

        let song_id = cover_id.strip_prefix("al-").unwrap_or(cover_id);
        let cached: Option<CanonicalItem> =
            self.inner
                .cache
                .get(CacheTier::Metadata, song_id, self.inner.config.metadata_ttl);
        if let Some(cover) = cached.map(|item| item.cover_url).filter(|c| !c.is_empty()) {
            return Some(cover);
        }

        let (platform, actual_id) = song_id.split_once(':')?;
        Some(match platform {
            "netease" => format!("{}{}.jpg", NETEASE_SONG_COVER, actual_id),
            "qq" => QQ_DEFAULT_COVER.to_string(),
            _ => SONG_PLACEHOLDER_COVER.to_string(),
        })
    }

    /// Stops the refresh scheduler, drains downloads within the grace period
    /// and writes the snapshot.
    pub async fn close(&self) -> Result<()> {
        info!("🛑 Shutting down gateway...");

        if !self.inner.tasks.shutdown(self.inner.config.shutdown_grace).await {
            warn!("⚠️ Some downloads did not finish; their temp files stay behind");
        }

        let cache = self.inner.cache.clone();
        tokio::task::spawn_blocking(move || cache.close())
            .await
            .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?
    }

    /// Cache-then-single-flight lookup.
    ///
    /// The owner's result is stored before its claim is released, so
    /// waiters find the value rather than an empty slot. Errors are not
    /// cached.
    pub(crate) async fn resolve_coalesced<T, F, Fut>(
        &self,
        tier: CacheTier,
        key: &str,
        ttl: Duration,
        resolve: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (value, _) = self.resolve_coalesced_tracked(tier, key, ttl, resolve).await?;
        Ok(value)
    }

    /// Like [`Gateway::resolve_coalesced`], also telling whether `resolve`
    /// ran for this caller.
    async fn resolve_coalesced_tracked<T, F, Fut>(
        &self,
        tier: CacheTier,
        key: &str,
        ttl: Duration,
        resolve: F,
    ) -> Result<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let resolver = match self.inner.cache.claim_or_wait::<T>(tier, key, ttl).await {
            Coalesced::Ready(value) => {
                debug!("✅ [CACHE HIT] {}", key);
                return Ok((value, false));
            }
            Coalesced::Resolve(resolver) => resolver,
        };

        let value = resolve().await?;
        self.inner.cache.set(tier, key, &value)?;
        drop(resolver);

        Ok((value, true))
    }

    /// Normalizer call bounded by the upstream timeout.
    pub(crate) async fn upstream<T>(
        &self,
        platform: Platform,
        call: impl Future<Output = UpstreamResult<T>>,
    ) -> UpstreamResult<T> {
        let timeout = self.inner.config.upstream_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Transient {
                platform,
                reason: format!("timed out after {:?}", timeout),
            }),
        }
    }

    /// Writes the snapshot off the async workers. Failures are logged.
    pub(crate) async fn persist(&self) {
        let cache = self.inner.cache.clone();
        match tokio::task::spawn_blocking(move || cache.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("❌ Error saving cache snapshot: {}", e),
            Err(e) => error!("❌ Snapshot task failed: {}", e),
        }
    }

    /// Stores items in the metadata tier. With `keep_lyrics`, an existing
    /// entry that already has lyrics is left alone.
    fn seed_metadata<'a>(&self, items: impl Iterator<Item = &'a CanonicalItem>, keep_lyrics: bool) -> usize {
        let ttl = self.inner.config.metadata_ttl;
        let mut seeded = 0;

        for item in items {
            if keep_lyrics {
                let existing: Option<CanonicalItem> = self.inner.cache.get(CacheTier::Metadata, &item.id, ttl);
                if existing.is_some_and(|e| e.has_lyrics()) {
                    continue;
                }
            }
            match self.inner.cache.set(CacheTier::Metadata, &item.id, item) {
                Ok(()) => seeded += 1,
                Err(e) => warn!("⚠️ Could not cache metadata for {}: {}", item.id, e),
            }
        }

        seeded
    }

    fn spawn_download(&self, url: String, id: &str, quality: AudioQuality, metadata: &CanonicalItem) {
        let store = self.inner.store.clone();
        let fetcher = Arc::clone(&self.inner.fetcher);
        let label = AssetLabel::new(&metadata.artist, &metadata.title);
        let item_id = id.to_string();

        self.inner
            .tasks
            .spawn_download(DiskStore::stable_stem(id, quality), async move {
                if store.has(&item_id, quality).await {
                    return Ok(());
                }

                info!("⬇️ [DOWNLOAD] Starting background download: {}", item_id);
                let body = fetcher.fetch(&url).await?;
                store.write(&item_id, quality, Some(&label), body).await?;
                Ok(())
            });
    }
}
