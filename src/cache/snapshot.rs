use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt, fs, path::Path, time::Duration};
use tracing::{error, info, warn};

use super::{CacheManager, CacheState, CacheTier, ExpiringCache};
use crate::cache::expiring::CacheEntry;
use crate::error::{GatewayError, Result};

/// Layout del archivo: `{"playlists": {k: [v, ts]}, "streams": {...}, "metadata": {...}}`
#[derive(Serialize)]
struct SnapshotRef<'a> {
    playlists: &'a ExpiringCache,
    streams: &'a ExpiringCache,
    metadata: &'a ExpiringCache,
}

/// Read side keeps entries as raw values so one bad entry can't sink the
/// whole tier.
#[derive(Deserialize, Default)]
struct RawSnapshot {
    #[serde(default)]
    playlists: HashMap<String, Value>,
    #[serde(default)]
    streams: HashMap<String, Value>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

/// Qué se recuperó del snapshot al arrancar
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub playlists: usize,
    pub streams: usize,
    pub metadata: usize,
    /// Entries that were not a `[value, timestamp]` pair.
    pub skipped: usize,
    /// Entries dropped because their key is derived from configuration.
    pub purged: usize,
}

impl LoadReport {
    pub fn total(&self) -> usize {
        self.playlists + self.streams + self.metadata
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} playlists, {} streams, {} metadata ({} skipped, {} purged)",
            self.playlists, self.streams, self.metadata, self.skipped, self.purged
        )
    }
}

impl CacheManager {
    /// Replaces the in-memory tiers with the snapshot on disk.
    ///
    /// Never fails. A missing file leaves the tiers empty; a corrupt one is
    /// logged and also leaves them empty.
    pub fn load(&self) -> LoadReport {
        let path = &self.settings.snapshot_path;

        let raw = match read_snapshot(path) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("📂 No cache snapshot at {}, starting empty", path.display());
                self.replace_tiers(ExpiringCache::new(), ExpiringCache::new(), ExpiringCache::new());
                return LoadReport::default();
            }
            Err(e) => {
                error!("❌ Error loading cache snapshot: {}", e);
                self.replace_tiers(ExpiringCache::new(), ExpiringCache::new(), ExpiringCache::new());
                return LoadReport::default();
            }
        };

        let mut report = LoadReport::default();
        let mut playlists = decode_tier(raw.playlists, CacheTier::Playlists, &mut report.skipped);
        let streams = decode_tier(raw.streams, CacheTier::Streams, &mut report.skipped);
        let metadata = decode_tier(raw.metadata, CacheTier::Metadata, &mut report.skipped);

        for prefix in &self.settings.config_derived_prefixes {
            report.purged += playlists.remove_prefix(prefix);
        }

        report.playlists = playlists.len();
        report.streams = streams.len();
        report.metadata = metadata.len();

        self.replace_tiers(playlists, streams, metadata);

        info!("📦 Cache loaded from disk: {}", report);
        report
    }

    /// Writes every tier to the snapshot file.
    ///
    /// Serialization happens under the cache lock, so the file is always one
    /// consistent point in time. The write goes to a sibling temp file first
    /// and is renamed over the old snapshot.
    pub fn save(&self) -> Result<()> {
        let _saving = self.save_lock.lock();
        let path = &self.settings.snapshot_path;

        let bytes = {
            let state = self.state.lock();
            serde_json::to_vec(&SnapshotRef {
                playlists: &state.playlists,
                streams: &state.streams,
                metadata: &state.metadata,
            })?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        info!("💾 Cache saved to disk ({} bytes)", bytes.len());
        Ok(())
    }

    /// Reloads the file, drops entries older than their tier's TTL and
    /// writes the file back only if something was dropped. Returns how many
    /// entries went.
    ///
    /// For a process that shares the snapshot with a running gateway: what
    /// it writes is the gateway's latest save minus expired entries.
    pub fn purge_snapshot(&self, ttls: &[(CacheTier, Duration)]) -> Result<usize> {
        self.load();

        let purged: usize = ttls
            .iter()
            .map(|&(tier, ttl)| self.purge_expired(tier, ttl))
            .sum();
        if purged > 0 {
            self.save()?;
        }
        Ok(purged)
    }

    fn replace_tiers(&self, playlists: ExpiringCache, streams: ExpiringCache, metadata: ExpiringCache) {
        let mut state = self.state.lock();
        let CacheState {
            playlists: p,
            streams: s,
            metadata: m,
            ..
        } = &mut *state;
        *p = playlists;
        *s = streams;
        *m = metadata;
    }
}

fn read_snapshot(path: &Path) -> Result<Option<RawSnapshot>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|e| GatewayError::CorruptSnapshot {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn decode_tier(raw: HashMap<String, Value>, tier: CacheTier, skipped: &mut usize) -> ExpiringCache {
    let mut cache = ExpiringCache::new();

    for (key, value) in raw {
        match serde_json::from_value::<CacheEntry>(value) {
            Ok(entry) => cache.insert_entry(key, entry),
            Err(e) => {
                warn!("⚠️ Skipping malformed [{}] entry {}: {}", tier, key, e);
                *skipped += 1;
            }
        }
    }

    cache
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(3600);

    fn manager(dir: &tempfile::TempDir) -> CacheManager {
        CacheManager::new(CacheSettings::new(dir.path().join("server_cache.json")))
    }

    #[test]
    fn test_save_then_load_restores_all_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(&dir);
        cache.set(CacheTier::Playlists, "playlist_detail_netease_1", &json!({"id": "netease_1"})).unwrap();
        cache.set(CacheTier::Streams, "stream_netease:1_320k", "https://a").unwrap();
        cache.set(CacheTier::Metadata, "netease:1", &json!({"title": "x"})).unwrap();
        cache.save().unwrap();

        let restored = manager(&dir);
        let report = restored.load();

        assert_eq!(report.total(), 3);
        assert_eq!(
            restored.get::<String>(CacheTier::Streams, "stream_netease:1_320k", TTL),
            Some("https://a".to_string())
        );
        assert_eq!(
            restored.get_value(CacheTier::Metadata, "netease:1", TTL),
            Some(json!({"title": "x"}))
        );
    }

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(&dir);
        cache.set(CacheTier::Streams, "k", "v").unwrap();
        cache.save().unwrap();

        let on_disk: Value =
            serde_json::from_slice(&fs::read(dir.path().join("server_cache.json")).unwrap()).unwrap();
        assert_eq!(on_disk["playlists"], json!({}));
        assert_eq!(on_disk["metadata"], json!({}));
        assert_eq!(on_disk["streams"]["k"][0], json!("v"));
        assert!(on_disk["streams"]["k"][1].is_f64());
        assert!(!dir.path().join("server_cache.json.tmp").exists());
    }

    #[test]
    fn test_load_purges_filtered_listings() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(&dir);
        cache.set(CacheTier::Playlists, "playlists_filtered_all", &json!([])).unwrap();
        cache.set(CacheTier::Playlists, "playlists_filtered_netease", &json!([])).unwrap();
        cache.set(CacheTier::Playlists, "playlist_detail_netease_1", &json!({})).unwrap();
        cache.save().unwrap();

        let restored = manager(&dir);
        let report = restored.load();

        assert_eq!(report.purged, 2);
        assert_eq!(report.playlists, 1);
        assert_eq!(restored.get_value(CacheTier::Playlists, "playlists_filtered_all", TTL), None);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("server_cache.json"), b"{\"playlists\": [tru").unwrap();

        let cache = manager(&dir);
        cache.set(CacheTier::Streams, "stale", "x").unwrap();

        assert_eq!(cache.load(), LoadReport::default());
        assert_eq!(cache.len(CacheTier::Streams), 0);
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(manager(&dir).load().total(), 0);
    }

    #[test]
    fn test_malformed_entry_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let now = crate::cache::expiring::current_timestamp();
        let contents = json!({
            "streams": {
                "good": ["https://ok", now],
                "bad": "not a pair",
            },
        });
        fs::write(dir.path().join("server_cache.json"), contents.to_string()).unwrap();

        let cache = manager(&dir);
        let report = cache.load();

        assert_eq!(report.streams, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(cache.get::<String>(CacheTier::Streams, "good", TTL), Some("https://ok".into()));
    }

    #[test]
    fn test_timestamps_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let old = crate::cache::expiring::current_timestamp() - 7200.0;
        let contents = json!({ "streams": { "old": ["https://x", old] } });
        fs::write(dir.path().join("server_cache.json"), contents.to_string()).unwrap();

        let cache = manager(&dir);
        cache.load();

        // Dos horas: vigente para 6h, vencida para 30m
        assert!(cache.get_value(CacheTier::Streams, "old", Duration::from_secs(6 * 3600)).is_some());
        assert!(cache.get_value(CacheTier::Streams, "old", Duration::from_secs(1800)).is_none());
    }

    #[test]
    fn test_purge_keeps_entries_saved_by_another_process() {
        let dir = tempfile::tempdir().unwrap();
        let old = crate::cache::expiring::current_timestamp() - 7200.0;
        let contents = json!({ "streams": { "expired": ["https://old", old] } });
        fs::write(dir.path().join("server_cache.json"), contents.to_string()).unwrap();

        let sweeper = manager(&dir);
        sweeper.load();

        // El gateway guarda entradas nuevas después de que el barrido arrancó
        let gateway = manager(&dir);
        gateway.load();
        gateway.set(CacheTier::Metadata, "netease:1", &json!({"title": "晴天"})).unwrap();
        gateway.save().unwrap();

        let ttls = [(CacheTier::Streams, TTL), (CacheTier::Metadata, TTL)];
        assert_eq!(sweeper.purge_snapshot(&ttls).unwrap(), 1);

        let after = manager(&dir);
        after.load();
        assert_eq!(after.get_value(CacheTier::Streams, "expired", Duration::from_secs(365 * 24 * 3600)), None);
        assert_eq!(
            after.get_value(CacheTier::Metadata, "netease:1", TTL),
            Some(json!({"title": "晴天"}))
        );
    }

    #[test]
    fn test_purge_without_expired_entries_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let sweeper = manager(&dir);

        let gateway = manager(&dir);
        gateway.set(CacheTier::Streams, "stream_netease:1_320k", "https://a").unwrap();
        gateway.save().unwrap();
        let before = fs::read(dir.path().join("server_cache.json")).unwrap();

        assert_eq!(sweeper.purge_snapshot(&[(CacheTier::Streams, TTL)]).unwrap(), 0);
        assert_eq!(fs::read(dir.path().join("server_cache.json")).unwrap(), before);
    }
}
