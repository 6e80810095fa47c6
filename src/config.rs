use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::sources::{AudioQuality, Platform};

const SNAPSHOT_FILE: &str = "server_cache.json";

#[derive(Debug, Clone)]
pub struct Config {
    // Proveedores
    pub default_platform: Platform,
    pub default_quality: AudioQuality,
    pub search_platforms: Vec<Platform>,
    pub allowed_playlists: AllowList,

    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,

    // Caché
    pub audio_cache_max_size: u64, // bytes
    pub playlist_ttl: Duration,
    pub stream_url_ttl: Duration,
    pub metadata_ttl: Duration,
    pub refresh_interval: Duration,

    // Coalescing
    pub pending_poll_interval: Duration,
    pub pending_max_wait: Duration,

    // Red
    pub upstream_timeout: Duration,
    pub connect_timeout: Duration,
    pub download_timeout: Duration,

    // Rendimiento
    pub max_concurrent_downloads: usize,
    pub shutdown_grace: Duration,
    pub maintenance_interval: Duration,
    pub worker_threads: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            default_platform: std::env::var("DEFAULT_PLATFORM")
                .unwrap_or_else(|_| "netease".to_string())
                .parse()?,
            default_quality: std::env::var("DEFAULT_QUALITY")
                .unwrap_or_else(|_| "320k".to_string())
                .parse()?,
            search_platforms: parse_search_platforms(
                &std::env::var("SEARCH_PLATFORMS").unwrap_or_else(|_| "both".to_string()),
            )?,
            allowed_playlists: match std::env::var("ALLOWED_PLAYLISTS") {
                Ok(val) => val.parse()?,
                Err(_) => AllowList::default(),
            },

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "./cache/audio".to_string())
                .into(),

            audio_cache_max_size: std::env::var("AUDIO_CACHE_MAX_SIZE")
                .unwrap_or_else(|_| (10u64 * 1024 * 1024 * 1024).to_string()) // 10GB
                .parse::<u64>()
                .context("AUDIO_CACHE_MAX_SIZE must be a byte count")?,
            playlist_ttl: env_duration("PLAYLIST_TTL", "6h")?,
            stream_url_ttl: env_duration("STREAM_URL_TTL", "30m")?, // los enlaces del proveedor caducan
            metadata_ttl: env_duration("METADATA_TTL", "6h")?,
            refresh_interval: env_duration("REFRESH_INTERVAL", "6h")?,

            pending_poll_interval: env_duration("PENDING_POLL_INTERVAL", "500ms")?,
            pending_max_wait: env_duration("PENDING_MAX_WAIT", "20s")?,

            upstream_timeout: env_duration("UPSTREAM_TIMEOUT", "15s")?,
            connect_timeout: env_duration("CONNECT_TIMEOUT", "10s")?,
            download_timeout: env_duration("DOWNLOAD_TIMEOUT", "120s")?,

            max_concurrent_downloads: std::env::var("MAX_CONCURRENT_DOWNLOADS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()?,
            shutdown_grace: env_duration("SHUTDOWN_GRACE", "10s")?,
            maintenance_interval: env_duration("MAINTENANCE_INTERVAL", "5m")?,
            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => num_cpus::get(),
            },
        };

        // Create directories if they don't exist
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.cache_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Every TTL and interval must be non-zero
    /// - `pending_max_wait` must be strictly greater than `upstream_timeout`,
    ///   otherwise waiters give up on a resolver that is still within its
    ///   own timeout
    /// - The poll interval must be shorter than the wait budget
    /// - The disk budget and download concurrency must be > 0
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("PLAYLIST_TTL", self.playlist_ttl),
            ("STREAM_URL_TTL", self.stream_url_ttl),
            ("METADATA_TTL", self.metadata_ttl),
            ("REFRESH_INTERVAL", self.refresh_interval),
            ("PENDING_POLL_INTERVAL", self.pending_poll_interval),
            ("UPSTREAM_TIMEOUT", self.upstream_timeout),
            ("MAINTENANCE_INTERVAL", self.maintenance_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.pending_max_wait <= self.upstream_timeout {
            anyhow::bail!(
                "PENDING_MAX_WAIT ({:?}) must exceed UPSTREAM_TIMEOUT ({:?})",
                self.pending_max_wait,
                self.upstream_timeout
            );
        }

        if self.pending_poll_interval >= self.pending_max_wait {
            anyhow::bail!("PENDING_POLL_INTERVAL must be shorter than PENDING_MAX_WAIT");
        }

        if self.audio_cache_max_size == 0 {
            anyhow::bail!("AUDIO_CACHE_MAX_SIZE must be greater than 0");
        }

        if self.max_concurrent_downloads == 0 {
            anyhow::bail!("MAX_CONCURRENT_DOWNLOADS must be greater than 0");
        }

        if self.search_platforms.is_empty() {
            anyhow::bail!("SEARCH_PLATFORMS must name at least one platform");
        }

        Ok(())
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Providers: default {} @ {}, search {:?}\n  \
            Allow-list: {}\n  \
            Cache: playlists {}, streams {}, metadata {}, refresh every {}\n  \
            Disk: {} ({:.2} GB max)\n  \
            Coalescing: poll {}, max wait {}",
            self.default_platform,
            self.default_quality,
            self.search_platforms,
            self.allowed_playlists,
            humantime::format_duration(self.playlist_ttl),
            humantime::format_duration(self.stream_url_ttl),
            humantime::format_duration(self.metadata_ttl),
            humantime::format_duration(self.refresh_interval),
            self.cache_dir.display(),
            self.audio_cache_max_size as f64 / 1024.0 / 1024.0 / 1024.0,
            humantime::format_duration(self.pending_poll_interval),
            humantime::format_duration(self.pending_max_wait),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_platform: Platform::Netease,
            default_quality: AudioQuality::High,
            search_platforms: vec![Platform::Qq, Platform::Netease],
            allowed_playlists: AllowList::default(),

            data_dir: "./data".into(),
            cache_dir: "./cache/audio".into(),

            audio_cache_max_size: 10 * 1024 * 1024 * 1024, // 10GB
            playlist_ttl: Duration::from_secs(6 * 60 * 60),
            stream_url_ttl: Duration::from_secs(30 * 60),
            metadata_ttl: Duration::from_secs(6 * 60 * 60),
            refresh_interval: Duration::from_secs(6 * 60 * 60),

            pending_poll_interval: Duration::from_millis(500),
            pending_max_wait: Duration::from_secs(20),

            upstream_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(120),

            max_concurrent_downloads: 4,
            shutdown_grace: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(5 * 60),
            worker_threads: num_cpus::get(),
        }
    }
}

/// Playlists allowed per platform.
///
/// A platform with no entries contributes nothing to listings and is never
/// refreshed. Parsed from `platform:id,id;platform:id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList(BTreeMap<Platform, Vec<String>>);

impl AllowList {
    pub fn new(entries: impl IntoIterator<Item = (Platform, Vec<String>)>) -> Self {
        Self(entries.into_iter().collect())
    }

    pub fn ids(&self, platform: Platform) -> &[String] {
        self.0.get(&platform).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, platform: Platform, id: &str) -> bool {
        self.ids(platform).iter().any(|allowed| allowed == id)
    }

    /// Platforms with at least one allowed playlist.
    pub fn platforms(&self) -> impl Iterator<Item = Platform> + '_ {
        self.0
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(platform, _)| *platform)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Platform, &str)> + '_ {
        self.0
            .iter()
            .flat_map(|(platform, ids)| ids.iter().map(move |id| (*platform, id.as_str())))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new([
            (
                Platform::Netease,
                vec![
                    "19723756".to_string(),  // 飙升榜
                    "3778678".to_string(),   // 热歌榜
                    "991319590".to_string(), // 中文说唱榜
                    "60198".to_string(),     // Billboard
                ],
            ),
            (Platform::Qq, Vec::new()),
            (Platform::Kuwo, Vec::new()),
        ])
    }
}

impl std::str::FromStr for AllowList {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for section in s.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (platform, ids) = section
                .split_once(':')
                .with_context(|| format!("allow-list section '{}' lacks 'platform:'", section))?;
            let platform: Platform = platform.parse()?;
            let ids = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>();
            entries.entry(platform).or_insert_with(Vec::new).extend(ids);
        }

        Ok(Self(entries))
    }
}

impl std::fmt::Display for AllowList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sections = self
            .0
            .iter()
            .map(|(platform, ids)| format!("{}:{}", platform, ids.join(",")))
            .collect::<Vec<_>>();
        f.write_str(&sections.join(";"))
    }
}

fn env_duration(name: &str, default: &str) -> Result<Duration> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim()).with_context(|| format!("{} is not a valid duration: '{}'", name, raw))
}

fn parse_search_platforms(raw: &str) -> Result<Vec<Platform>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        // QQ primero
        "both" => Ok(vec![Platform::Qq, Platform::Netease]),
        other => other
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse().map_err(anyhow::Error::from))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_allow_list_parsing() {
        let list: AllowList = "netease:19723756, 3778678;qq:;kuwo:".parse().unwrap();

        assert_eq!(list.ids(Platform::Netease), ["19723756", "3778678"]);
        assert!(list.ids(Platform::Qq).is_empty());
        assert!(list.contains(Platform::Netease, "3778678"));
        assert!(!list.contains(Platform::Qq, "3778678"));
        assert_eq!(list.platforms().collect::<Vec<_>>(), vec![Platform::Netease]);
        assert_eq!(list.to_string(), "netease:19723756,3778678;qq:;kuwo:");
    }

    #[test]
    fn test_allow_list_rejects_unknown_platform() {
        assert!("spotify:1".parse::<AllowList>().is_err());
        assert!("19723756".parse::<AllowList>().is_err());
    }

    #[test]
    fn test_default_allow_list_only_netease() {
        let list = AllowList::default();
        assert_eq!(list.platforms().collect::<Vec<_>>(), vec![Platform::Netease]);
        assert_eq!(list.iter().count(), 4);
    }

    #[test]
    fn test_search_platforms() {
        assert_eq!(parse_search_platforms("both").unwrap(), vec![Platform::Qq, Platform::Netease]);
        assert_eq!(parse_search_platforms("netease").unwrap(), vec![Platform::Netease]);
        assert!(parse_search_platforms("youtube").is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_wait_budget_must_exceed_upstream_timeout() {
        let config = Config {
            pending_max_wait: Duration::from_secs(15),
            upstream_timeout: Duration::from_secs(15),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = Config {
            audio_cache_max_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
