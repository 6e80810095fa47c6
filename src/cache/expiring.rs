use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::{collections::HashMap, time::Duration};
use tracing::debug;

/// Entrada de caché con su marca de escritura.
///
/// The TTL is not stored: every read supplies its own, so one entry can be
/// fresh for one caller and stale for another. On disk an entry is the pair
/// `[value, written_at]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    /// Unix seconds, fractional.
    pub written_at: f64,
}

impl CacheEntry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            written_at: current_timestamp(),
        }
    }

    pub fn with_timestamp(value: Value, written_at: f64) -> Self {
        Self { value, written_at }
    }

    pub fn is_expired(&self, ttl: Duration, now: f64) -> bool {
        now - self.written_at >= ttl.as_secs_f64()
    }
}

impl Serialize for CacheEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.value, self.written_at).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CacheEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (value, written_at) = <(Value, f64)>::deserialize(deserializer)?;
        Ok(Self { value, written_at })
    }
}

/// Un espacio de nombres de la caché: clave -> entrada.
///
/// Not synchronized on its own; [`super::CacheManager`] keeps every tier
/// behind one lock.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(transparent)]
pub struct ExpiringCache {
    entries: HashMap<String, CacheEntry>,
}

impl ExpiringCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value if it is younger than `ttl`.
    ///
    /// An entry found expired is removed before returning `None`.
    pub fn get(&mut self, key: &str, ttl: Duration) -> Option<&Value> {
        let now = current_timestamp();
        let expired = self.entries.get(key)?.is_expired(ttl, now);

        if expired {
            self.entries.remove(key);
            debug!("⏰ Entrada expirada removida: {}", key);
            return None;
        }

        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), CacheEntry::new(value));
    }

    pub fn insert_entry(&mut self, key: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before - self.entries.len()
    }

    /// Limpia entradas expiradas y retorna el número de elementos removidos
    pub fn cleanup_expired(&mut self, ttl: Duration) -> usize {
        let now = current_timestamp();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(ttl, now));
        before - self.entries.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Obtiene timestamp actual en segundos (con fracción)
pub(crate) fn current_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ttl_is_chosen_by_reader() {
        let mut cache = ExpiringCache::new();
        cache.insert("k", json!("v"));

        let short = Duration::from_millis(60);
        let long = Duration::from_secs(30);

        assert_eq!(cache.get("k", short), Some(&json!("v")));

        std::thread::sleep(Duration::from_millis(100));

        // El lector con TTL largo todavía la ve...
        assert_eq!(cache.get("k", long), Some(&json!("v")));
        // ...el de TTL corto no, y la desaloja.
        assert_eq!(cache.get("k", short), None);
        assert!(!cache.contains_key("k"));
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let entry = CacheEntry::with_timestamp(json!(1), 100.0);
        assert!(!entry.is_expired(Duration::from_secs(10), 109.5));
        assert!(entry.is_expired(Duration::from_secs(10), 110.0));
    }

    #[test]
    fn test_cleanup_expired() {
        let mut cache = ExpiringCache::new();
        let now = current_timestamp();
        cache.insert_entry("old", CacheEntry::with_timestamp(json!(1), now - 3600.0));
        cache.insert_entry("new", CacheEntry::with_timestamp(json!(2), now));

        assert_eq!(cache.cleanup_expired(Duration::from_secs(60)), 1);
        assert!(cache.contains_key("new"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_prefix() {
        let mut cache = ExpiringCache::new();
        cache.insert("playlists_filtered_all", json!([]));
        cache.insert("playlists_filtered_netease", json!([]));
        cache.insert("playlist_detail_netease_1", json!({}));

        assert_eq!(cache.remove_prefix("playlists_filtered_"), 2);
        assert!(cache.contains_key("playlist_detail_netease_1"));
    }

    #[test]
    fn test_entry_is_stored_as_value_timestamp_pair() {
        let entry = CacheEntry::with_timestamp(json!({"id": "netease:1"}), 1700000000.5);
        let encoded = serde_json::to_value(&entry).unwrap();
        assert_eq!(encoded, json!([{"id": "netease:1"}, 1700000000.5]));

        let decoded: CacheEntry = serde_json::from_value(json!(["url", 12.0])).unwrap();
        assert_eq!(decoded.value, json!("url"));
        assert!(serde_json::from_value::<CacheEntry>(json!({"url": 1})).is_err());
    }
}
