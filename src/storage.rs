use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use regex::Regex;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};
use crate::sources::AudioQuality;

/// Sufijo de los archivos a medio escribir
pub const TEMP_SUFFIX: &str = ".tmp";

/// Límite de bytes de un nombre de archivo en ext4, btrfs y APFS
const MAX_FILE_NAME_BYTES: usize = 255;

static UNSAFE_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[\\/:*?"<>|\x00-\x1f]"#).expect("static pattern is valid")
});

/// Título y artista usados para decorar el nombre del archivo
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetLabel {
    pub artist: String,
    pub title: String,
}

impl AssetLabel {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
        }
    }

    /// `None` when there is nothing meaningful to decorate with. The label
    /// part is cut so that the name plus [`TEMP_SUFFIX`] fits in one path
    /// component.
    fn decorate(&self, stem: &str, ext: &str) -> Option<String> {
        let artist = sanitize(&self.artist);
        let title = sanitize(&self.title);
        if artist.is_empty() || title.is_empty() {
            return None;
        }

        let tail = format!(" [{}].{}", stem, ext);
        let budget = MAX_FILE_NAME_BYTES.checked_sub(tail.len() + TEMP_SUFFIX.len())?;
        let label = format!("{} - {}", artist, title);
        let label = truncate_on_char_boundary(&label, budget)
            .trim_end()
            .trim_end_matches('.');
        if label.is_empty() {
            return None;
        }
        Some(format!("{}{}", label, tail))
    }
}

fn sanitize(raw: &str) -> String {
    UNSAFE_CHARS.replace_all(raw, "_").trim().trim_matches('.').to_string()
}

fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `"X - Y [stem].ext"` → `"stem.ext"`.
fn stable_name_of_decorated(name: &str) -> Option<String> {
    let open = name.rfind(" [")?;
    let (stem, ext) = name[open + 2..].split_once("].")?;
    if stem.is_empty() || ext.is_empty() || ext.contains(['[', ']']) {
        return None;
    }
    Some(format!("{}.{}", stem, ext))
}

fn is_temp(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.ends_with(TEMP_SUFFIX))
}

fn with_temp_suffix(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Almacén de audio descargado con presupuesto de bytes.
///
/// Assets are only ever created by renaming a finished temp file, so any
/// non-temp file in the directory is complete. Eviction is by mtime, oldest
/// first. Decorated names are kept in an index keyed by stable name, filled
/// on open and on each write, so lookups never list the directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    max_bytes: u64,
    decorated: Arc<DashMap<String, PathBuf>>,
}

impl DiskStore {
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let store = Self {
            root,
            max_bytes,
            decorated: Arc::new(DashMap::new()),
        };
        for file in store.scan().await.into_iter().filter(|f| !f.temp) {
            store.index(&file.path);
        }

        info!(
            "📁 Audio store inicializado en: {} ({} decorated names)",
            store.root.display(),
            store.decorated.len()
        );
        Ok(store)
    }

    fn index(&self, path: &Path) {
        let key = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(stable_name_of_decorated);
        if let Some(key) = key {
            self.decorated.insert(key, path.to_path_buf());
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// `{safe_id}_{quality}`, with `:` and `/` replaced by `_`.
    pub fn stable_stem(source_id: &str, quality: AudioQuality) -> String {
        let safe_id = source_id.replace([':', '/'], "_");
        format!("{}_{}", safe_id, quality)
    }

    pub fn stable_name(source_id: &str, quality: AudioQuality) -> String {
        format!("{}.{}", Self::stable_stem(source_id, quality), quality.extension())
    }

    /// Path of the finished, non-empty asset, plain or decorated. Temp files
    /// never match.
    pub async fn path(&self, source_id: &str, quality: AudioQuality) -> Option<PathBuf> {
        let name = Self::stable_name(source_id, quality);
        let stable = self.root.join(&name);
        if is_non_empty_file(&stable).await {
            return Some(stable);
        }

        let decorated = self.decorated.get(&name).map(|entry| entry.value().clone())?;
        if is_non_empty_file(&decorated).await {
            return Some(decorated);
        }

        // Borrado por el desalojo o desde fuera
        self.decorated.remove_if(&name, |_, indexed| *indexed == decorated);
        None
    }

    pub async fn has(&self, source_id: &str, quality: AudioQuality) -> bool {
        self.path(source_id, quality).await.is_some()
    }

    /// Streams `body` into `<final>.tmp` and renames it into place once the
    /// stream ends. A failing stream leaves the temp file behind and no
    /// asset. Enforces the budget after a successful write.
    pub async fn write<S, E>(
        &self,
        source_id: &str,
        quality: AudioQuality,
        label: Option<&AssetLabel>,
        body: S,
    ) -> Result<PathBuf>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let stem = Self::stable_stem(source_id, quality);
        let name = label
            .and_then(|label| label.decorate(&stem, quality.extension()))
            .unwrap_or_else(|| Self::stable_name(source_id, quality));

        let final_path = self.root.join(&name);
        let temp_path = with_temp_suffix(&final_path);

        let written = self
            .stream_to_file(&temp_path, body)
            .await
            .map_err(|reason| GatewayError::DiskWrite {
                asset: name.clone(),
                reason,
            })?;

        if written == 0 {
            if let Err(e) = fs::remove_file(&temp_path).await {
                warn!("⚠️ No se pudo borrar {}: {}", temp_path.display(), e);
            }
            return Err(GatewayError::DiskWrite {
                asset: name,
                reason: "empty body".to_string(),
            });
        }

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| GatewayError::DiskWrite {
                asset: name.clone(),
                reason: e.to_string(),
            })?;

        self.index(&final_path);
        info!("💾 Audio guardado: {} ({:.2} MB)", name, written as f64 / 1_048_576.0);

        self.enforce_budget(self.max_bytes).await;
        Ok(final_path)
    }

    async fn stream_to_file<S, E>(&self, temp_path: &Path, body: S) -> std::result::Result<u64, String>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let mut file = fs::File::create(temp_path).await.map_err(|e| e.to_string())?;
        let mut written = 0u64;

        futures::pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(|e| e.to_string())?;
        file.sync_all().await.map_err(|e| e.to_string())?;
        Ok(written)
    }

    /// Deletes the oldest finished assets until the directory fits in
    /// `max_bytes`. Temp files count toward the total but are never deleted
    /// here.
    pub async fn enforce_budget(&self, max_bytes: u64) -> EvictionReport {
        let files = self.scan().await;
        let mut report = EvictionReport {
            scanned: files.len(),
            total_before: files.iter().map(|f| f.size).sum(),
            ..Default::default()
        };
        let mut total = report.total_before;

        if total <= max_bytes {
            report.total_after = total;
            return report;
        }

        let mut candidates: Vec<_> = files.into_iter().filter(|f| !f.temp).collect();
        candidates.sort_by_key(|f| f.modified);

        for file in candidates {
            if total <= max_bytes {
                break;
            }
            match fs::remove_file(&file.path).await {
                Ok(()) => {
                    self.decorated.retain(|_, indexed| *indexed != file.path);
                    total = total.saturating_sub(file.size);
                    report.deleted += 1;
                    report.freed_bytes += file.size;
                    debug!("🗑️ Evicted {}", file.path.display());
                }
                Err(e) => {
                    error!("❌ Error deleting {}: {}", file.path.display(), e);
                    report.failed += 1;
                }
            }
        }

        report.total_after = total;
        info!("🧹 Audio cache cleanup: {}", report);
        report
    }

    /// Removes temp files not touched for at least `min_age`.
    pub async fn remove_orphaned_temp_files(&self, min_age: Duration) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;

        for file in self.scan().await.into_iter().filter(|f| f.temp) {
            let age = now.duration_since(file.modified).unwrap_or_default();
            if age < min_age {
                continue;
            }
            match fs::remove_file(&file.path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("⚠️ No se pudo borrar {}: {}", file.path.display(), e),
            }
        }

        if removed > 0 {
            info!("🧹 Removed {} orphaned temp files", removed);
        }
        removed
    }

    /// Obtiene estadísticas del almacén
    pub async fn stats(&self) -> StorageStats {
        let files = self.scan().await;
        StorageStats {
            assets: files.iter().filter(|f| !f.temp).count(),
            temp_files: files.iter().filter(|f| f.temp).count(),
            total_size_bytes: files.iter().map(|f| f.size).sum(),
            max_bytes: self.max_bytes,
            root: self.root.clone(),
        }
    }

    async fn scan(&self) -> Vec<StoredFile> {
        let mut files = Vec::new();

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                error!("❌ Error listing {}: {}", self.root.display(), e);
                return files;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("⚠️ Error listing {}: {}", self.root.display(), e);
                    break;
                }
            };

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    warn!("⚠️ Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };

            let path = entry.path();
            files.push(StoredFile {
                temp: is_temp(&path),
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            });
        }

        files
    }
}

async fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map_or(false, |m| m.is_file() && m.len() > 0)
}

struct StoredFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
    temp: bool,
}

/// Resultado de una pasada de desalojo
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
    pub freed_bytes: u64,
    pub total_before: u64,
    pub total_after: u64,
}

impl std::fmt::Display for EvictionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "deleted {} of {} files, freed {:.2} MB ({:.2} MB remaining)",
            self.deleted,
            self.scanned,
            self.freed_bytes as f64 / 1_048_576.0,
            self.total_after as f64 / 1_048_576.0
        )
    }
}

/// Estadísticas de almacenamiento
#[derive(Debug)]
pub struct StorageStats {
    pub assets: usize,
    pub temp_files: usize,
    pub total_size_bytes: u64,
    pub max_bytes: u64,
    pub root: PathBuf,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "📊 Storage Stats:\n\
             📁 Audio Directory: {}\n\
             🎵 Assets: {} files\n\
             ⏳ Temp Files: {}\n\
             📦 Total Size: {:.2} MB of {:.2} MB",
            self.root.display(),
            self.assets,
            self.temp_files,
            self.total_size_bytes as f64 / 1_048_576.0,
            self.max_bytes as f64 / 1_048_576.0
        )
    }
}
