//! # Sources
//!
//! Canonical shapes shared by every upstream provider and the seam through
//! which the gateway talks to them.
//!
//! The field-level mapping of each provider (netease, qq, kuwo) lives in the
//! protocol layer. This module only fixes what that layer must hand back: a
//! [`CanonicalItem`] or [`CanonicalCollection`], or an [`UpstreamError`] that
//! says whether the attempt may be retried.

pub mod downloader;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

use crate::error::GatewayError;

pub use downloader::{AudioFetcher, ByteStream, HttpAudioFetcher};

/// Proveedores de música soportados
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Netease,
    Qq,
    Kuwo,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Netease, Platform::Qq, Platform::Kuwo];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Netease => "netease",
            Platform::Qq => "qq",
            Platform::Kuwo => "kuwo",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "netease" => Ok(Platform::Netease),
            "qq" => Ok(Platform::Qq),
            "kuwo" => Ok(Platform::Kuwo),
            other => Err(GatewayError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Calidad de audio solicitada al proveedor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioQuality {
    #[serde(rename = "128k")]
    Standard,
    #[serde(rename = "320k")]
    High,
    #[serde(rename = "flac")]
    Lossless,
    #[serde(rename = "flac24bit")]
    HiRes,
}

impl AudioQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioQuality::Standard => "128k",
            AudioQuality::High => "320k",
            AudioQuality::Lossless => "flac",
            AudioQuality::HiRes => "flac24bit",
        }
    }

    /// File extension of a downloaded asset at this quality.
    pub fn extension(&self) -> &'static str {
        match self {
            AudioQuality::Lossless | AudioQuality::HiRes => "flac",
            AudioQuality::Standard | AudioQuality::High => "mp3",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioQuality::Lossless | AudioQuality::HiRes => "audio/flac",
            AudioQuality::Standard | AudioQuality::High => "audio/mpeg",
        }
    }

    /// Maps a client `maxBitRate` (kbps) to a quality.
    ///
    /// `None` or `0` means "no limit" and yields `default`.
    pub fn from_max_bit_rate(max_bit_rate: Option<u32>, default: AudioQuality) -> AudioQuality {
        match max_bit_rate {
            None | Some(0) => default,
            Some(1..=128) => AudioQuality::Standard,
            Some(129..=320) => AudioQuality::High,
            Some(_) => AudioQuality::Lossless,
        }
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioQuality {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "128k" => Ok(AudioQuality::Standard),
            "320k" => Ok(AudioQuality::High),
            "flac" => Ok(AudioQuality::Lossless),
            "flac24bit" => Ok(AudioQuality::HiRes),
            other => Err(GatewayError::UnknownQuality(other.to_string())),
        }
    }
}

/// Canción normalizada, independiente del proveedor.
///
/// The serialized field names match what the outward protocol layer and
/// older snapshot files use (`coverUrl`, `duration` in seconds).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub cover_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lyrics: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl CanonicalItem {
    /// Stand-in returned before a song has ever been resolved.
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            title: "Loading...".to_string(),
            artist: "Loading...".to_string(),
            ..Self::default()
        }
    }

    pub fn has_lyrics(&self) -> bool {
        self.lyrics.as_deref().is_some_and(|l| !l.is_empty())
    }

    pub fn has_cover(&self) -> bool {
        !self.cover_url.is_empty()
    }

    /// Rewrites a plain-http cover URL to https.
    pub fn with_https_cover(mut self) -> Self {
        self.cover_url = upgrade_to_https(&self.cover_url);
        self
    }
}

/// Lista de reproducción (toplist) normalizada
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalCollection {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cover_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub track_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub items: Vec<CanonicalItem>,
}

/// Result of the metered "parse" call: where to stream from, plus what the
/// provider told us about the song on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackResolution {
    pub url: String,
    pub item: CanonicalItem,
}

/// Failure of a single upstream attempt. Never cached.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpstreamError {
    #[error("{platform} upstream failed: {reason}")]
    Transient { platform: Platform, reason: String },

    #[error("{0} not found or not available")]
    NotFound(String),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Normalizador de fuentes: convierte las respuestas de cada proveedor en
/// la forma canónica que guarda la caché.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceNormalizer: Send + Sync {
    /// Toplists published by a provider, with provider-native ids.
    async fn resolve_collection_list(&self, platform: Platform) -> UpstreamResult<Vec<CanonicalCollection>>;

    /// One toplist with its songs embedded.
    async fn resolve_collection_items(
        &self,
        platform: Platform,
        collection_id: &str,
    ) -> UpstreamResult<CanonicalCollection>;

    async fn resolve_search(&self, platform: Platform, query: &str) -> UpstreamResult<Vec<CanonicalItem>>;

    /// Metered call: costs one upstream credit per invocation.
    async fn resolve_playback_url(
        &self,
        platform: Platform,
        item_id: &str,
        quality: AudioQuality,
    ) -> UpstreamResult<PlaybackResolution>;

    /// Lyrics for a song. Providers without a dedicated endpoint fall back
    /// to the lyrics carried by a playback resolution.
    async fn resolve_lyrics(&self, platform: Platform, item_id: &str) -> UpstreamResult<Option<String>> {
        let resolution = self
            .resolve_playback_url(platform, item_id, AudioQuality::High)
            .await?;
        Ok(resolution.item.lyrics.filter(|l| !l.is_empty()))
    }
}

/// Splits a song id of the form `platform:songId`.
///
/// Ids without a prefix belong to `default`.
pub fn parse_item_id(id: &str, default: Platform) -> Result<(Platform, &str), GatewayError> {
    split_id(id, ':', default)
}

/// Splits a playlist id of the form `platform_toplistId`.
pub fn parse_collection_id(id: &str, default: Platform) -> Result<(Platform, &str), GatewayError> {
    split_id(id, '_', default)
}

pub fn collection_id(platform: Platform, id: &str) -> String {
    format!("{}_{}", platform, id)
}

fn split_id(id: &str, separator: char, default: Platform) -> Result<(Platform, &str), GatewayError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(GatewayError::InvalidId(id.to_string()));
    }

    match id.split_once(separator) {
        Some((platform, rest)) if !rest.is_empty() => Ok((platform.parse()?, rest)),
        Some(_) => Err(GatewayError::InvalidId(id.to_string())),
        None => Ok((default, id)),
    }
}

pub(crate) fn upgrade_to_https(cover_url: &str) -> String {
    match url::Url::parse(cover_url) {
        Ok(mut parsed) if parsed.scheme() == "http" => {
            if parsed.set_scheme("https").is_ok() {
                parsed.to_string()
            } else {
                cover_url.to_string()
            }
        }
        _ => cover_url.to_string(),
    }
}
