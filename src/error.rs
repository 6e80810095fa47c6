use std::path::PathBuf;
use thiserror::Error;

use crate::sources::UpstreamError;

/// Errores del núcleo de caché del gateway.
///
/// Only [`GatewayError::Upstream`] and [`GatewayError::MissingParameter`]
/// are meant to reach the protocol layer; everything else is recovered
/// locally (empty cache, redirect instead of a local file, skipped file).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("required parameter is missing: {0}")]
    MissingParameter(&'static str),

    #[error("invalid identifier '{0}'")]
    InvalidId(String),

    #[error("unknown platform '{0}'")]
    UnknownPlatform(String),

    #[error("unknown audio quality '{0}'")]
    UnknownQuality(String),

    #[error("corrupt snapshot at {path}: {reason}")]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("disk write failed for {asset}: {reason}")]
    DiskWrite { asset: String, reason: String },

    #[error("download failed: {0}")]
    Download(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// True for failures a later attempt may not repeat.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream(UpstreamError::Transient { .. }) | Self::Download(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
