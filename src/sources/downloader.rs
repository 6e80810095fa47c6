use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::error::{GatewayError, Result};

/// Cuerpo de una respuesta de audio, leído por trozos
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Obtiene los bytes de una URL de stream ya resuelta
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ByteStream>;
}

/// Descargador HTTP con timeouts de conexión y de lectura
pub struct HttpAudioFetcher {
    client: reqwest::Client,
}

impl HttpAudioFetcher {
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36")
            .build()
            .map_err(|e| GatewayError::Download(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.connect_timeout, config.download_timeout)
    }
}

#[async_trait]
impl AudioFetcher for HttpAudioFetcher {
    async fn fetch(&self, url: &str) -> Result<ByteStream> {
        debug!("⬇️ GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Download(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Download(format!("HTTP {}", status)));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| GatewayError::Download(e.to_string())))
            .boxed())
    }
}
