use std::fmt;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

use crate::cache::{keys, CacheTier};
use crate::gateway::Gateway;
use crate::sources::collection_id;

/// Resultado de un ciclo de refresco
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub invalidated: usize,
    pub refreshed: usize,
    pub failed: Vec<String>,
    pub listing_refreshed: bool,
}

impl fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} invalidated, {} refreshed, {} failed, listing {}",
            self.invalidated,
            self.refreshed,
            self.failed.len(),
            if self.listing_refreshed { "ok" } else { "failed" }
        )
    }
}

impl Gateway {
    /// Starts the periodic refresh loop. Calling it again does nothing.
    ///
    /// The loop wakes every `refresh_interval`, or early on
    /// [`Gateway::trigger_refresh_now`], and stops when the gateway closes.
    pub fn start_refresh(&self) {
        if self.inner.refresh_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let gateway = self.clone();
        let interval = self.inner.config.refresh_interval;
        info!(
            "🔄 Refresh scheduler started (every {})",
            humantime::format_duration(interval)
        );

        self.inner.tasks.spawn("refresh scheduler", async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = gateway.inner.refresh_signal.notified() => {
                        info!("🔄 Refresh requested");
                    }
                }

                let report = gateway.refresh_now().await;
                info!("🔄 Refresh cycle done: {}", report);
            }
        });
    }

    /// Wakes the scheduler for an immediate cycle. If the scheduler is busy
    /// the request is kept for its next wait.
    pub fn trigger_refresh_now(&self) {
        self.inner.refresh_signal.notify_one();
    }

    /// Runs one cycle in the caller's task: drops the allow-listed toplists
    /// and every filtered listing, resolves them again one by one, then
    /// saves the snapshot once.
    pub async fn refresh_now(&self) -> RefreshReport {
        let allowed = &self.inner.config.allowed_playlists;
        let cache = &self.inner.cache;
        let mut report = RefreshReport::default();

        let ids: Vec<String> = allowed
            .iter()
            .map(|(platform, id)| collection_id(platform, id))
            .collect();

        for id in &ids {
            if cache.invalidate(CacheTier::Playlists, &keys::playlist_detail(id)) {
                report.invalidated += 1;
            }
        }
        report.invalidated += cache.invalidate_prefix(CacheTier::Playlists, keys::FILTERED_PLAYLISTS_PREFIX);

        for id in ids {
            match self.playlist(&id).await {
                Ok(collection) => {
                    info!("✅ Refreshed {} ({} songs)", id, collection.items.len());
                    report.refreshed += 1;
                }
                Err(e) => {
                    warn!("⚠️ Refresh failed for {}: {}", id, e);
                    report.failed.push(id);
                }
            }
        }

        match self.playlists("all").await {
            Ok(listing) => {
                report.listing_refreshed = true;
                info!("✅ Refreshed listing ({} playlists)", listing.len());
            }
            Err(e) => warn!("⚠️ Listing refresh failed: {}", e),
        }

        self.persist().await;
        report
    }
}
