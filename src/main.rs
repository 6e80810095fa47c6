use anyhow::{bail, Context, Result};
use std::time::Duration;
use tracing::{error, info, warn};

use tunehub_gateway::cache::{CacheManager, CacheSettings, CacheTier};
use tunehub_gateway::config::Config;
use tunehub_gateway::storage::DiskStore;

/// Archivos temporales más viejos que esto se consideran huérfanos
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tunehub_gateway=debug".parse()?),
        )
        .init();

    // Cargar configuración
    let config = Config::load()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }
    if args.iter().any(|arg| arg == "--stats") {
        return stats(&config).await;
    }
    if args.iter().any(|arg| arg == "--sweep") {
        return sweep(&config).await;
    }
    if let Some(unknown) = args.iter().find(|arg| arg.starts_with("--")) {
        bail!("unknown flag '{}' (expected --health-check, --stats or --sweep)", unknown);
    }

    info!("🎵 Iniciando TuneHub gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("{}", config.summary());

    maintenance_daemon(config).await
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar que los directorios existen y se pueden escribir
    for dir in [&config.data_dir, &config.cache_dir] {
        let check_file = dir.join(".health-check");
        tokio::fs::write(&check_file, b"ok")
            .await
            .with_context(|| format!("{} is not writable", dir.display()))?;
        tokio::fs::remove_file(&check_file).await?;
    }

    println!("OK");
    Ok(())
}

async fn stats(config: &Config) -> Result<()> {
    let cache = CacheManager::open(CacheSettings::from_config(config));
    let store = DiskStore::open(&config.cache_dir, config.audio_cache_max_size).await?;

    println!("📦 Cache Stats:");
    for tier in CacheTier::ALL {
        println!("   {}: {} entries", tier, cache.len(tier));
    }
    println!("{}", store.stats().await);
    Ok(())
}

async fn sweep(config: &Config) -> Result<()> {
    let store = DiskStore::open(&config.cache_dir, config.audio_cache_max_size).await?;

    let report = store.enforce_budget(config.audio_cache_max_size).await;
    let removed = store.remove_orphaned_temp_files(STALE_TEMP_AGE).await;

    println!("🧹 {}; {} orphaned temp files removed", report, removed);
    Ok(())
}

/// Limpieza periódica hasta recibir Ctrl+C. El snapshot pertenece al
/// gateway: solo se reescribe cuando el barrido quitó algo
async fn maintenance_daemon(config: Config) -> Result<()> {
    let cache = CacheManager::new(CacheSettings::from_config(&config));
    let store = DiskStore::open(&config.cache_dir, config.audio_cache_max_size).await?;

    let mut ticker = tokio::time::interval(config.maintenance_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        "🚀 Maintenance daemon running (every {})",
        humantime::format_duration(config.maintenance_interval)
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => run_maintenance(&config, &cache, &store).await,
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!("❌ Error al registrar Ctrl+C: {}", e);
                }
                info!("⚠️ Señal de shutdown recibida, cerrando...");
                break;
            }
        }
    }

    info!("👋 Maintenance daemon stopped");
    Ok(())
}

async fn run_maintenance(config: &Config, cache: &CacheManager, store: &DiskStore) {
    store.enforce_budget(config.audio_cache_max_size).await;
    store.remove_orphaned_temp_files(STALE_TEMP_AGE).await;

    let cache = cache.clone();
    let ttls = [
        (CacheTier::Playlists, config.playlist_ttl),
        (CacheTier::Streams, config.stream_url_ttl),
        (CacheTier::Metadata, config.metadata_ttl),
    ];

    match tokio::task::spawn_blocking(move || cache.purge_snapshot(&ttls)).await {
        Ok(Ok(0)) => {}
        Ok(Ok(purged)) => info!("🧹 Purged {} expired cache entries from the snapshot", purged),
        Ok(Err(e)) => warn!("⚠️ Error saving cache snapshot: {}", e),
        Err(e) => error!("❌ Snapshot task failed: {}", e),
    }
}
