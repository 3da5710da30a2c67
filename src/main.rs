use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use curator::plugin::PluginSet;
use curator::query::HttpQueryClient;
use curator::sink::KvDelivery;
use curator::storage::{FileFragmentStore, KvStore};
use curator::{Coordinator, CuratorConfig};

const KV_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("invalid log filter")?;
    fmt().with_env_filter(filter).init();

    let config = CuratorConfig::from_env().context("invalid configuration")?;

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "Curator starting: RUST_LOG='{}', agent='{}', agora={}, provider={}, tick={:?}, min_sync={:?}, pool={}, data_dir='{}'",
        rust_log,
        config.agent_id,
        config.agora.base_url(),
        config.provider.base_url(),
        config.tick(),
        config.min_sync(),
        config.pool_size(),
        config.data_dir
    );

    let data_dir = PathBuf::from(&config.data_dir);
    let kv = KvStore::persistent(
        data_dir.join("kv").join("snapshot.bin"),
        config.kv_snapshot_interval_ms.map(Duration::from_millis),
    )
    .context("cannot open shared store snapshot")?;
    info!(target: "startup", "Shared store loaded with {} keys", kv.len());

    let store = FileFragmentStore::new(&data_dir)?;
    let query = HttpQueryClient::new(config.agora.clone(), config.provider.clone(), config.collectors);
    let delivery = KvDelivery::new(kv.clone(), curator::keys::FragmentKeys::new(&config.agent_id));

    let coordinator = Coordinator::new(
        config,
        kv.clone(),
        Arc::new(store),
        Arc::new(query),
        Arc::new(delivery),
        PluginSet::new(),
    )?;

    {
        let kv = kv.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(KV_SWEEP_INTERVAL).await;
                let n = kv.sweep();
                if n > 0 {
                    tracing::debug!(target: "kv", "swept {} expired keys", n);
                }
            }
        });
    }

    let scheduler = coordinator.scheduler();
    scheduler.startup();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let running = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await.context("cannot listen for shutdown signal")?;
    info!(target: "startup", "Shutdown requested");
    let _ = shutdown_tx.send(true);
    if let Err(e) = running.await {
        warn!(target: "startup", "scheduler ended abnormally: {}", e);
    }

    kv.save_snapshot().context("cannot write shared store snapshot")?;
    let m = curator::metrics::snapshot();
    info!(
        target: "startup",
        "Curator stopped: {} collections completed, {} failed, {} rows appended",
        m.collections_completed, m.collections_failed, m.rows_appended
    );
    Ok(())
}
