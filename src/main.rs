//! bch-paywatch: watches BCH addresses on a Fulcrum/Electrum indexer,
//! detects newly received outputs and applies payment bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

mod config;
mod electrum;
mod error;
mod monitor;
mod oracle;
mod qualify;
mod registry;
mod store;
#[cfg(test)]
mod testutil;

use config::Config;
use electrum::ElectrumClient;
use monitor::Monitor;
use oracle::PriceOracle;
use registry::AddressRegistry;
use store::{PaymentStore, PgStore};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cfg).await {
        tracing::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connecting to database")?;
    tracing::info!("✅ connected to database");

    let registry = Arc::new(AddressRegistry::new(pool.clone(), cfg.db_channel.clone()));
    let loaded = registry.load_all().await.context("loading watch table")?;
    tracing::info!("loaded {loaded} addresses from the watch table");

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    tasks.push(registry.start(stop_rx.clone()));

    let oracle = Arc::new(PriceOracle::new(reqwest::Client::new()));
    tasks.push(oracle.start(cfg.price_refresh_interval, stop_rx.clone()));

    let client = ElectrumClient::new(cfg.electrum.clone());
    client
        .connect()
        .await
        .context("connecting to electrum server")?;
    let client = Arc::new(RwLock::new(client));

    let store: Arc<dyn PaymentStore> = Arc::new(PgStore::new(pool.clone()));
    let monitor = Arc::new(Monitor::new(
        Arc::clone(&registry),
        Arc::clone(&client),
        store,
        oracle,
        cfg.sync_interval,
        cfg.ping_interval,
    ));
    tasks.extend(
        monitor
            .start(stop_rx)
            .await
            .context("starting address monitor")?,
    );

    tracing::info!(
        electrum = %format!("{}:{}", cfg.electrum.host, cfg.electrum.port),
        channel = %cfg.db_channel,
        "🔔 bch-paywatch running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("⏹️  shutdown signal received");

    let _ = stop_tx.send(true);
    client.write().await.disconnect().await;
    if tokio::time::timeout(SHUTDOWN_GRACE, future::join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!("background tasks did not stop in time, detaching them");
    }
    pool.close().await;
    tracing::info!("clean shutdown");
    Ok(())
}
