//! Service entrypoint: storage bootstrap, metrics exporter and the
//! background maintenance loop. View-syncer instances themselves are
//! spawned by the embedding transport layer through
//! [`zync_syncer::view_syncer::ViewSyncer`].

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use zync_syncer::config::SyncerArgs;
use zync_syncer::metrics;
use zync_storage::postgres;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = SyncerArgs::parse();

    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .context("invalid metrics address")?;
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("failed to install prometheus exporter")?;

    postgres::run_migrations(&args.database_url).context("failed to run CVR migrations")?;
    let pool = postgres::connection_pool(&args.database_url, args.max_pool_size)
        .context("failed to build CVR pool")?;
    info!(pool_size = args.max_pool_size, "CVR store ready");

    // Periodically collect client groups that have gone quiet.
    let gc_pool = pool.clone();
    let horizon = chrono::Duration::hours(args.inactivity_horizon_hours as i64);
    let mut gc_tick =
        tokio::time::interval(Duration::from_secs(args.gc_interval_minutes * 60));
    let gc = tokio::spawn(async move {
        loop {
            gc_tick.tick().await;
            let cutoff = chrono::Utc::now().naive_utc() - horizon;
            match postgres::delete_inactive_groups(&gc_pool, cutoff).await {
                Ok(0) => {}
                Ok(collected) => {
                    metrics::groups_collected(collected);
                    info!(collected, "collected inactive client groups");
                }
                Err(err) => error!(%err, "client group collection failed"),
            }
        }
    });

    info!("zync view-syncer ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    gc.abort();
    Ok(())
}
