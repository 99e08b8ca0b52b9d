//! Service configuration.

use clap::Parser;
use std::time::Duration;
use zync_storage::postgres::PgCvrStoreConfig;

use crate::view_syncer::ViewSyncerConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "zync-syncer", about = "zync view-syncer service")]
pub struct SyncerArgs {
    /// Postgres URL of the CVR database.
    #[arg(long, env = "ZYNC_DATABASE_URL")]
    pub database_url: String,

    /// Maximum connections in the CVR pool.
    #[arg(long, env = "ZYNC_MAX_POOL_SIZE", default_value_t = 10)]
    pub max_pool_size: usize,

    /// Row batches larger than this are flushed write-back.
    #[arg(long, env = "ZYNC_DEFERRED_FLUSH_THRESHOLD", default_value_t = 100)]
    pub deferred_flush_threshold: usize,

    /// Page size for the initial row-record load.
    #[arg(long, env = "ZYNC_ROW_LOAD_PAGE_SIZE", default_value_t = 10_000)]
    pub row_load_page_size: usize,

    /// How long catch-up readers wait for the row flusher, in
    /// milliseconds.
    #[arg(long, env = "ZYNC_ROW_FLUSH_WAIT_MS", default_value_t = 5_000)]
    pub row_flush_wait_ms: u64,

    /// Share of the total hydration time an advance may burn before the
    /// circuit breaker trips.
    #[arg(long, env = "ZYNC_ADVANCE_BREAKER_RATIO", default_value_t = 0.5)]
    pub advance_breaker_ratio: f64,

    /// Lease renewal interval in seconds.
    #[arg(long, env = "ZYNC_LEASE_RENEWAL_SECS", default_value_t = 60)]
    pub lease_renewal_secs: u64,

    /// Output buffer per client channel.
    #[arg(long, env = "ZYNC_CLIENT_BUFFER", default_value_t = 64)]
    pub client_channel_buffer: usize,

    /// Client groups idle for longer than this many hours are garbage
    /// collected.
    #[arg(long, env = "ZYNC_INACTIVITY_HORIZON_HOURS", default_value_t = 24 * 30)]
    pub inactivity_horizon_hours: u64,

    /// Interval between garbage collection sweeps, in minutes.
    #[arg(long, env = "ZYNC_GC_INTERVAL_MINUTES", default_value_t = 60)]
    pub gc_interval_minutes: u64,

    /// Bind address of the prometheus exporter.
    #[arg(long, env = "ZYNC_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: String,
}

impl SyncerArgs {
    pub fn store_config(&self) -> PgCvrStoreConfig {
        PgCvrStoreConfig {
            deferred_flush_threshold: self.deferred_flush_threshold,
            flush_wait_timeout: Duration::from_millis(self.row_flush_wait_ms),
            row_load_page_size: self.row_load_page_size,
        }
    }

    pub fn view_syncer_config(&self) -> ViewSyncerConfig {
        ViewSyncerConfig {
            advance_breaker_ratio: self.advance_breaker_ratio,
            client_channel_buffer: self.client_channel_buffer,
            lease_renewal_interval: Duration::from_secs(self.lease_renewal_secs),
        }
    }
}
