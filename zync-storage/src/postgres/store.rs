//! The assembled postgres CVR store: metadata gateway + row-record cache.

use super::cvr::CvrGateway;
use super::rows::{PgRowsGateway, RowsGateway};
use crate::cache::{CacheConfig, FailCallback, RowRecordCache};
use async_trait::async_trait;
use chrono::Utc;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::AsyncPgConnection;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use zync_core::models::cvr::{CvrFlush, CvrSnapshot};
use zync_core::models::row::RowRecord;
use zync_core::models::version::CvrVersion;
use zync_core::storage::{CvrStore, StorageError, StoredPermissions};
use zync_core::{ClientGroupId, QueryHash};

#[derive(Clone, Debug)]
pub struct PgCvrStoreConfig {
    /// Row batches larger than this are committed write-back.
    pub deferred_flush_threshold: usize,
    /// Bound on catch-up readers waiting for the rows version.
    pub flush_wait_timeout: Duration,
    /// Page size for the initial row-record load.
    pub row_load_page_size: usize,
}

impl Default for PgCvrStoreConfig {
    fn default() -> Self {
        Self {
            deferred_flush_threshold: 100,
            flush_wait_timeout: Duration::from_secs(5),
            row_load_page_size: 10_000,
        }
    }
}

/// Postgres-backed [`CvrStore`] for one client group.
pub struct PgCvrStore {
    group: ClientGroupId,
    gateway: CvrGateway,
    cache: RowRecordCache<PgRowsGateway>,
}

impl PgCvrStore {
    /// Builds the store for `group`, reading the currently persisted rows
    /// version to seed the consistency watermark.
    pub async fn connect(
        pool: Pool<AsyncPgConnection>,
        group: ClientGroupId,
        config: PgCvrStoreConfig,
        fail: FailCallback,
    ) -> Result<Self, StorageError> {
        let rows_gateway = Arc::new(PgRowsGateway::new(pool.clone()));
        let initial_version = rows_gateway
            .rows_version(&group)
            .await?
            .unwrap_or_else(CvrVersion::initial);
        let cache = RowRecordCache::new(
            rows_gateway,
            group.clone(),
            CacheConfig {
                deferred_flush_threshold: config.deferred_flush_threshold,
                flush_wait_timeout: config.flush_wait_timeout,
            },
            initial_version,
            fail,
        );
        let gateway = CvrGateway::new(pool, config.row_load_page_size);
        Ok(Self { group, gateway, cache })
    }
}

#[async_trait]
impl CvrStore for PgCvrStore {
    fn group_id(&self) -> &ClientGroupId {
        &self.group
    }

    async fn load(&self) -> Result<CvrSnapshot, StorageError> {
        self.gateway
            .load_cvr(&self.group, Utc::now().naive_utc())
            .await
    }

    async fn load_row_records(&self) -> Result<Vec<RowRecord>, StorageError> {
        self.gateway.load_row_records(&self.group).await
    }

    async fn flush(&self, flush: CvrFlush) -> Result<(), StorageError> {
        let version = flush.version.clone();
        let rows: Vec<RowRecord> = flush.rows.values().cloned().collect();
        self.gateway.flush_metadata(&flush).await?;
        self.cache.apply(version, rows).await?;
        Ok(())
    }

    fn has_pending_row_updates(&self) -> bool {
        self.cache.has_pending_updates()
    }

    async fn await_consistent(&self, version: &CvrVersion) -> Result<(), StorageError> {
        self.cache.await_consistent(version).await
    }

    async fn catchup_row_records(
        &self,
        after: &CvrVersion,
        up_to: &CvrVersion,
        exclude_hashes: &BTreeSet<QueryHash>,
    ) -> Result<Vec<RowRecord>, StorageError> {
        // Catch-up reads the persisted rows table; wait for the flusher to
        // reach the window's upper bound first.
        self.cache.await_consistent(up_to).await?;
        self.gateway
            .catchup_row_records(&self.group, after, up_to, exclude_hashes)
            .await
    }

    async fn load_permissions(&self) -> Result<Option<StoredPermissions>, StorageError> {
        self.gateway.load_permissions().await
    }

    async fn compact_tombstones(&self, before: &CvrVersion) -> Result<u64, StorageError> {
        self.gateway
            .compact_tombstones(&self.group, before)
            .await
    }
}
