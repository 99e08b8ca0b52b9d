//! Row-record commit gateway.
//!
//! The only writer of `cvr.rows` and `cvr.rows_version`. Each commit
//! upserts one batch of row records and moves the consistency marker in
//! the same transaction, so readers observing `rows_version >= v` are
//! guaranteed to see every row committed for versions up to `v`.

use super::{orm, schema, storage_error_from_diesel, PostgresError};
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::debug;
use zync_core::models::row::RowRecord;
use zync_core::models::version::CvrVersion;
use zync_core::storage::StorageError;
use zync_core::ClientGroupId;

/// Rows per INSERT statement; 7 bind parameters each, comfortably under
/// the postgres limit of 65535 binds per statement.
const UPSERT_CHUNK_SIZE: usize = 2_000;

/// Sink for row-record batches, abstracted so the cache's flush logic can
/// be exercised without a database.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RowsGateway: Send + Sync + 'static {
    /// Commits `rows` and advances the group's rows version to `version`
    /// atomically.
    async fn commit_rows(
        &self,
        group: &ClientGroupId,
        rows: &[RowRecord],
        version: &CvrVersion,
    ) -> Result<(), StorageError>;

    /// Current rows version of the group, if any rows were ever committed.
    async fn rows_version(
        &self,
        group: &ClientGroupId,
    ) -> Result<Option<CvrVersion>, StorageError>;
}

#[derive(Clone)]
pub struct PgRowsGateway {
    pool: Pool<AsyncPgConnection>,
}

impl PgRowsGateway {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RowsGateway for PgRowsGateway {
    async fn commit_rows(
        &self,
        group: &ClientGroupId,
        rows: &[RowRecord],
        version: &CvrVersion,
    ) -> Result<(), StorageError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| StorageError::Unexpected(format!("{}", err)))?;

        let row_count = rows.len();
        conn.transaction::<_, PostgresError, _>(|conn| {
            async move {
                if !rows.is_empty() {
                    let values: Vec<orm::RowOrm> = rows
                        .iter()
                        .map(|r| orm::RowOrm::from_record(group, r))
                        .collect::<Result<_, _>>()?;
                    for chunk in values.chunks(UPSERT_CHUNK_SIZE) {
                        diesel::insert_into(schema::rows::table)
                            .values(chunk)
                            .on_conflict((
                                schema::rows::client_group_id,
                                schema::rows::schema,
                                schema::rows::table_name,
                                schema::rows::row_key,
                            ))
                            .do_update()
                            .set((
                                schema::rows::row_version
                                    .eq(excluded(schema::rows::row_version)),
                                schema::rows::patch_version
                                    .eq(excluded(schema::rows::patch_version)),
                                schema::rows::ref_counts
                                    .eq(excluded(schema::rows::ref_counts)),
                            ))
                            .execute(conn)
                            .await?;
                    }
                }

                let marker = orm::RowsVersion {
                    client_group_id: group.clone(),
                    version: version.cookie(),
                };
                diesel::insert_into(schema::rows_version::table)
                    .values(&marker)
                    .on_conflict(schema::rows_version::client_group_id)
                    .do_update()
                    .set(schema::rows_version::version.eq(excluded(schema::rows_version::version)))
                    .execute(conn)
                    .await?;

                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(|e: PostgresError| e.0)?;

        debug!(%group, version = %version, rows = row_count, "committed row records");
        Ok(())
    }

    async fn rows_version(
        &self,
        group: &ClientGroupId,
    ) -> Result<Option<CvrVersion>, StorageError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| StorageError::Unexpected(format!("{}", err)))?;
        let marker: Option<orm::RowsVersion> = schema::rows_version::table
            .find(group)
            .select(orm::RowsVersion::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| storage_error_from_diesel(e, "RowsVersion", group))?;
        marker
            .map(|m| {
                CvrVersion::parse_cookie(&m.version)
                    .map_err(|e| StorageError::Unexpected(e.to_string()))
            })
            .transpose()
    }
}
