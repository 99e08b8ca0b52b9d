//! CVR metadata gateway.
//!
//! Loads and commits the metadata tier (`instances`, `clients`, `queries`,
//! `desires`) and serves the row-record reads that do not go through the
//! cache: the initial page-wise load and version-windowed catch-up scans.

use super::{orm, schema, storage_error_from_diesel, PostgresError};
use chrono::NaiveDateTime;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::{Array, Bool, Text};
use diesel::upsert::excluded;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use itertools::Itertools;
use std::collections::BTreeSet;
use tracing::{debug, instrument};
use zync_core::models::cvr::{CvrFlush, CvrSnapshot};
use zync_core::models::row::RowRecord;
use zync_core::models::version::CvrVersion;
use zync_core::storage::{StorageError, StoredPermissions};
use zync_core::{ClientGroupId, QueryHash};

#[derive(Clone)]
pub(crate) struct CvrGateway {
    pool: Pool<AsyncPgConnection>,
    /// Page size for the initial row-record load.
    row_load_page_size: i64,
}

impl CvrGateway {
    pub fn new(pool: Pool<AsyncPgConnection>, row_load_page_size: usize) -> Self {
        Self { pool, row_load_page_size: row_load_page_size as i64 }
    }

    async fn conn(
        &self,
    ) -> Result<diesel_async::pooled_connection::deadpool::Object<AsyncPgConnection>, StorageError>
    {
        self.pool
            .get()
            .await
            .map_err(|err| StorageError::Unexpected(format!("{}", err)))
    }

    /// Loads the full metadata snapshot of a client group. Groups never
    /// seen before yield a fresh initial snapshot; the instance row is
    /// created by the first flush.
    #[instrument(skip(self))]
    pub async fn load_cvr(
        &self,
        group: &ClientGroupId,
        now: NaiveDateTime,
    ) -> Result<CvrSnapshot, StorageError> {
        let mut conn = self.conn().await?;

        let instance: Option<orm::Instance> = schema::instances::table
            .find(group)
            .select(orm::Instance::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| storage_error_from_diesel(e, "Instance", group))?;

        let Some(instance) = instance else {
            debug!(%group, "no stored CVR, starting fresh");
            return Ok(CvrSnapshot::new(group.clone(), now));
        };

        let mut snapshot = CvrSnapshot::new(group.clone(), instance.last_active);
        snapshot.version = CvrVersion::parse_cookie(&instance.version)
            .map_err(|e| StorageError::Unexpected(e.to_string()))?;
        snapshot.replica_version = instance.replica_version;
        snapshot.owner = instance.owner;
        snapshot.granted_at = instance.granted_at;

        let clients: Vec<orm::Client> = schema::clients::table
            .filter(schema::clients::client_group_id.eq(group))
            .select(orm::Client::as_select())
            .load(&mut conn)
            .await
            .map_err(|e| storage_error_from_diesel(e, "Client", group))?;
        for client in clients {
            let record = client.into_record()?;
            snapshot.clients.insert(record.id.clone(), record);
        }

        let queries: Vec<orm::Query> = schema::queries::table
            .filter(schema::queries::client_group_id.eq(group))
            .select(orm::Query::as_select())
            .load(&mut conn)
            .await
            .map_err(|e| storage_error_from_diesel(e, "Query", group))?;
        for query in queries {
            let record = query.into_record()?;
            snapshot.queries.insert(record.hash.clone(), record);
        }

        let desires: Vec<orm::Desire> = schema::desires::table
            .filter(schema::desires::client_group_id.eq(group))
            .select(orm::Desire::as_select())
            .load(&mut conn)
            .await
            .map_err(|e| storage_error_from_diesel(e, "Desire", group))?;
        for desire in desires {
            let record = desire.into_record()?;
            snapshot
                .desires
                .insert((record.client_id.clone(), record.query_hash.clone()), record);
        }

        Ok(snapshot)
    }

    /// Commits the metadata of one CVR transaction. The instance update is
    /// guarded by a compare-and-set on `version`; zero matched rows on an
    /// existing instance means another view-syncer owns the group now.
    #[instrument(skip_all, fields(group = %flush.group_id, version = %flush.version))]
    pub async fn flush_metadata(&self, flush: &CvrFlush) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let group = flush.group_id.clone();

        conn.transaction::<_, PostgresError, _>(|conn| {
            async move {
                let instance = orm::Instance {
                    client_group_id: flush.group_id.clone(),
                    version: flush.version.cookie(),
                    last_active: flush.last_active,
                    replica_version: flush.replica_version.clone(),
                    owner: Some(flush.owner.clone()),
                    granted_at: Some(flush.granted_at),
                };

                let updated = diesel::update(
                    schema::instances::table.filter(
                        schema::instances::client_group_id
                            .eq(&flush.group_id)
                            .and(schema::instances::version.eq(flush.expected_version.cookie())),
                    ),
                )
                .set(&instance)
                .execute(conn)
                .await?;

                if updated == 0 {
                    let existing: Option<orm::Instance> = schema::instances::table
                        .find(&flush.group_id)
                        .select(orm::Instance::as_select())
                        .first(conn)
                        .await
                        .optional()?;
                    match existing {
                        Some(current) => {
                            return Err(PostgresError(StorageError::OwnershipConflict {
                                group: flush.group_id.clone(),
                                owner: current.owner,
                            }));
                        }
                        None => {
                            diesel::insert_into(schema::instances::table)
                                .values(&instance)
                                .execute(conn)
                                .await?;
                        }
                    }
                }

                if !flush.clients.is_empty() {
                    let rows: Vec<orm::Client> = flush
                        .clients
                        .iter()
                        .map(|c| orm::Client::from_record(&flush.group_id, c))
                        .collect();
                    diesel::insert_into(schema::clients::table)
                        .values(&rows)
                        .on_conflict((
                            schema::clients::client_group_id,
                            schema::clients::client_id,
                        ))
                        .do_update()
                        .set((
                            schema::clients::patch_version
                                .eq(excluded(schema::clients::patch_version)),
                            schema::clients::deleted.eq(excluded(schema::clients::deleted)),
                        ))
                        .execute(conn)
                        .await?;
                }

                if !flush.queries.is_empty() {
                    let rows: Vec<orm::Query> = flush
                        .queries
                        .iter()
                        .map(|q| orm::Query::from_record(&flush.group_id, q))
                        .collect::<Result<_, _>>()?;
                    diesel::insert_into(schema::queries::table)
                        .values(&rows)
                        .on_conflict((
                            schema::queries::client_group_id,
                            schema::queries::query_hash,
                        ))
                        .do_update()
                        .set((
                            schema::queries::ast.eq(excluded(schema::queries::ast)),
                            schema::queries::transformation_hash
                                .eq(excluded(schema::queries::transformation_hash)),
                            schema::queries::transformation_version
                                .eq(excluded(schema::queries::transformation_version)),
                            schema::queries::patch_version
                                .eq(excluded(schema::queries::patch_version)),
                            schema::queries::deleted.eq(excluded(schema::queries::deleted)),
                        ))
                        .execute(conn)
                        .await?;
                }

                if !flush.desires.is_empty() {
                    let rows: Vec<orm::Desire> = flush
                        .desires
                        .iter()
                        .map(|d| orm::Desire::from_record(&flush.group_id, d))
                        .collect();
                    diesel::insert_into(schema::desires::table)
                        .values(&rows)
                        .on_conflict((
                            schema::desires::client_group_id,
                            schema::desires::client_id,
                            schema::desires::query_hash,
                        ))
                        .do_update()
                        .set((
                            schema::desires::patch_version
                                .eq(excluded(schema::desires::patch_version)),
                            schema::desires::deleted.eq(excluded(schema::desires::deleted)),
                        ))
                        .execute(conn)
                        .await?;
                }

                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(|e: PostgresError| e.0)?;

        debug!(%group, "committed CVR metadata");
        Ok(())
    }

    /// Pages through all row records of a group.
    pub async fn load_row_records(
        &self,
        group: &ClientGroupId,
    ) -> Result<Vec<RowRecord>, StorageError> {
        let mut conn = self.conn().await?;
        let mut records = Vec::new();
        let mut offset: i64 = 0;
        loop {
            let page: Vec<orm::RowOrm> = schema::rows::table
                .filter(schema::rows::client_group_id.eq(group))
                .order((
                    schema::rows::schema,
                    schema::rows::table_name,
                    schema::rows::row_key,
                ))
                .limit(self.row_load_page_size)
                .offset(offset)
                .select(orm::RowOrm::as_select())
                .load(&mut conn)
                .await
                .map_err(|e| storage_error_from_diesel(e, "RowRecord", group))?;
            let fetched = page.len() as i64;
            for row in page {
                records.push(row.into_record()?);
            }
            if fetched < self.row_load_page_size {
                break;
            }
            offset += fetched;
        }
        Ok(records)
    }

    /// Row records with `patch_version` in `(after, up_to]`, skipping live
    /// rows referenced by any of `exclude_hashes`. Cookie strings compare
    /// lexicographically in version order, so the window is a plain text
    /// range scan.
    pub async fn catchup_row_records(
        &self,
        group: &ClientGroupId,
        after: &CvrVersion,
        up_to: &CvrVersion,
        exclude_hashes: &BTreeSet<QueryHash>,
    ) -> Result<Vec<RowRecord>, StorageError> {
        let mut conn = self.conn().await?;
        let mut query = schema::rows::table
            .filter(schema::rows::client_group_id.eq(group))
            .filter(schema::rows::patch_version.gt(after.cookie()))
            .filter(schema::rows::patch_version.le(up_to.cookie()))
            .select(orm::RowOrm::as_select())
            .into_boxed();

        if !exclude_hashes.is_empty() {
            let hashes: Vec<String> = exclude_hashes.iter().cloned().collect();
            query = query.filter(
                sql::<Bool>("(ref_counts IS NULL OR NOT (ref_counts ?| ")
                    .bind::<Array<Text>, _>(hashes)
                    .sql("))"),
            );
        }

        let rows: Vec<orm::RowOrm> = query
            .order(schema::rows::patch_version.asc())
            .load(&mut conn)
            .await
            .map_err(|e| storage_error_from_diesel(e, "RowRecord", group))?;
        rows.into_iter().map(orm::RowOrm::into_record).collect()
    }

    pub async fn load_permissions(&self) -> Result<Option<StoredPermissions>, StorageError> {
        let mut conn = self.conn().await?;
        let row: Option<orm::Permissions> = schema::permissions::table
            .select(orm::Permissions::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| storage_error_from_diesel(e, "Permissions", "singleton"))?;
        match row {
            Some(row) => row.into_stored(),
            None => Ok(None),
        }
    }

    pub async fn compact_tombstones(
        &self,
        group: &ClientGroupId,
        before: &CvrVersion,
    ) -> Result<u64, StorageError> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(
            schema::rows::table
                .filter(schema::rows::client_group_id.eq(group))
                .filter(schema::rows::ref_counts.is_null())
                .filter(schema::rows::patch_version.le(before.cookie())),
        )
        .execute(&mut conn)
        .await
        .map_err(|e| storage_error_from_diesel(e, "RowRecord", group))?;
        Ok(deleted as u64)
    }
}

/// Removes every trace of client groups whose `last_active` is older than
/// `horizon`. Returns the number of groups collected.
pub async fn delete_inactive_groups(
    pool: &Pool<AsyncPgConnection>,
    horizon: NaiveDateTime,
) -> Result<u64, StorageError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|err| StorageError::Unexpected(format!("{}", err)))?;

    let groups: Vec<String> = schema::instances::table
        .filter(schema::instances::last_active.lt(horizon))
        .select(schema::instances::client_group_id)
        .load(&mut conn)
        .await
        .map_err(|e| storage_error_from_diesel(e, "Instance", "inactive"))?;
    if groups.is_empty() {
        return Ok(0);
    }
    debug!(groups = %groups.iter().join(", "), "collecting inactive client groups");

    conn.transaction::<_, PostgresError, _>(|conn| {
        let groups = groups.clone();
        async move {
            diesel::delete(
                schema::rows::table.filter(schema::rows::client_group_id.eq_any(&groups)),
            )
            .execute(conn)
            .await?;
            diesel::delete(
                schema::rows_version::table
                    .filter(schema::rows_version::client_group_id.eq_any(&groups)),
            )
            .execute(conn)
            .await?;
            diesel::delete(
                schema::desires::table.filter(schema::desires::client_group_id.eq_any(&groups)),
            )
            .execute(conn)
            .await?;
            diesel::delete(
                schema::queries::table.filter(schema::queries::client_group_id.eq_any(&groups)),
            )
            .execute(conn)
            .await?;
            diesel::delete(
                schema::clients::table.filter(schema::clients::client_group_id.eq_any(&groups)),
            )
            .execute(conn)
            .await?;
            diesel::delete(
                schema::instances::table
                    .filter(schema::instances::client_group_id.eq_any(&groups)),
            )
            .execute(conn)
            .await?;
            Ok(())
        }
        .scope_boxed()
    })
    .await
    .map_err(|e: PostgresError| e.0)?;

    Ok(groups.len() as u64)
}
