use super::schema::{clients, desires, instances, permissions, queries, rows, rows_version};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde_json::Value;
use zync_core::models::cvr::{ClientRecord, DesireRecord, QueryRecord};
use zync_core::models::permissions::PermissionsConfig;
use zync_core::models::row::{RefCounts, RowId, RowKey, RowRecord};
use zync_core::models::version::CvrVersion;
use zync_core::storage::{StorageError, StoredPermissions};
use zync_core::ClientGroupId;

fn parse_version(cookie: &str) -> Result<CvrVersion, StorageError> {
    CvrVersion::parse_cookie(cookie).map_err(|e| StorageError::Unexpected(e.to_string()))
}

#[derive(Identifiable, Queryable, Selectable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = instances, primary_key(client_group_id))]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Instance {
    pub client_group_id: String,
    pub version: String,
    pub last_active: NaiveDateTime,
    pub replica_version: Option<String>,
    pub owner: Option<String>,
    pub granted_at: Option<NaiveDateTime>,
}

#[derive(Identifiable, Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = clients, primary_key(client_group_id, client_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Client {
    pub client_group_id: String,
    pub client_id: String,
    pub patch_version: String,
    pub deleted: bool,
}

impl Client {
    pub fn from_record(group: &ClientGroupId, record: &ClientRecord) -> Self {
        Self {
            client_group_id: group.clone(),
            client_id: record.id.clone(),
            patch_version: record.patch_version.cookie(),
            deleted: record.deleted,
        }
    }

    pub fn into_record(self) -> Result<ClientRecord, StorageError> {
        Ok(ClientRecord {
            id: self.client_id,
            patch_version: parse_version(&self.patch_version)?,
            deleted: self.deleted,
        })
    }
}

#[derive(Identifiable, Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = queries, primary_key(client_group_id, query_hash))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Query {
    pub client_group_id: String,
    pub query_hash: String,
    pub ast: Value,
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<String>,
    pub patch_version: Option<String>,
    pub deleted: bool,
}

impl Query {
    pub fn from_record(group: &ClientGroupId, record: &QueryRecord) -> Result<Self, StorageError> {
        Ok(Self {
            client_group_id: group.clone(),
            query_hash: record.hash.clone(),
            ast: serde_json::to_value(&record.ast)
                .map_err(|e| StorageError::Unexpected(e.to_string()))?,
            transformation_hash: record.transformation_hash.clone(),
            transformation_version: record
                .transformation_version
                .as_ref()
                .map(CvrVersion::cookie),
            patch_version: record.patch_version.as_ref().map(CvrVersion::cookie),
            deleted: record.deleted,
        })
    }

    pub fn into_record(self) -> Result<QueryRecord, StorageError> {
        Ok(QueryRecord {
            hash: self.query_hash,
            ast: serde_json::from_value(self.ast)
                .map_err(|e| StorageError::Unexpected(format!("malformed stored AST: {e}")))?,
            transformation_hash: self.transformation_hash,
            transformation_version: self
                .transformation_version
                .as_deref()
                .map(parse_version)
                .transpose()?,
            patch_version: self.patch_version.as_deref().map(parse_version).transpose()?,
            deleted: self.deleted,
        })
    }
}

#[derive(Identifiable, Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = desires, primary_key(client_group_id, client_id, query_hash))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Desire {
    pub client_group_id: String,
    pub client_id: String,
    pub query_hash: String,
    pub patch_version: String,
    pub deleted: bool,
}

impl Desire {
    pub fn from_record(group: &ClientGroupId, record: &DesireRecord) -> Self {
        Self {
            client_group_id: group.clone(),
            client_id: record.client_id.clone(),
            query_hash: record.query_hash.clone(),
            patch_version: record.patch_version.cookie(),
            deleted: record.deleted,
        }
    }

    pub fn into_record(self) -> Result<DesireRecord, StorageError> {
        Ok(DesireRecord {
            client_id: self.client_id,
            query_hash: self.query_hash,
            patch_version: parse_version(&self.patch_version)?,
            deleted: self.deleted,
        })
    }
}

#[derive(Identifiable, Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = rows, primary_key(client_group_id, schema, table_name, row_key))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RowOrm {
    pub client_group_id: String,
    pub schema: String,
    pub table_name: String,
    pub row_key: Value,
    pub row_version: String,
    pub patch_version: String,
    pub ref_counts: Option<Value>,
}

impl RowOrm {
    pub fn from_record(group: &ClientGroupId, record: &RowRecord) -> Result<Self, StorageError> {
        let ref_counts = record
            .ref_counts
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StorageError::Unexpected(e.to_string()))?;
        Ok(Self {
            client_group_id: group.clone(),
            schema: record.id.schema.clone(),
            table_name: record.id.table.clone(),
            row_key: Value::Object(record.id.row_key.columns().clone()),
            row_version: record.row_version.clone(),
            patch_version: record.patch_version.cookie(),
            ref_counts,
        })
    }

    pub fn into_record(self) -> Result<RowRecord, StorageError> {
        let key_columns = match self.row_key {
            Value::Object(map) => map,
            other => {
                return Err(StorageError::Unexpected(format!(
                    "row key must be a JSON object, got {other}"
                )))
            }
        };
        let row_key =
            RowKey::new(key_columns).map_err(|e| StorageError::Unexpected(e.to_string()))?;
        let ref_counts: Option<RefCounts> = self
            .ref_counts
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StorageError::Unexpected(format!("malformed refCounts: {e}")))?;
        Ok(RowRecord {
            id: RowId::new(self.schema, self.table_name, row_key),
            row_version: self.row_version,
            patch_version: parse_version(&self.patch_version)?,
            ref_counts,
        })
    }
}

#[derive(Identifiable, Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = rows_version, primary_key(client_group_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RowsVersion {
    pub client_group_id: String,
    pub version: String,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = permissions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Permissions {
    #[diesel(column_name = permissions_)]
    pub permissions: Option<Value>,
    pub hash: Option<String>,
    pub lock: bool,
}

impl Permissions {
    pub fn into_stored(self) -> Result<Option<StoredPermissions>, StorageError> {
        match (self.permissions, self.hash) {
            (Some(value), Some(hash)) => {
                let config: PermissionsConfig = serde_json::from_value(value).map_err(|e| {
                    StorageError::Unexpected(format!("malformed stored permissions: {e}"))
                })?;
                Ok(Some(StoredPermissions { config, hash }))
            }
            _ => Ok(None),
        }
    }
}
