//! The Client View Record data model.
//!
//! The CVR captures, per client group, which queries each client desires,
//! which queries the server has hydrated ("got") and at which versions the
//! group's row records currently stand. Metadata (instances, clients,
//! queries, desires) and row records are persisted separately; see the
//! storage layer for the two-tier commit protocol.
//!
//! Client, query and desire records all carry the CVR version at which
//! they last changed (`patch_version`) plus a `deleted` flag. Deleted
//! records are retained as tombstones so lagging clients can be caught up
//! with the corresponding `del` patches before the tombstones are
//! compacted away.

use crate::models::query::Ast;
use crate::models::row::{RowId, RowRecord};
use crate::models::version::{CvrVersion, StateVersion};
use crate::models::{ClientGroupId, ClientId, QueryHash};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Per-client CVR state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub id: ClientId,
    /// CVR version at which this client record last changed.
    pub patch_version: CvrVersion,
    #[serde(default)]
    pub deleted: bool,
}

/// Per-query CVR state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub hash: QueryHash,
    pub ast: Ast,
    /// Hash of the auth-transformed AST that was hydrated, if any.
    pub transformation_hash: Option<String>,
    /// Set when the query was hydrated; a query is *got* iff this is set.
    pub transformation_version: Option<CvrVersion>,
    /// CVR version of the last got/del transition, for catch-up patches.
    pub patch_version: Option<CvrVersion>,
    #[serde(default)]
    pub deleted: bool,
}

impl QueryRecord {
    pub fn new(hash: QueryHash, ast: Ast) -> Self {
        Self {
            hash,
            ast,
            transformation_hash: None,
            transformation_version: None,
            patch_version: None,
            deleted: false,
        }
    }

    pub fn is_got(&self) -> bool {
        self.transformation_version.is_some() && !self.deleted
    }
}

/// One client's desire for one query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesireRecord {
    pub client_id: ClientId,
    pub query_hash: QueryHash,
    pub patch_version: CvrVersion,
    #[serde(default)]
    pub deleted: bool,
}

/// In-memory image of a client group's CVR metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct CvrSnapshot {
    pub id: ClientGroupId,
    pub version: CvrVersion,
    pub last_active: NaiveDateTime,
    /// Replica version the CVR was hydrated against. A replica reset
    /// invalidates the CVR.
    pub replica_version: Option<StateVersion>,
    /// Lease token of the view-syncer currently allowed to mutate this
    /// CVR.
    pub owner: Option<String>,
    pub granted_at: Option<NaiveDateTime>,
    pub clients: BTreeMap<ClientId, ClientRecord>,
    pub queries: BTreeMap<QueryHash, QueryRecord>,
    pub desires: BTreeMap<(ClientId, QueryHash), DesireRecord>,
}

impl CvrSnapshot {
    pub fn new(id: ClientGroupId, now: NaiveDateTime) -> Self {
        Self {
            id,
            version: CvrVersion::initial(),
            last_active: now,
            replica_version: None,
            owner: None,
            granted_at: None,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            desires: BTreeMap::new(),
        }
    }

    /// Hashes of queries some client still desires.
    pub fn desired_query_hashes(&self) -> BTreeSet<QueryHash> {
        self.desires
            .values()
            .filter(|d| !d.deleted)
            .map(|d| d.query_hash.clone())
            .collect()
    }

    /// Hashes the given client currently desires.
    pub fn desired_by_client(&self, client_id: &ClientId) -> BTreeSet<QueryHash> {
        self.desires
            .values()
            .filter(|d| !d.deleted && &d.client_id == client_id)
            .map(|d| d.query_hash.clone())
            .collect()
    }

    /// Clients that currently desire the given query.
    pub fn desiring_clients(&self, hash: &QueryHash) -> BTreeSet<ClientId> {
        self.desires
            .values()
            .filter(|d| !d.deleted && &d.query_hash == hash)
            .map(|d| d.client_id.clone())
            .collect()
    }
}

/// One CVR transaction, handed to the store for commit. Metadata is
/// committed synchronously; `rows` flow through the row-record cache and
/// may commit later, tagged with `version` as their target rows version.
#[derive(Clone, Debug, PartialEq)]
pub struct CvrFlush {
    pub group_id: ClientGroupId,
    /// Version the store must observe in `cvr.instances` for the commit to
    /// apply; a mismatch means another view-syncer took over.
    pub expected_version: CvrVersion,
    pub version: CvrVersion,
    pub last_active: NaiveDateTime,
    pub replica_version: Option<StateVersion>,
    pub owner: String,
    pub granted_at: NaiveDateTime,
    /// Client records that changed this transaction.
    pub clients: Vec<ClientRecord>,
    /// Query records that changed this transaction.
    pub queries: Vec<QueryRecord>,
    /// Desire records that changed this transaction.
    pub desires: Vec<DesireRecord>,
    /// Merged row records to persist, tombstones included.
    pub rows: HashMap<RowId, RowRecord>,
}

impl CvrFlush {
    pub fn has_changes(&self) -> bool {
        !self.clients.is_empty()
            || !self.queries.is_empty()
            || !self.desires.is_empty()
            || !self.rows.is_empty()
    }
}

/// Generates a fresh owner lease token.
pub fn new_owner_token() -> String {
    Uuid::new_v4().to_string()
}
