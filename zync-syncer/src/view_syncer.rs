//! The view-syncer service for one client group.
//!
//! Owns the in-memory CVR state, the pipeline driver and the connected
//! clients, and serializes every mutation through its single task loop
//! (the instance's turn lock). Parallelism exists across client groups,
//! one instance each; within a group, config changes, hydrations,
//! advances and pokes run strictly in turn.
//!
//! Lease handling: the instance mints an owner token at construction and
//! stamps it into every flush. The compare-and-set in the store makes
//! losing the lease visible as an ownership conflict on the next CVR
//! transaction, upon which the instance drains and stops.

use crate::auth::{Authorizer, CellGuard};
use crate::client::ClientConnection;
use crate::cvr::{row_catchup_patches, CvrState, FlushContext, UpdateError};
use crate::ivm::expr::bind_ast;
use crate::ivm::RowChange;
use crate::metrics;
use crate::pipelines::{AdvanceError, DriverError, PipelineDriver};
use crate::poke::Poker;
use crate::replica::Replica;
use chrono::{NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};
use zync_core::json::MAX_SAFE_INTEGER;
use zync_core::models::cvr::new_owner_token;
use zync_core::models::query::{query_hash, Ast};
use zync_core::models::row::{RowId, RowKey, RowValue};
use zync_core::models::schema::{ClientSchema, SchemaError};
use zync_core::models::version::CvrVersion;
use zync_core::protocol::{Downstream, ErrorBody, ErrorKind};
use zync_core::storage::{CvrStore, StorageError};
use zync_core::{ClientGroupId, ClientId, QueryHash};

static LOAD_BACKOFF: Lazy<Vec<Duration>> = Lazy::new(|| {
    ExponentialBackoff::from_millis(50)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .collect()
});

#[derive(Clone, Debug)]
pub struct ViewSyncerConfig {
    /// Share of the total hydration time the advance may burn in its
    /// first half before tripping the circuit breaker.
    pub advance_breaker_ratio: f64,
    /// Output buffer per client channel.
    pub client_channel_buffer: usize,
    pub lease_renewal_interval: Duration,
}

impl Default for ViewSyncerConfig {
    fn default() -> Self {
        Self {
            advance_breaker_ratio: 0.5,
            client_channel_buffer: 64,
            lease_renewal_interval: Duration::from_secs(60),
        }
    }
}

/// Parameters of one client connection.
#[derive(Clone, Debug)]
pub struct ConnectionInit {
    pub client_id: ClientId,
    /// Last cookie the client acknowledged, absent on a cold start.
    pub base_cookie: Option<String>,
    pub schema_version: u32,
    pub client_schema: ClientSchema,
    pub auth_data: Value,
}

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Update(#[from] UpdateError),
}

/// Requests the transport layer feeds into the instance's task loop.
pub enum SyncerRequest {
    Connect {
        init: ConnectionInit,
        reply: oneshot::Sender<Result<ReceiverStream<Downstream>, ErrorBody>>,
    },
    ChangeDesiredQueries {
        client_id: ClientId,
        put: Vec<Ast>,
        del: Vec<QueryHash>,
        reply: oneshot::Sender<Result<(), ErrorBody>>,
    },
    CloseConnection {
        client_id: ClientId,
    },
    DeleteClients {
        client_ids: Vec<ClientId>,
    },
    Stop,
}

struct Inner {
    driver: PipelineDriver,
    cvr: CvrState,
    authorizer: Authorizer,
    cell_guards: Vec<CellGuard>,
    client_schema: ClientSchema,
    auth_data: Value,
}

pub struct ViewSyncer<S: CvrStore> {
    group: ClientGroupId,
    config: ViewSyncerConfig,
    store: Arc<S>,
    replica: Arc<dyn Replica>,
    owner: String,
    granted_at: NaiveDateTime,
    clients: Vec<ClientConnection>,
    inner: Option<Inner>,
    failed: bool,
}

impl<S: CvrStore> ViewSyncer<S> {
    pub fn new(
        group: ClientGroupId,
        store: Arc<S>,
        replica: Arc<dyn Replica>,
        config: ViewSyncerConfig,
    ) -> Self {
        Self {
            group,
            config,
            store,
            replica,
            owner: new_owner_token(),
            granted_at: Utc::now().naive_utc(),
            clients: Vec::new(),
            inner: None,
            failed: false,
        }
    }

    fn flush_context(&self) -> FlushContext {
        FlushContext {
            now: Utc::now().naive_utc(),
            owner: self.owner.clone(),
            granted_at: self.granted_at,
            replica_version: self
                .inner
                .as_ref()
                .map(|i| i.driver.replica_version()),
        }
    }

    fn internal(message: impl std::fmt::Display) -> ErrorBody {
        ErrorBody::new(ErrorKind::Internal, message.to_string())
    }

    /// Loads CVR state, permissions and the pipeline driver on the first
    /// connection; refreshes permissions on later ones.
    async fn initialize(&mut self, init: &ConnectionInit) -> Result<(), ErrorBody> {
        if self.inner.is_some() {
            self.reload_permissions().await?;
            return Ok(());
        }

        let store = self.store.clone();
        let snapshot = Retry::spawn(LOAD_BACKOFF.clone(), move || {
            let store = store.clone();
            async move { store.load().await }
        })
        .await
        .map_err(Self::internal)?;
        let rows = self
            .store
            .load_row_records()
            .await
            .map_err(Self::internal)?;
        let permissions = self
            .store
            .load_permissions()
            .await
            .map_err(Self::internal)?;

        let driver = PipelineDriver::init(
            self.replica.clone(),
            &init.client_schema,
            self.config.advance_breaker_ratio,
        )
        .map_err(|e| match e {
            DriverError::Schema(err) => schema_error_body(err),
            other => Self::internal(other),
        })?;

        let authorizer = Authorizer::new(permissions);
        authorizer
            .validate(driver.table_specs())
            .map_err(|e| Self::internal(format!("invalid permission config: {e}")))?;
        let cell_guards = authorizer.cell_guards();

        // A replica that was re-created from upstream invalidates any
        // previously accumulated view state.
        let mut cvr = CvrState::new(snapshot, rows);
        if let Some(replica_version) = &cvr.snapshot.replica_version {
            if *replica_version != driver.replica_version() {
                warn!(
                    group = %self.group,
                    cvr_replica = %replica_version,
                    replica = %driver.replica_version(),
                    "replica version changed, starting CVR afresh"
                );
                cvr = CvrState::new(
                    zync_core::models::cvr::CvrSnapshot::new(
                        self.group.clone(),
                        Utc::now().naive_utc(),
                    ),
                    Vec::new(),
                );
            }
        }

        info!(group = %self.group, version = %cvr.snapshot.version, "initialized view-syncer");
        self.granted_at = Utc::now().naive_utc();
        self.inner = Some(Inner {
            driver,
            cvr,
            authorizer,
            cell_guards,
            client_schema: init.client_schema.clone(),
            auth_data: init.auth_data.clone(),
        });
        Ok(())
    }

    async fn reload_permissions(&mut self) -> Result<(), ErrorBody> {
        let stored = self
            .store
            .load_permissions()
            .await
            .map_err(Self::internal)?;
        let inner = self.inner.as_mut().expect("initialized");
        let stored_hash = stored.as_ref().map(|p| p.hash.clone());
        if stored_hash.as_deref() != inner.authorizer.permissions_hash() {
            info!(group = %self.group, "permissions changed, reloading");
            inner.authorizer.set_permissions(stored);
            inner
                .authorizer
                .validate(inner.driver.table_specs())
                .map_err(|e| Self::internal(format!("invalid permission config: {e}")))?;
            inner.cell_guards = inner.authorizer.cell_guards();
        }
        Ok(())
    }

    /// Handles a client connection: validates its cookie against the CVR,
    /// registers the client, hydrates whatever its group desires and
    /// catches the client up from its base cookie.
    #[instrument(skip(self, init), fields(group = %self.group, client = %init.client_id))]
    pub async fn connect(
        &mut self,
        init: ConnectionInit,
    ) -> Result<ReceiverStream<Downstream>, ErrorBody> {
        let base_cookie = match &init.base_cookie {
            None => None,
            Some(cookie) => Some(CvrVersion::parse_cookie(cookie).map_err(|e| {
                ErrorBody::new(ErrorKind::InvalidConnectionRequest, e.to_string())
            })?),
        };

        self.initialize(&init).await?;
        let inner = self.inner.as_ref().expect("initialized");

        // A cookie the CVR has never reached means this client's view
        // came from a CVR that no longer exists.
        if let Some(base) = &base_cookie {
            if base > inner.cvr.version() {
                return Err(ErrorBody::new(
                    ErrorKind::ClientNotFound,
                    format!(
                        "client {} is ahead of the client view (cookie {} > {})",
                        init.client_id,
                        base.cookie(),
                        inner.cvr.version().cookie()
                    ),
                ));
            }
        }

        let (connection, stream) = ClientConnection::new(
            init.client_id.clone(),
            init.schema_version,
            base_cookie.clone(),
            self.config.client_channel_buffer,
        );
        self.clients
            .retain(|c| c.client_id() != &init.client_id);
        self.clients.push(connection);
        metrics::connected_clients(self.clients.len());

        // Record the client in the CVR.
        let ctx = self.flush_context();
        let inner = self.inner.as_mut().expect("initialized");
        let mut config = inner.cvr.config_update();
        config.ensure_client(&init.client_id);
        let update = config.finish(&ctx);
        if let Some(flush) = update.flush {
            self.flush(flush).await.map_err(|e| {
                ErrorBody::new(ErrorKind::Internal, e.to_string())
            })?;
        }

        // Hydrate anything desired-but-not-got, then catch this client
        // (and implicitly no other, their cookies being current) up.
        let mut poker = Poker::start(
            self.inner
                .as_ref()
                .expect("initialized")
                .driver
                .schema_versions(),
        );
        let fresh = self.sync_queries(&mut poker).await.map_err(|e| {
            ErrorBody::new(ErrorKind::Internal, e.to_string())
        })?;

        let inner = self.inner.as_ref().expect("initialized");
        let after = base_cookie.unwrap_or_else(CvrVersion::initial);
        let up_to = inner.cvr.version().clone();
        if after < up_to {
            poker.add_patches(inner.cvr.config_catchup_patches(&after));
            let records = self
                .store
                .catchup_row_records(&after, &up_to, &fresh)
                .await
                .map_err(Self::internal)?;
            let inner = self.inner.as_ref().expect("initialized");
            let mut lookup = |id: &RowId| {
                row_value_for(&inner.driver, &inner.cell_guards, &inner.auth_data, id)
            };
            poker.add_patches(row_catchup_patches(&records, &mut lookup));
        }

        let final_version = self
            .inner
            .as_ref()
            .expect("initialized")
            .cvr
            .version()
            .clone();
        poker.end(&final_version, &mut self.clients).await;
        metrics::poke_sent();
        Ok(stream)
    }

    /// Applies desired-query changes for one client and re-synchronizes
    /// the pipelines.
    #[instrument(skip(self, put, del), fields(group = %self.group, client = %client_id))]
    pub async fn change_desired_queries(
        &mut self,
        client_id: &ClientId,
        put: Vec<Ast>,
        del: Vec<QueryHash>,
    ) -> Result<(), ErrorBody> {
        if self.inner.is_none() {
            return Err(ErrorBody::new(
                ErrorKind::InvalidMessage,
                "no connection established for this client group",
            ));
        }
        let ctx = self.flush_context();
        let inner = self.inner.as_mut().expect("initialized");

        let puts: Vec<(QueryHash, Ast)> = put
            .into_iter()
            .map(|ast| (query_hash(&ast), ast))
            .collect();
        let mut config = inner.cvr.config_update();
        config.put_desired_queries(client_id, &puts);
        config.del_desired_queries(client_id, &del);
        let update = config.finish(&ctx);

        let mut poker = Poker::start(inner.driver.schema_versions());
        poker.add_patches(update.patches);
        if let Some(flush) = update.flush {
            self.flush(flush)
                .await
                .map_err(|e| ErrorBody::new(ErrorKind::Internal, e.to_string()))?;
        }
        self.sync_queries(&mut poker)
            .await
            .map_err(|e| ErrorBody::new(ErrorKind::Internal, e.to_string()))?;

        let final_version = self
            .inner
            .as_ref()
            .expect("initialized")
            .cvr
            .version()
            .clone();
        poker.end(&final_version, &mut self.clients).await;
        metrics::poke_sent();
        Ok(())
    }

    /// Drops the connection; CVR records stay for a future reconnect.
    pub fn close_connection(&mut self, client_id: &ClientId) {
        self.clients.retain(|c| c.client_id() != client_id);
        metrics::connected_clients(self.clients.len());
    }

    /// Removes client records entirely, dropping their desires.
    pub async fn delete_clients(&mut self, client_ids: &[ClientId]) -> Result<(), ErrorBody> {
        if self.inner.is_none() {
            return Ok(());
        }
        let ctx = self.flush_context();
        let inner = self.inner.as_mut().expect("initialized");
        let mut config = inner.cvr.config_update();
        config.delete_clients(client_ids);
        let update = config.finish(&ctx);

        let mut poker = Poker::start(inner.driver.schema_versions());
        poker.add_patches(update.patches);
        if let Some(flush) = update.flush {
            self.flush(flush)
                .await
                .map_err(|e| ErrorBody::new(ErrorKind::Internal, e.to_string()))?;
        }
        self.sync_queries(&mut poker)
            .await
            .map_err(|e| ErrorBody::new(ErrorKind::Internal, e.to_string()))?;
        let final_version = self
            .inner
            .as_ref()
            .expect("initialized")
            .cvr
            .version()
            .clone();
        poker.end(&final_version, &mut self.clients).await;

        for client_id in client_ids {
            self.close_connection(client_id);
        }
        Ok(())
    }

    /// Reconciles pipelines with the desired query set: removes got
    /// queries nobody desires, hydrates desired queries that are not got
    /// or whose permission transformation changed. Returns the hashes
    /// hydrated in this pass (they are excluded from row catch-up).
    async fn sync_queries(
        &mut self,
        poker: &mut Poker,
    ) -> Result<BTreeSet<QueryHash>, InstanceError> {
        let ctx = self.flush_context();
        let inner = self.inner.as_mut().expect("initialized");

        let to_remove = inner.cvr.unreferenced_got_queries();
        let mut to_hydrate: Vec<(QueryHash, Ast)> = Vec::new();
        for hash in inner.cvr.snapshot.desired_query_hashes() {
            let record = inner
                .cvr
                .snapshot
                .queries
                .get(&hash)
                .expect("desired queries have records");
            let transformed =
                inner
                    .authorizer
                    .transform(&hash, &record.ast, &inner.client_schema);
            let stale = record.transformation_hash.as_deref()
                != Some(transformed.transformation_hash.as_str());
            if !record.is_got() || stale || !inner.driver.has_query(&hash) {
                to_hydrate.push((hash.clone(), record.ast.clone()));
            }
        }

        if to_remove.is_empty() && to_hydrate.is_empty() {
            return Ok(BTreeSet::new());
        }

        let mut fresh = BTreeSet::new();
        let mut adv = inner.cvr.advance_minor();
        for hash in &to_remove {
            inner.driver.remove_query(hash);
            adv.remove_query(hash);
        }
        for (hash, ast) in &to_hydrate {
            let transformed = inner
                .authorizer
                .transform(hash, ast, &inner.client_schema);
            let bound = bind_ast(&transformed.ast, &inner.auth_data);

            if inner.driver.has_query(hash) {
                // The transformation changed under a live pipeline.
                inner.driver.remove_query(hash);
            }
            adv.begin_rehydrate(hash);
            adv.mark_got(hash, ast, &transformed.transformation_hash);

            let started = Instant::now();
            let changes = inner.driver.add_query(hash.clone(), &bound)?;
            metrics::hydration(started.elapsed());
            for change in &changes {
                received_with_guards(
                    &mut adv,
                    hash,
                    inner.driver.table_specs(),
                    change,
                    &inner.cell_guards,
                    &inner.auth_data,
                )?;
            }
            fresh.insert(hash.clone());
        }

        let update = adv.finish(&ctx);
        poker.add_patches(update.patches);
        if let Some(flush) = update.flush {
            self.flush(flush).await?;
        }
        Ok(fresh)
    }

    /// Folds the next replica transaction through the pipelines, commits
    /// the CVR transaction and pokes every connected client.
    #[instrument(skip(self), fields(group = %self.group))]
    pub async fn advance(&mut self) -> Result<(), InstanceError> {
        if self.inner.is_none() || self.failed {
            return Ok(());
        }
        let ctx = self.flush_context();
        let inner = self.inner.as_mut().expect("initialized");

        let started = Instant::now();
        let advancement = match inner.driver.advance() {
            Ok(advancement) => advancement,
            Err(AdvanceError::Reset(signal)) => {
                info!(group = %self.group, %signal, "resetting pipelines");
                metrics::pipelines_reset();
                inner.driver.reset(&inner.client_schema)?;
                let mut poker = Poker::start(inner.driver.schema_versions());
                self.sync_queries(&mut poker).await?;
                let final_version = self
                    .inner
                    .as_ref()
                    .expect("initialized")
                    .cvr
                    .version()
                    .clone();
                poker.end(&final_version, &mut self.clients).await;
                return Ok(());
            }
            Err(AdvanceError::Driver(err)) => return Err(err.into()),
        };
        metrics::advance(started.elapsed(), advancement.changes.len());

        if advancement.version == inner.cvr.version().state_version {
            return Ok(());
        }

        let mut poker = Poker::start(inner.driver.schema_versions());
        let mut lmid_failures: Vec<(ClientId, String)> = Vec::new();
        for diff in &advancement.client_rows {
            let Some(next) = &diff.next else { continue };
            if next.value.get("client_group_id").and_then(Value::as_str)
                != Some(self.group.as_str())
            {
                continue;
            }
            let Some(client_id) = next.value.get("client_id").and_then(Value::as_str) else {
                continue;
            };
            match next.value.get("last_mutation_id").and_then(Value::as_i64) {
                Some(lmid) if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&lmid) => {
                    poker.record_lmid_change(client_id.to_string(), lmid);
                }
                _ => {
                    let raw = next
                        .value
                        .get("last_mutation_id")
                        .cloned()
                        .unwrap_or(Value::Null);
                    lmid_failures.push((
                        client_id.to_string(),
                        format!("lastMutationID {raw} exceeds the safe Number range"),
                    ));
                }
            }
        }

        let mut adv = inner.cvr.advance_to(advancement.version.clone())?;
        for (hash, change) in &advancement.changes {
            received_with_guards(
                &mut adv,
                hash,
                inner.driver.table_specs(),
                change,
                &inner.cell_guards,
                &inner.auth_data,
            )?;
        }
        let update = adv.finish(&ctx);
        poker.add_patches(update.patches);
        if let Some(flush) = update.flush {
            self.flush(flush).await?;
        }
        poker.end(&update.version, &mut self.clients).await;
        metrics::poke_sent();

        for (client_id, message) in lmid_failures {
            if let Some(client) = self
                .clients
                .iter_mut()
                .find(|c| c.client_id() == &client_id)
            {
                client
                    .fail(ErrorBody::new(ErrorKind::Internal, message))
                    .await;
            }
        }
        self.clients.retain(|c| c.is_open());
        Ok(())
    }

    async fn flush(&mut self, flush: zync_core::models::cvr::CvrFlush) -> Result<(), InstanceError> {
        match self.store.flush(flush).await {
            Ok(()) => Ok(()),
            Err(err @ StorageError::OwnershipConflict { .. }) => {
                warn!(group = %self.group, %err, "lost CVR ownership, shutting down instance");
                self.fail_instance().await;
                Err(err.into())
            }
            Err(err) => {
                error!(group = %self.group, %err, "CVR flush failed");
                self.fail_instance().await;
                Err(err.into())
            }
        }
    }

    /// Instance-fatal path: close every subscription and stop accepting
    /// work. A fresh instance takes over via the lease.
    async fn fail_instance(&mut self) {
        self.failed = true;
        for client in &mut self.clients {
            client.close();
        }
        self.clients.clear();
        metrics::connected_clients(0);
    }

    /// Refreshes `grantedAt` and `lastActive`; doubles as the takeover
    /// detector since the flush CAS fails once another owner moved the
    /// version.
    async fn renew_lease(&mut self) -> Result<(), InstanceError> {
        let Some(inner) = &self.inner else { return Ok(()) };
        self.granted_at = Utc::now().naive_utc();
        let version = inner.cvr.version().clone();
        let ctx = self.flush_context();
        let flush = zync_core::models::cvr::CvrFlush {
            group_id: self.group.clone(),
            expected_version: version.clone(),
            version,
            last_active: ctx.now,
            replica_version: ctx.replica_version,
            owner: ctx.owner,
            granted_at: ctx.granted_at,
            clients: Vec::new(),
            queries: Vec::new(),
            desires: Vec::new(),
            rows: Default::default(),
        };
        self.flush(flush).await?;

        // Tombstones every client has advanced past can go; only safe
        // when every known client of the group is connected, since an
        // offline client's cookie is unknown.
        let inner = self.inner.as_ref().expect("initialized");
        let all_known_connected = inner
            .cvr
            .snapshot
            .clients
            .values()
            .filter(|c| !c.deleted)
            .all(|c| self.clients.iter().any(|conn| conn.client_id() == &c.id));
        let min_acked = if all_known_connected {
            self.clients
                .iter()
                .map(ClientConnection::base_cookie)
                .collect::<Option<Vec<_>>>()
                .and_then(|cookies| cookies.into_iter().min().cloned())
        } else {
            None
        };
        if let Some(before) = min_acked {
            let compacted = self.store.compact_tombstones(&before).await?;
            if compacted > 0 {
                let inner = self.inner.as_mut().expect("initialized");
                inner
                    .cvr
                    .rows
                    .retain(|_, r| !(r.is_tombstone() && r.patch_version <= before));
                debug!(group = %self.group, compacted, "compacted row tombstones");
            }
        }
        Ok(())
    }

    /// The instance's task loop: requests, replica head changes and lease
    /// renewal, strictly in turn.
    pub async fn run(mut self, mut requests: mpsc::Receiver<SyncerRequest>) {
        let mut head = self.replica.watch_head();
        let mut lease = tokio::time::interval(self.config.lease_renewal_interval);
        lease.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        lease.reset();

        loop {
            if self.failed {
                break;
            }
            tokio::select! {
                request = requests.recv() => match request {
                    None | Some(SyncerRequest::Stop) => break,
                    Some(SyncerRequest::Connect { init, reply }) => {
                        let result = self.connect(init).await;
                        let _ = reply.send(result);
                    }
                    Some(SyncerRequest::ChangeDesiredQueries { client_id, put, del, reply }) => {
                        let result = self
                            .change_desired_queries(&client_id, put, del)
                            .await;
                        let _ = reply.send(result);
                    }
                    Some(SyncerRequest::CloseConnection { client_id }) => {
                        self.close_connection(&client_id);
                    }
                    Some(SyncerRequest::DeleteClients { client_ids }) => {
                        let _ = self.delete_clients(&client_ids).await;
                    }
                },
                changed = head.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Err(err) = self.advance().await {
                        error!(group = %self.group, %err, "advance failed");
                        if self.failed {
                            break;
                        }
                    }
                }
                _ = lease.tick() => {
                    if self.renew_lease().await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(group = %self.group, "view-syncer instance stopped");
    }
}

fn schema_error_body(err: SchemaError) -> ErrorBody {
    ErrorBody::new(ErrorKind::SchemaVersionNotSupported, err.to_string())
}

/// Applies cell guards to put values before folding a change.
fn received_with_guards(
    adv: &mut crate::cvr::AdvanceUpdate<'_>,
    hash: &QueryHash,
    specs: &std::collections::BTreeMap<String, zync_core::models::schema::TableSpec>,
    change: &RowChange,
    guards: &[CellGuard],
    auth_data: &Value,
) -> Result<(), UpdateError> {
    let projected = match change.flatten() {
        RowChange::Add { table, row } | RowChange::Edit { table, row, .. } => Some(
            crate::auth::project_row(guards, table, &row.value, auth_data),
        ),
        _ => None,
    };
    adv.received(hash, specs, change, projected)
}

/// Resolves a row record's current contents from the driver's snapshot by
/// primary key, with cell guards applied.
fn row_value_for(
    driver: &PipelineDriver,
    guards: &[CellGuard],
    auth_data: &Value,
    id: &RowId,
) -> Option<RowValue> {
    let spec = driver.table_specs().get(&id.table)?;
    let mut pk = RowValue::new();
    for column in &spec.primary_key {
        pk.insert(column.clone(), id.row_key.columns().get(column)?.clone());
    }
    let key = RowKey::new(pk).ok()?;
    let row = driver
        .current_snapshot()
        .get(&id.table, &key)
        .ok()
        .flatten()?;
    Some(crate::auth::project_row(guards, &id.table, &row.value, auth_data))
}
