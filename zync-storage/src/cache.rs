//! Write-through / write-back row-record commits.
//!
//! Metadata commits must stay on the poke critical path; bulk row commits
//! must not. This cache decides, per CVR transaction, whether to commit
//! the row batch inline (write-through) or to queue it for a single
//! background flusher (write-back). Write-back applies when a flush is
//! already in progress or the batch exceeds the configured threshold.
//!
//! Pending batches are tagged with their target rows version and the
//! flusher commits them strictly in version order; it may be behind but
//! never reorders. Callers are serialized by the view-syncer's owner
//! lock, so `apply` is never invoked concurrently.

use crate::postgres::rows::RowsGateway;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use zync_core::models::row::RowRecord;
use zync_core::models::version::CvrVersion;
use zync_core::storage::StorageError;
use zync_core::ClientGroupId;

/// Callback invoked when a background flush fails; the view-syncer
/// instance must treat this as fatal and release its lease.
pub type FailCallback = Arc<dyn Fn(StorageError) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Row batches larger than this are always deferred.
    pub deferred_flush_threshold: usize,
    /// Bound on how long consistency readers wait for the flusher.
    pub flush_wait_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { deferred_flush_threshold: 100, flush_wait_timeout: Duration::from_secs(5) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    WriteThrough,
    Deferred,
}

struct PendingBatch {
    version: CvrVersion,
    rows: Vec<RowRecord>,
}

struct Inner {
    pending: VecDeque<PendingBatch>,
    flushing: bool,
    failed: Option<StorageError>,
}

pub struct RowRecordCache<G: RowsGateway> {
    gateway: Arc<G>,
    group: ClientGroupId,
    config: CacheConfig,
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    flushed_tx: Arc<watch::Sender<CvrVersion>>,
    /// Keeps the watch channel open so flusher sends never observe a
    /// receiverless channel.
    flushed_rx: watch::Receiver<CvrVersion>,
    flusher: JoinHandle<()>,
}

impl<G: RowsGateway> RowRecordCache<G> {
    /// Creates the cache and spawns its flusher. `initial_version` is the
    /// rows version currently persisted for the group.
    pub fn new(
        gateway: Arc<G>,
        group: ClientGroupId,
        config: CacheConfig,
        initial_version: CvrVersion,
        fail: FailCallback,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            pending: VecDeque::new(),
            flushing: false,
            failed: None,
        }));
        let notify = Arc::new(Notify::new());
        let (flushed_tx, flushed_rx) = watch::channel(initial_version);
        let flushed_tx = Arc::new(flushed_tx);

        let flusher = tokio::spawn(Self::run_flusher(
            gateway.clone(),
            group.clone(),
            inner.clone(),
            notify.clone(),
            flushed_tx.clone(),
            fail,
        ));

        Self { gateway, group, config, inner, notify, flushed_tx, flushed_rx, flusher }
    }

    async fn run_flusher(
        gateway: Arc<G>,
        group: ClientGroupId,
        inner: Arc<Mutex<Inner>>,
        notify: Arc<Notify>,
        flushed_tx: Arc<watch::Sender<CvrVersion>>,
        fail: FailCallback,
    ) {
        loop {
            notify.notified().await;
            loop {
                let batch = {
                    let mut guard = inner.lock().expect("cache lock poisoned");
                    if guard.failed.is_some() {
                        return;
                    }
                    match guard.pending.pop_front() {
                        Some(batch) => {
                            guard.flushing = true;
                            Some(batch)
                        }
                        None => {
                            guard.flushing = false;
                            None
                        }
                    }
                };
                let Some(batch) = batch else { break };

                match gateway
                    .commit_rows(&group, &batch.rows, &batch.version)
                    .await
                {
                    Ok(()) => {
                        debug!(%group, version = %batch.version, rows = batch.rows.len(),
                            "flushed deferred row batch");
                        let _ = flushed_tx.send(batch.version);
                    }
                    Err(err) => {
                        error!(%group, version = %batch.version, %err, "row flush failed");
                        {
                            let mut guard = inner.lock().expect("cache lock poisoned");
                            guard.failed = Some(err.clone());
                            guard.flushing = false;
                        }
                        fail(err);
                        return;
                    }
                }
            }
        }
    }

    /// Commits one version's row batch, inline when possible.
    pub async fn apply(
        &self,
        version: CvrVersion,
        rows: Vec<RowRecord>,
    ) -> Result<FlushMode, StorageError> {
        let write_through = {
            let mut guard = self.inner.lock().expect("cache lock poisoned");
            if let Some(err) = &guard.failed {
                return Err(err.clone());
            }
            let inline = guard.pending.is_empty()
                && !guard.flushing
                && rows.len() <= self.config.deferred_flush_threshold;
            if inline {
                guard.flushing = true;
            }
            inline
        };

        if write_through {
            let result = self
                .gateway
                .commit_rows(&self.group, &rows, &version)
                .await;
            let mut guard = self.inner.lock().expect("cache lock poisoned");
            guard.flushing = false;
            match result {
                Ok(()) => {
                    drop(guard);
                    let _ = self.flushed_tx.send(version);
                    Ok(FlushMode::WriteThrough)
                }
                Err(err) => {
                    guard.failed = Some(err.clone());
                    Err(err)
                }
            }
        } else {
            self.inner
                .lock()
                .expect("cache lock poisoned")
                .pending
                .push_back(PendingBatch { version, rows });
            self.notify.notify_one();
            Ok(FlushMode::Deferred)
        }
    }

    pub fn has_pending_updates(&self) -> bool {
        let guard = self.inner.lock().expect("cache lock poisoned");
        !guard.pending.is_empty() || guard.flushing
    }

    /// Waits until the persisted rows version reaches `version`, bounded
    /// by the configured timeout.
    pub async fn await_consistent(&self, version: &CvrVersion) -> Result<(), StorageError> {
        if let Some(err) = &self.inner.lock().expect("cache lock poisoned").failed {
            return Err(err.clone());
        }
        let mut rx = self.flushed_rx.clone();
        let wait = async {
            loop {
                if &*rx.borrow() >= version {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(StorageError::Unexpected("row flusher stopped".to_string()));
                }
            }
        };
        match tokio::time::timeout(self.config.flush_wait_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::RowsVersionTimeout(version.cookie())),
        }
    }

    /// The rows version the store is consistent up to.
    pub fn flushed_version(&self) -> CvrVersion {
        self.flushed_rx.borrow().clone()
    }
}

impl<G: RowsGateway> Drop for RowRecordCache<G> {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}
