// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collection: one shape mirrored into a local store.
//!
//! Ties together:
//! - Ingestion of the shape log (background task, see `ingest`)
//! - The [`LocalStore`] with its optimistic overlay
//! - The [`MutationCoordinator`] for local writes
//! - The [`QueryRegistry`] for live queries
//!
//! # Architecture
//!
//! ```text
//!  ShapeTransport ──fetch──► ingest task ──apply + cursor──► LocalStore ◄── get / scan
//!                                │                           ▲       │
//!                                │ txids             overlay │       │ changed keys
//!                                ▼                           │       ▼
//!                       MutationCoordinator ─────────────────┘  QueryRegistry ──► LiveQuery
//!                                │
//!                                ▼
//!                          WriteHandler
//! ```
//!
//! Every store write goes through [`Shared::with_store_mut`], which holds
//! the store lock while queries are re-evaluated and delivers results once
//! the lock is released.

mod ingest;
mod types;

pub use types::{CollectionHealth, CollectionStatus, KeyExtractor};

use crate::config::CollectionConfig;
use crate::cursor::ShapeCursor;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::mutation::{MutationCoordinator, MutationHandle, MutationOptions, MutationState, Proposal};
use crate::query::{LiveQuery, QueryRegistry, QueryResult, QuerySpec, QuerySubscription};
use crate::store::{ChangeSet, Key, LocalStore, MutationId, Row};
use crate::stream::{ChangeEvent, ChangeOp};
use crate::transport::ShapeTransport;
use crate::write::{ReadOnly, WriteHandler};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `close()` waits for the ingestion task to stop.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by the collection handle, its ingestion task and its
/// confirmation timers.
pub(crate) struct Shared {
    pub(crate) id: String,
    pub(crate) config: CollectionConfig,
    store: RwLock<LocalStore>,
    pub(crate) queries: Arc<QueryRegistry>,
    pub(crate) mutations: MutationCoordinator,
    pub(crate) writer: Arc<dyn WriteHandler>,
    key_extractor: KeyExtractor,
    status_tx: watch::Sender<CollectionStatus>,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn read_store(&self) -> RwLockReadGuard<'_, LocalStore> {
        self.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, LocalStore> {
        self.store.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate the store under its write lock.
    ///
    /// `f` returns its result plus the keys whose effective row may have
    /// changed. Affected queries are re-evaluated before the lock is
    /// released; their results are delivered after.
    pub(crate) fn with_store_mut<R>(&self, f: impl FnOnce(&mut LocalStore) -> (R, ChangeSet)) -> R {
        let result = {
            let mut store = self.write_store();
            let (result, changed) = f(&mut store);
            self.queries.on_change(&store, &changed);
            result
        };
        self.queries.flush();
        result
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Resolves once the collection is closed.
    pub(crate) async fn closed(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn status(&self) -> CollectionStatus {
        *self.status_tx.borrow()
    }

    /// Move to `status`. Closed is final; Failed only moves to Closed.
    pub(crate) fn set_status(&self, status: CollectionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status || *current == CollectionStatus::Closed {
                return false;
            }
            if *current == CollectionStatus::Failed && status != CollectionStatus::Closed {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!(collection = %self.id, status = %status, "Collection status changed");
            metrics::set_collection_status(&self.id, &status.to_string());
        }
    }

    /// Key a change is stored under: extracted from its value when
    /// possible, otherwise the key the source sent.
    pub(crate) fn resolve_key(&self, change: &ChangeEvent) -> Key {
        change
            .value
            .as_ref()
            .and_then(|row| self.key_extractor.extract(row))
            .unwrap_or_else(|| change.key.clone())
    }

    /// The source is unreachable: flag query results as stale.
    pub(crate) fn mark_stale(&self) {
        self.queries.set_stale(true);
        self.queries.flush();
        if self.queries.is_ready() {
            self.set_status(CollectionStatus::Stale);
        }
    }

    /// A fetch succeeded again.
    pub(crate) fn mark_recovered(&self) {
        self.queries.set_stale(false);
        self.queries.flush();
        if self.status() == CollectionStatus::Stale {
            self.set_status(CollectionStatus::Ready);
        }
    }

    /// Cancel pending mutations and end every live query.
    ///
    /// Callers must have set the shutdown flag first, so no new mutation
    /// can install itself after `cancel_all` runs.
    fn teardown(&self) {
        self.with_store_mut(|store| ((), self.mutations.cancel_all(store)));
        self.queries.close();
        self.set_status(CollectionStatus::Closed);
    }
}

/// Builder for a [`Collection`].
///
/// ```rust,no_run
/// use sync_collection::{Collection, CollectionConfig, MemoryShapeSource};
/// use std::sync::Arc;
///
/// # async fn example() -> sync_collection::Result<()> {
/// let source = Arc::new(MemoryShapeSource::new("todos"));
/// let todos = Collection::builder(CollectionConfig::for_testing("todos", "todos"), source)
///     .key_field("id")
///     .open()?;
/// todos.wait_ready().await?;
/// # Ok(())
/// # }
/// ```
pub struct CollectionBuilder {
    config: CollectionConfig,
    transport: Arc<dyn ShapeTransport>,
    writer: Arc<dyn WriteHandler>,
    key_extractor: KeyExtractor,
}

impl CollectionBuilder {
    /// Handler that persists local writes. Defaults to [`ReadOnly`].
    pub fn write_handler(mut self, handler: Arc<dyn WriteHandler>) -> Self {
        self.writer = handler;
        self
    }

    /// Read row keys from a single field. Defaults to `id`.
    pub fn key_field(mut self, field: impl Into<String>) -> Self {
        self.key_extractor = KeyExtractor::field(field);
        self
    }

    pub fn key_extractor(mut self, extractor: KeyExtractor) -> Self {
        self.key_extractor = extractor;
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Validate the configuration and start ingestion.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(self) -> Result<Collection> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::InvalidState {
            expected: "a tokio runtime".to_string(),
            actual: "no runtime".to_string(),
        })?;

        let id = self.config.id.clone();
        let shape_id = self.config.shape.shape_id();
        let (status_tx, _) = watch::channel(CollectionStatus::Created);
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: id.clone(),
            store: RwLock::new(LocalStore::new()),
            queries: Arc::new(QueryRegistry::new(&id)),
            mutations: MutationCoordinator::new(&id, self.config.mutations.clone()),
            writer: self.writer,
            key_extractor: self.key_extractor,
            status_tx,
            shutdown_tx,
            config: self.config,
        });
        metrics::set_collection_status(&id, "Created");

        let handle = {
            let shared = Arc::clone(&shared);
            let transport = self.transport;
            runtime.spawn(async move {
                let run = ingest::run_ingest(Arc::clone(&shared), transport);
                if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                    error!(collection = %shared.id, "Ingestion task panicked");
                    shared.set_status(CollectionStatus::Failed);
                }
            })
        };
        info!(collection = %id, shape_id = %shape_id, "Collection opened");

        Ok(Collection {
            shared,
            ingest: Mutex::new(Some(handle)),
        })
    }
}

/// A locally mirrored shape with optimistic writes and live queries.
///
/// Reads never wait on the network. Writes return once the write handler
/// has acknowledged them; the returned [`MutationHandle`] resolves when
/// the change comes back through the shape log.
pub struct Collection {
    shared: Arc<Shared>,
    ingest: Mutex<Option<JoinHandle<()>>>,
}

impl Collection {
    /// Start building a collection over `transport`.
    pub fn builder(config: CollectionConfig, transport: Arc<dyn ShapeTransport>) -> CollectionBuilder {
        CollectionBuilder {
            config,
            transport,
            writer: Arc::new(ReadOnly),
            key_extractor: KeyExtractor::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.shared.config
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// Effective row for `key`.
    pub fn get(&self, key: impl Into<Key>) -> Option<Row> {
        let key = key.into();
        self.shared.read_store().get(&key).cloned()
    }

    /// All effective rows in key order.
    pub fn scan(&self) -> Vec<(Key, Row)> {
        self.shared
            .read_store()
            .scan()
            .map(|(k, row)| (k.clone(), row.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.read_store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position in the shape log.
    pub fn cursor(&self) -> ShapeCursor {
        self.shared.read_store().cursor().clone()
    }

    pub fn status(&self) -> CollectionStatus {
        self.shared.status()
    }

    /// Watch status transitions.
    pub fn status_receiver(&self) -> watch::Receiver<CollectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Number of mutations not yet confirmed or rolled back.
    pub fn pending_mutations(&self) -> usize {
        self.shared.mutations.pending()
    }

    /// State of an in-flight mutation. `None` once it has finished.
    pub fn mutation_state(&self, id: MutationId) -> Option<MutationState> {
        self.shared.mutations.state(id)
    }

    /// Wait until the collection has caught up with the shape once.
    ///
    /// Fails if the collection is closed, or if ingestion gave up before
    /// catching up.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.shared.status_tx.subscribe();
        let status = *rx
            .wait_for(|s| matches!(s, CollectionStatus::Ready | CollectionStatus::Stale) || s.is_terminal())
            .await
            .map_err(|_| SyncError::Closed(self.shared.id.clone()))?;
        match status {
            CollectionStatus::Closed => Err(SyncError::Closed(self.shared.id.clone())),
            CollectionStatus::Failed if !self.shared.queries.is_ready() => Err(SyncError::InvalidState {
                expected: CollectionStatus::Ready.to_string(),
                actual: CollectionStatus::Failed.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Snapshot of the collection's health. Performs no I/O.
    pub fn health(&self) -> CollectionHealth {
        let store = self.shared.read_store();
        CollectionHealth {
            id: self.shared.id.clone(),
            status: self.shared.status(),
            ready: self.shared.queries.is_ready(),
            cursor: store.cursor().clone(),
            base_rows: store.base_len(),
            visible_rows: store.len(),
            pending_mutations: self.shared.mutations.pending(),
            live_queries: self.shared.queries.len(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert a row. Its key comes from the key extractor.
    pub async fn insert(&self, row: impl Into<Value>) -> Result<MutationHandle> {
        self.insert_with(row, MutationOptions::default()).await
    }

    pub async fn insert_with(&self, row: impl Into<Value>, options: MutationOptions) -> Result<MutationHandle> {
        self.ensure_open()?;
        let row = into_row(row.into())?;
        let key = self
            .shared
            .key_extractor
            .extract(&row)
            .ok_or_else(|| SyncError::InvalidRow("no key could be extracted from the row".to_string()))?;
        self.propose(ChangeOp::Insert, key, row, options).await
    }

    /// Merge `patch` into the row at `key`.
    pub async fn update(&self, key: impl Into<Key>, patch: impl Into<Value>) -> Result<MutationHandle> {
        self.update_with(key, patch, MutationOptions::default()).await
    }

    pub async fn update_with(
        &self,
        key: impl Into<Key>,
        patch: impl Into<Value>,
        options: MutationOptions,
    ) -> Result<MutationHandle> {
        self.ensure_open()?;
        let key = key.into();
        let patch = into_row(patch.into())?;
        if let Some(patched) = self.shared.key_extractor.extract(&patch) {
            if patched != key {
                return Err(SyncError::InvalidRow(format!(
                    "update of {} would change its key to {}",
                    key, patched
                )));
            }
        }
        self.propose(ChangeOp::Update, key, patch, options).await
    }

    /// Delete the row at `key`.
    pub async fn delete(&self, key: impl Into<Key>) -> Result<MutationHandle> {
        self.delete_with(key, MutationOptions::default()).await
    }

    pub async fn delete_with(&self, key: impl Into<Key>, options: MutationOptions) -> Result<MutationHandle> {
        self.ensure_open()?;
        self.propose(ChangeOp::Delete, key.into(), Row::new(), options).await
    }

    async fn propose(&self, kind: ChangeOp, key: Key, changes: Row, options: MutationOptions) -> Result<MutationHandle> {
        let proposal = Proposal { kind, key, changes };
        self.shared.mutations.propose(&self.shared, proposal, options).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(SyncError::Closed(self.shared.id.clone()));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Live queries
    // ═══════════════════════════════════════════════════════════════════════════

    /// Subscribe to a query as a stream of results.
    ///
    /// Nothing is emitted until the collection has caught up once. The
    /// stream ends on unsubscribe, drop, or close.
    pub fn live_query(&self, spec: QuerySpec) -> LiveQuery {
        let query = {
            let store = self.shared.read_store();
            self.shared.queries.subscribe(&store, spec)
        };
        self.shared.queries.flush();
        query
    }

    /// Subscribe to a query with a callback.
    ///
    /// The callback runs on whichever task changed the store, after the
    /// store lock is released, so it may read or write the collection.
    pub fn subscribe<F>(&self, spec: QuerySpec, callback: F) -> QuerySubscription
    where
        F: Fn(&QueryResult) + Send + Sync + 'static,
    {
        let subscription = {
            let store = self.shared.read_store();
            self.shared.queries.subscribe_callback(&store, spec, callback)
        };
        self.shared.queries.flush();
        subscription
    }

    /// Number of registered live queries.
    pub fn live_query_count(&self) -> usize {
        self.shared.queries.len()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the collection. Idempotent.
    ///
    /// Stops ingestion, fails every pending mutation with `Cancelled`
    /// (rolling back its optimistic state) and ends all live queries.
    pub async fn close(&self) {
        if self.shared.shutdown_tx.send_replace(true) {
            return;
        }
        info!(collection = %self.shared.id, "Closing collection");
        self.shared.teardown();

        let handle = self.ingest.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(collection = %self.shared.id, "Ingestion task stopped gracefully"),
                Ok(Err(e)) if e.is_cancelled() => debug!(collection = %self.shared.id, "Ingestion task cancelled"),
                Ok(Err(e)) => warn!(collection = %self.shared.id, error = %e, "Ingestion task panicked"),
                Err(_) => {
                    warn!(collection = %self.shared.id, "Ingestion task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        info!(collection = %self.shared.id, "Collection closed");
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        if !self.shared.shutdown_tx.send_replace(true) {
            self.shared.teardown();
        }
        let handle = self.ingest.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.shared.id)
            .field("status", &self.shared.status())
            .finish()
    }
}

fn into_row(value: Value) -> Result<Row> {
    match value {
        Value::Object(row) => Ok(row),
        other => Err(SyncError::InvalidRow(format!("expected a JSON object, got {}", other))),
    }
}
