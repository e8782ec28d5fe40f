// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Optimistic mutation coordinator.
//!
//! Every local write becomes an optimistic mutation with its own state
//! machine:
//!
//! ```text
//!   propose()
//!      │ validate, snapshot original, install overlay (visible now)
//!      ▼
//!   Pending ──── write handler error ─────────────► RolledBack(write_rejected)
//!      │  └───── propose() future dropped ────────► RolledBack(cancelled)
//!      │ handler returns txid
//!      ▼
//!   Confirming ── txid seen in stream ────────────► Confirmed
//!      │  ├────── timeout expires ────────────────► RolledBack(confirmation_timeout)
//!      │  └────── collection closed ──────────────► RolledBack(cancelled)
//! ```
//!
//! # Per-Key Serialization
//!
//! Each key has an async mutex. A mutation holds its key's guard from
//! validation until it reaches a terminal state, so a second proposal on the
//! same key either waits (`ConflictPolicy::Queue`) or fails fast
//! (`ConflictPolicy::RejectConcurrent`). Different keys never wait on each
//! other.
//!
//! # Confirmation
//!
//! The ingestion task calls [`MutationCoordinator::on_txids`] while holding
//! the store write lock, right after applying the batch that carried those
//! txids. Clearing the overlay there means readers go straight from the
//! optimistic row to the confirmed base row with nothing in between.
//!
//! A write's txid can stream in before its handler returns. Recently seen
//! txids are remembered in a bounded window and checked at registration.

use crate::collection::Shared;
use crate::config::{ConflictPolicy, MutationConfig, TxidMatch};
use crate::error::{ErrorKind, Result, SyncError};
use crate::metrics;
use crate::store::{merge_row, ChangeSet, Key, LocalStore, MutationId, OverlayValue, Row};
use crate::stream::{ChangeOp, Txid};
use crate::write::{self, MutationIntent};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Lifecycle of one optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Overlay installed, waiting for the write handler.
    Pending,
    /// Write handler succeeded; waiting for `txid` in the stream.
    Confirming { txid: Txid },
    /// The stream delivered the matching transaction.
    Confirmed { txid: Txid },
    /// Overlay removed; `reason` says why.
    RolledBack { reason: ErrorKind },
}

impl MutationState {
    /// Check if the mutation has finished either way.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MutationState::Confirmed { .. } | MutationState::RolledBack { .. })
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationState::Pending => write!(f, "Pending"),
            MutationState::Confirming { txid } => write!(f, "Confirming({})", txid),
            MutationState::Confirmed { txid } => write!(f, "Confirmed({})", txid),
            MutationState::RolledBack { reason } => write!(f, "RolledBack({})", reason),
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutationOptions {
    /// Replaces the collection's confirmation timeout for this mutation.
    pub confirmation_timeout: Option<Duration>,
}

impl MutationOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            confirmation_timeout: Some(timeout),
        }
    }
}

/// Handle to an accepted mutation.
///
/// Returned once the write handler has acknowledged the write. The
/// optimistic row is already visible. Await [`confirmed`](Self::confirmed)
/// for the full round trip; dropping the handle doesn't cancel anything.
#[derive(Debug)]
pub struct MutationHandle {
    id: MutationId,
    key: Key,
    kind: ChangeOp,
    txid: Txid,
    state: watch::Receiver<MutationState>,
    done: oneshot::Receiver<Result<Txid>>,
}

impl MutationHandle {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn kind(&self) -> ChangeOp {
        self.kind
    }

    /// Confirmation token returned by the write handler.
    pub fn txid(&self) -> Txid {
        self.txid
    }

    /// Current state.
    pub fn state(&self) -> MutationState {
        *self.state.borrow()
    }

    /// Wait until the mutation is confirmed or rolled back.
    ///
    /// Errors are `ConfirmationTimeout` or `Cancelled`.
    pub async fn confirmed(self) -> Result<Txid> {
        match self.done.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SyncError::Cancelled {
                key: self.key.to_string(),
            }),
        }
    }
}

/// A local write before validation.
#[derive(Debug, Clone)]
pub(crate) struct Proposal {
    pub kind: ChangeOp,
    pub key: Key,
    /// Full row (insert), patch (update), or empty (delete).
    pub changes: Row,
}

struct InFlight {
    key: Key,
    kind: ChangeOp,
    started: Instant,
    state: watch::Sender<MutationState>,
    done: Option<oneshot::Sender<Result<Txid>>>,
    timer: Option<AbortHandle>,
    _guard: OwnedMutexGuard<()>,
}

impl InFlight {
    fn set_state(&self, state: MutationState) {
        self.state.send_replace(state);
    }

    /// Publish the outcome and release the key.
    fn finish(mut self, outcome: Result<Txid>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let state = match &outcome {
            Ok(txid) => MutationState::Confirmed { txid: *txid },
            Err(e) => MutationState::RolledBack { reason: e.kind() },
        };
        self.set_state(state);
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

/// Bounded memory of txids the stream has delivered.
#[derive(Debug)]
struct SeenTxids {
    recent: VecDeque<Txid>,
    members: HashSet<Txid>,
    capacity: usize,
    max: Option<Txid>,
}

impl SeenTxids {
    fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity.min(4096)),
            members: HashSet::new(),
            capacity,
            max: None,
        }
    }

    fn record(&mut self, txid: Txid) {
        self.max = Some(self.max.map_or(txid, |m| m.max(txid)));
        if self.capacity == 0 || !self.members.insert(txid) {
            return;
        }
        self.recent.push_back(txid);
        if self.recent.len() > self.capacity {
            if let Some(old) = self.recent.pop_front() {
                self.members.remove(&old);
            }
        }
    }

    fn confirms(&self, token: Txid, rule: TxidMatch) -> bool {
        match rule {
            TxidMatch::Exact => self.members.contains(&token),
            TxidMatch::AtLeast => self.max.map_or(false, |m| m >= token),
        }
    }
}

/// Coordinates optimistic mutations for one collection.
pub struct MutationCoordinator {
    collection: String,
    config: MutationConfig,
    key_locks: DashMap<Key, Arc<tokio::sync::Mutex<()>>>,
    inflight: Mutex<HashMap<MutationId, InFlight>>,
    seen: Mutex<SeenTxids>,
    next_id: AtomicU64,
}

impl MutationCoordinator {
    pub(crate) fn new(collection: &str, config: MutationConfig) -> Self {
        Self {
            collection: collection.to_string(),
            seen: Mutex::new(SeenTxids::new(config.seen_txid_window)),
            config,
            key_locks: DashMap::new(),
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<MutationId, InFlight>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn seen(&self) -> MutexGuard<'_, SeenTxids> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of mutations not yet confirmed or rolled back.
    pub fn pending(&self) -> usize {
        self.inflight().len()
    }

    /// State of an in-flight mutation.
    pub fn state(&self, id: MutationId) -> Option<MutationState> {
        self.inflight().get(&id).map(|e| *e.state.borrow())
    }

    fn key_lock(&self, key: &Key) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the key's lock entry if nobody holds or waits on it.
    fn release_key(&self, key: &Key) {
        self.key_locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn update_gauge(&self, pending: usize) {
        metrics::set_inflight_mutations(&self.collection, pending);
    }

    /// Run one mutation up to the write handler's acknowledgement.
    pub(crate) async fn propose(
        &self,
        shared: &Arc<Shared>,
        proposal: Proposal,
        options: MutationOptions,
    ) -> Result<MutationHandle> {
        let Proposal { kind, key, changes } = proposal;

        let lock = self.key_lock(&key);
        let guard = match self.config.conflict_policy {
            ConflictPolicy::Queue => lock.lock_owned().await,
            ConflictPolicy::RejectConcurrent => match lock.try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    metrics::record_mutation(&self.collection, kind.as_str(), "conflict");
                    debug!(collection = %self.collection, key = %key, "Rejecting concurrent mutation");
                    return Err(SyncError::ConflictingKeyMutation { key: key.to_string() });
                }
            },
        };

        let id = MutationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (state_tx, state_rx) = watch::channel(MutationState::Pending);
        let (done_tx, done_rx) = oneshot::channel();
        let upsert = self.config.upsert;

        let installed = shared.with_store_mut(|store| {
            if shared.is_closed() {
                return (Err(SyncError::Cancelled { key: key.to_string() }), ChangeSet::new());
            }
            let original = store.get(&key).cloned();
            let (modified, overlay) = match prepare(kind, &key, original.as_ref(), &changes, upsert) {
                Ok(prepared) => prepared,
                Err(e) => return (Err(e), ChangeSet::new()),
            };
            store.set_overlay(key.clone(), id, overlay);

            let mut inflight = self.inflight();
            inflight.insert(
                id,
                InFlight {
                    key: key.clone(),
                    kind,
                    started: Instant::now(),
                    state: state_tx,
                    done: Some(done_tx),
                    timer: None,
                    _guard: guard,
                },
            );
            self.update_gauge(inflight.len());

            let intent = MutationIntent {
                collection: self.collection.clone(),
                mutation_id: id,
                kind,
                key: key.clone(),
                original,
                modified,
                changes,
            };
            (Ok(intent), ChangeSet::from([key.clone()]))
        });

        let intent = match installed {
            Ok(intent) => intent,
            Err(e) => {
                self.release_key(&key);
                metrics::record_mutation(&self.collection, kind.as_str(), "validation");
                return Err(e);
            }
        };

        debug!(collection = %self.collection, mutation_id = %id, key = %key, kind = %kind, "Optimistic mutation applied");

        let abandoned = RollbackOnDrop {
            coordinator: self,
            shared: shared.as_ref(),
            id,
            key: key.clone(),
            armed: true,
        };
        let dispatched = tokio::select! {
            result = write::dispatch(shared.writer.as_ref(), intent) => Some(result),
            _ = shared.closed() => None,
        };
        abandoned.disarm();

        let Some(ack) = dispatched else {
            // close() already rolled the mutation back
            return Err(SyncError::Cancelled { key: key.to_string() });
        };

        let ack = match ack {
            Ok(ack) => ack,
            Err(e) => {
                warn!(collection = %self.collection, mutation_id = %id, key = %key, error = %e, "Write handler rejected mutation");
                let error = SyncError::WriteRejected {
                    key: key.to_string(),
                    message: e.0.clone(),
                };
                self.rollback(shared, id, error);
                metrics::record_mutation(&self.collection, kind.as_str(), "write_rejected");
                return Err(SyncError::WriteRejected {
                    key: key.to_string(),
                    message: e.0,
                });
            }
        };

        let txid = ack.txid;
        let rule = self.config.txid_match;
        let registered = shared.with_store_mut(|store| {
            let mut inflight = self.inflight();
            if !inflight.contains_key(&id) {
                return (Registration::Gone, ChangeSet::new());
            }
            if self.seen().confirms(txid, rule) {
                let mut changed = ChangeSet::new();
                if let Some(entry) = inflight.remove(&id) {
                    if store.clear_overlay(&entry.key, id) {
                        changed.insert(entry.key.clone());
                    }
                    self.record_confirmed(&entry);
                    entry.finish(Ok(txid));
                }
                self.update_gauge(inflight.len());
                (Registration::Confirmed, changed)
            } else {
                if let Some(entry) = inflight.get(&id) {
                    entry.set_state(MutationState::Confirming { txid });
                }
                (Registration::Waiting, ChangeSet::new())
            }
        });

        match registered {
            Registration::Gone => {
                return Err(SyncError::Cancelled { key: key.to_string() });
            }
            Registration::Confirmed => {
                self.release_key(&key);
                debug!(collection = %self.collection, mutation_id = %id, txid = %txid, "Txid already observed, confirmed on ack");
            }
            Registration::Waiting => {
                let timeout = options
                    .confirmation_timeout
                    .unwrap_or_else(|| self.config.confirmation_timeout_duration());
                let timer = {
                    let shared = Arc::clone(shared);
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        shared.mutations.expire(&shared, id, timeout);
                    })
                };
                let mut inflight = self.inflight();
                match inflight.get_mut(&id) {
                    Some(entry) => entry.timer = Some(timer.abort_handle()),
                    None => timer.abort(),
                }
                debug!(collection = %self.collection, mutation_id = %id, txid = %txid, timeout = ?timeout, "Awaiting confirmation");
            }
        }

        Ok(MutationHandle {
            id,
            key,
            kind,
            txid,
            state: state_rx,
            done: done_rx,
        })
    }

    fn record_confirmed(&self, entry: &InFlight) {
        metrics::record_mutation(&self.collection, entry.kind.as_str(), "confirmed");
        metrics::record_confirmation_latency(&self.collection, entry.started.elapsed());
    }

    /// Remove a mutation's overlay and fail it with `error`.
    fn rollback(&self, shared: &Shared, id: MutationId, error: SyncError) -> Option<ChangeOp> {
        self.rollback_with(shared, id, |_| Some(error))
    }

    /// Roll back if `decide` returns an error for the current entry.
    ///
    /// The decision and the rollback happen in one store critical section,
    /// so a confirmation can't slip in between. Returns the mutation kind
    /// if it was rolled back.
    fn rollback_with<F>(&self, shared: &Shared, id: MutationId, decide: F) -> Option<ChangeOp>
    where
        F: FnOnce(&InFlight) -> Option<SyncError>,
    {
        let rolled = shared.with_store_mut(|store| {
            let mut inflight = self.inflight();
            let Some(error) = inflight.get(&id).and_then(decide) else {
                return (None, ChangeSet::new());
            };
            let Some(entry) = inflight.remove(&id) else {
                return (None, ChangeSet::new());
            };
            self.update_gauge(inflight.len());
            let mut changed = ChangeSet::new();
            if store.clear_overlay(&entry.key, id) {
                changed.insert(entry.key.clone());
            }
            let rolled = (entry.key.clone(), entry.kind);
            entry.finish(Err(error));
            (Some(rolled), changed)
        });
        rolled.map(|(key, kind)| {
            self.release_key(&key);
            kind
        })
    }

    /// Timer callback: roll back if still unconfirmed.
    fn expire(&self, shared: &Shared, id: MutationId, timeout: Duration) {
        let collection = &self.collection;
        let expired = self.rollback_with(shared, id, |entry| match *entry.state.borrow() {
            MutationState::Confirming { txid } => {
                warn!(collection = %collection, mutation_id = %id, key = %entry.key, txid = %txid, timeout = ?timeout, "Confirmation timed out, rolling back");
                Some(SyncError::ConfirmationTimeout {
                    key: entry.key.to_string(),
                    txid,
                    timeout,
                })
            }
            _ => None,
        });
        if let Some(kind) = expired {
            metrics::record_mutation(&self.collection, kind.as_str(), "confirmation_timeout");
        }
    }

    /// Confirm mutations whose tokens match `txids`.
    ///
    /// Must be called with the store write lock held, after the batch that
    /// carried the txids was applied. Returns keys whose overlay was removed.
    pub(crate) fn on_txids(&self, store: &mut LocalStore, txids: &[Txid]) -> ChangeSet {
        let mut changed = ChangeSet::new();
        if txids.is_empty() {
            return changed;
        }
        {
            let mut seen = self.seen();
            for txid in txids {
                seen.record(*txid);
            }
        }

        let rule = self.config.txid_match;
        let mut inflight = self.inflight();
        let matched: Vec<(MutationId, Txid)> = inflight
            .iter()
            .filter_map(|(id, entry)| match *entry.state.borrow() {
                MutationState::Confirming { txid } if txids.iter().any(|t| rule.matches(txid, *t)) => {
                    Some((*id, txid))
                }
                _ => None,
            })
            .collect();

        for (id, txid) in matched {
            let Some(entry) = inflight.remove(&id) else {
                continue;
            };
            if store.clear_overlay(&entry.key, id) {
                changed.insert(entry.key.clone());
            }
            debug!(collection = %self.collection, mutation_id = %id, key = %entry.key, txid = %txid, "Mutation confirmed");
            self.record_confirmed(&entry);
            let key = entry.key.clone();
            entry.finish(Ok(txid));
            self.release_key(&key);
        }
        self.update_gauge(inflight.len());
        changed
    }

    /// Fail every in-flight mutation as cancelled.
    ///
    /// Must be called with the store write lock held.
    pub(crate) fn cancel_all(&self, store: &mut LocalStore) -> ChangeSet {
        let mut changed = ChangeSet::new();
        let drained: Vec<(MutationId, InFlight)> = self.inflight().drain().collect();
        if !drained.is_empty() {
            info!(collection = %self.collection, count = drained.len(), "Cancelling in-flight mutations");
        }
        for (id, entry) in drained {
            if store.clear_overlay(&entry.key, id) {
                changed.insert(entry.key.clone());
            }
            metrics::record_mutation(&self.collection, entry.kind.as_str(), "cancelled");
            let key = entry.key.clone();
            entry.finish(Err(SyncError::Cancelled { key: key.to_string() }));
            self.release_key(&key);
        }
        self.update_gauge(0);
        changed
    }
}

enum Registration {
    Waiting,
    Confirmed,
    Gone,
}

/// Rolls a mutation back as cancelled if `propose` is dropped while the
/// write handler is still running.
struct RollbackOnDrop<'a> {
    coordinator: &'a MutationCoordinator,
    shared: &'a Shared,
    id: MutationId,
    key: Key,
    armed: bool,
}

impl RollbackOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let coordinator = self.coordinator;
        let error = SyncError::Cancelled {
            key: self.key.to_string(),
        };
        if let Some(kind) = coordinator.rollback(self.shared, self.id, error) {
            warn!(collection = %coordinator.collection, mutation_id = %self.id, key = %self.key, "Caller dropped mutation before acknowledgement, rolled back");
            metrics::record_mutation(&coordinator.collection, kind.as_str(), "cancelled");
        }
    }
}

/// Validate a proposal against the current effective row and build the
/// overlay value. Returns the resulting row (for the write intent) too.
fn prepare(
    kind: ChangeOp,
    key: &Key,
    original: Option<&Row>,
    changes: &Row,
    upsert: bool,
) -> Result<(Option<Row>, OverlayValue)> {
    match kind {
        ChangeOp::Insert => {
            if original.is_some() && !upsert {
                return Err(SyncError::KeyExists(key.to_string()));
            }
            Ok((Some(changes.clone()), OverlayValue::Upsert(changes.clone())))
        }
        ChangeOp::Update => {
            let mut row = original
                .cloned()
                .ok_or_else(|| SyncError::KeyNotFound(key.to_string()))?;
            merge_row(&mut row, changes);
            Ok((Some(row.clone()), OverlayValue::Upsert(row)))
        }
        ChangeOp::Delete => {
            if original.is_none() {
                return Err(SyncError::KeyNotFound(key.to_string()));
            }
            Ok((None, OverlayValue::Tombstone))
        }
    }
}
