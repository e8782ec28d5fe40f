//! Ingestion: tailing the shape log into the local store.
//!
//! Each collection has one ingestion task that:
//! 1. Fetches the next batch after the store's cursor
//! 2. Applies it to the base and advances the cursor in one critical section
//! 3. Confirms mutations whose txids appear in the batch
//! 4. Switches to long-polling once the shape is up to date
//!
//! # Resnapshot
//!
//! When the source can't resume from the cursor (`CursorInvalid` or a
//! `must-refetch` control message) the shape is loaded again from scratch.
//! Before the first catch-up the base is simply reset. After it, the new
//! snapshot is staged in a side store and swapped in at its up-to-date
//! marker, so live queries see one diff instead of an empty collection.
//!
//! # Failures
//!
//! Transport errors are retried with exponential backoff. Meanwhile the
//! collection keeps serving its last state and live queries are flagged
//! stale. With bounded retries the collection ends up `Failed`.
//!
//! # Graceful Shutdown
//!
//! The task selects on the shutdown signal around every fetch and backoff
//! sleep, so close() interrupts a held long-poll immediately.

use super::{CollectionStatus, Shared};
use crate::cursor::ShapeCursor;
use crate::error::SyncError;
use crate::metrics;
use crate::store::LocalStore;
use crate::stream::{ShapeBatch, Txid};
use crate::transport::{FetchRequest, ShapeTransport};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A snapshot being loaded next to the live store.
struct Staging {
    store: LocalStore,
    txids: Vec<Txid>,
}

/// Run the ingestion loop for one collection until shutdown, or until
/// retries are exhausted.
pub(crate) async fn run_ingest(shared: Arc<Shared>, transport: Arc<dyn ShapeTransport>) {
    let shape = shared.config.shape.clone();
    let span = info_span!("ingest", collection = %shared.id, shape_id = %shape.shape_id());

    async move {
        info!("Starting ingestion");

        let config = shared.config.ingest.clone();
        let retry = config.retry_config();
        let long_poll = config.long_poll_timeout_duration();
        let mut shutdown_rx = shared.shutdown_receiver();

        let mut caught_up = false;
        let mut failures = 0usize;
        let mut staging: Option<Staging> = None;

        shared.set_status(CollectionStatus::Loading);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let cursor = match &staging {
                Some(stage) => stage.store.cursor().clone(),
                None => shared.read_store().cursor().clone(),
            };
            let live = caught_up && config.live && staging.is_none();
            debug!(cursor = %cursor, live, "Fetching");
            let request = FetchRequest {
                shape: shape.clone(),
                cursor,
                live,
                timeout: long_poll,
            };

            let started = Instant::now();
            let result = tokio::select! {
                biased;

                _ = shutdown_rx.wait_for(|closed| *closed) => {
                    info!("Shutdown signal received during fetch");
                    break;
                }

                result = transport.fetch(request) => result,
            };
            metrics::record_fetch_latency(&shared.id, live, started.elapsed());

            match result {
                Ok(batch) => {
                    if failures > 0 {
                        info!(attempts = failures, "Shape source reachable again");
                    }
                    failures = 0;
                    shared.mark_recovered();

                    if batch.must_refetch() {
                        begin_resnapshot(&shared, &mut staging, "must-refetch");
                        caught_up = false;
                        continue;
                    }

                    let up_to_date = batch.is_up_to_date();
                    match staging.as_mut() {
                        Some(stage) => apply_staged(&shared, stage, &batch),
                        None => apply_live(&shared, &batch),
                    }

                    if !up_to_date {
                        caught_up = false;
                        continue;
                    }
                    if let Some(stage) = staging.take() {
                        swap_in(&shared, stage);
                    }
                    if !caught_up {
                        debug!("Caught up with shape");
                    }
                    caught_up = true;
                    shared.set_status(CollectionStatus::Ready);

                    if !config.live {
                        info!("Shape loaded, live updates disabled");
                        break;
                    }
                }
                Err(SyncError::CursorInvalid { .. }) => {
                    begin_resnapshot(&shared, &mut staging, "cursor-invalid");
                    caught_up = false;
                }
                Err(e) => {
                    failures += 1;
                    metrics::record_transport_error(&shared.id);
                    shared.mark_stale();

                    if !retry.should_retry(failures) {
                        error!(attempts = failures, error = %e, "Giving up on shape source");
                        shared.set_status(CollectionStatus::Failed);
                        break;
                    }

                    let delay = retry.delay_for_attempt(failures);
                    warn!(attempt = failures, delay = ?delay, error = %e, "Fetch failed, retrying");
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.wait_for(|closed| *closed) => {
                            info!("Shutdown signal received during backoff");
                            break;
                        }

                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Ingestion stopped");
    }
    .instrument(span)
    .await
}

/// Apply a batch to the live store, confirm mutations and wake queries.
fn apply_live(shared: &Shared, batch: &ShapeBatch) {
    let up_to_date = batch.is_up_to_date();
    let (applied, skipped) = shared.with_store_mut(|store| {
        let result = store.apply_changes(batch.changes(), batch.handle.as_deref(), batch.offset, |change| {
            shared.resolve_key(change)
        });
        let mut changed = result.changed;
        changed.extend(shared.mutations.on_txids(store, &result.txids));
        metrics::set_base_rows(&shared.id, store.base_len());

        if up_to_date && !shared.queries.is_ready() {
            // Every query is evaluated from scratch; no diff needed
            shared.queries.mark_ready(store);
            changed.clear();
        }
        ((result.applied, result.skipped), changed)
    });

    metrics::record_batch_applied(&shared.id, applied, skipped);
    if skipped > 0 {
        debug!(applied, skipped, "Skipped redelivered changes");
    } else if applied > 0 {
        debug!(applied, "Applied batch");
    }
}

/// Apply a batch to a staged snapshot. Nothing is visible until swap_in.
fn apply_staged(shared: &Shared, stage: &mut Staging, batch: &ShapeBatch) {
    let result = stage
        .store
        .apply_changes(batch.changes(), batch.handle.as_deref(), batch.offset, |change| {
            shared.resolve_key(change)
        });
    metrics::record_batch_applied(&shared.id, result.applied, result.skipped);
    stage.txids.extend(result.txids);
    debug!(applied = result.applied, staged_rows = stage.store.base_len(), "Staged snapshot batch");
}

/// Replace the base with a completed staged snapshot.
///
/// Overlays are left alone; mutations whose txids showed up in the
/// snapshot are confirmed in the same step.
fn swap_in(shared: &Shared, stage: Staging) {
    let Staging { store: staged, txids } = stage;
    let (base, cursor) = staged.into_parts();
    let rows = base.len();

    shared.with_store_mut(|store| {
        let mut changed = store.replace_base(base, cursor);
        changed.extend(shared.mutations.on_txids(store, &txids));
        metrics::set_base_rows(&shared.id, store.base_len());
        ((), changed)
    });
    info!(rows, "Swapped in fresh snapshot");
}

fn begin_resnapshot(shared: &Shared, staging: &mut Option<Staging>, reason: &str) {
    metrics::record_resnapshot(&shared.id);

    if shared.queries.is_ready() {
        warn!(reason, "Shape cursor invalidated, loading a fresh snapshot in the background");
        *staging = Some(Staging {
            store: LocalStore::new(),
            txids: Vec::new(),
        });
    } else {
        warn!(reason, "Shape cursor invalidated before first sync, restarting snapshot");
        shared.with_store_mut(|store| {
            let changed = store.replace_base(BTreeMap::new(), ShapeCursor::start());
            metrics::set_base_rows(&shared.id, 0);
            ((), changed)
        });
    }
}
