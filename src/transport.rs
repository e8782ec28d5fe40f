// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shape transport: where change batches come from.
//!
//! The ingestion task asks a [`ShapeTransport`] for the next batch after its
//! cursor. Two implementations ship with the crate:
//!
//! - [`HttpShapeTransport`] speaks the shape log HTTP protocol
//!   (`GET /v1/shape`, long-polling once caught up).
//! - [`MemoryShapeSource`] is an in-process log with its own table, commit
//!   API, compaction and failure injection. Tests and demos drive it as the
//!   "server".
//!
//! # Request/Response Contract
//!
//! | Request cursor | Response |
//! |----------------|----------|
//! | offset `-1` | full snapshot as inserts, then `up-to-date` |
//! | valid handle + offset | changes after the offset; `up-to-date` once at head |
//! | at head, `live` | waits up to `timeout` for new changes, else empty `up-to-date` |
//! | stale handle / compacted | `Err(CursorInvalid)` or a `must-refetch` control message |
//!
//! "Nothing new yet" is always an `Ok` batch; only invalidation is distinct.

use crate::cursor::{Offset, ShapeCursor};
use crate::error::{Result, SyncError};
use crate::shape::ShapeDefinition;
use crate::store::{apply_change, Key, Row};
use crate::stream::{parse_messages, ChangeEvent, ChangeOp, Control, ShapeBatch, ShapeMessage, Txid};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One request for the next batch of a shape.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Shape to read.
    pub shape: ShapeDefinition,
    /// Where to resume from.
    pub cursor: ShapeCursor,
    /// Hold the request open until new data arrives (long-poll).
    pub live: bool,
    /// Upper bound on how long a live request is held open.
    pub timeout: Duration,
}

/// Source of shape batches.
pub trait ShapeTransport: Send + Sync + 'static {
    /// Fetch the next batch after `request.cursor`.
    ///
    /// Returns `Err(SyncError::CursorInvalid)` (or a batch carrying a
    /// `must-refetch` control message) when the cursor can't be resumed.
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, ShapeBatch>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-process shape source
// ═══════════════════════════════════════════════════════════════════════════════

/// Predicate standing in for a shape's `WHERE` clause.
pub type RowFilter = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

/// How a [`MemoryShapeSource`] tells clients their cursor is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invalidation {
    /// `Err(CursorInvalid)`, like an HTTP 409.
    Error,
    /// A batch holding a single `must-refetch` control message.
    Control,
}

struct SourceState {
    generation: u64,
    handle: String,
    lsn: u64,
    head: Offset,
    next_txid: u64,
    rows: BTreeMap<Key, Row>,
    log: Vec<ChangeEvent>,
    chunk_size: usize,
    redelivery: usize,
    invalidation: Invalidation,
    filter: Option<RowFilter>,
    requests: Vec<ShapeCursor>,
}

/// In-memory shape log with a commit API.
///
/// Each commit is one transaction: it gets the next LSN, one txid, and one
/// log entry per change (op index within the LSN). When a row filter is
/// set, rows moving into or out of the filter are logged as inserts and
/// deletes, the way a filtered shape behaves.
///
/// ```rust
/// use sync_collection::transport::MemoryShapeSource;
/// use sync_collection::store::Row;
///
/// let source = MemoryShapeSource::new("todos");
/// let mut row = Row::new();
/// row.insert("id".into(), "todo-1".into());
/// let txid = source.transaction().insert("todo-1", row).txid(42u64).commit();
/// assert_eq!(txid.0, 42);
/// ```
pub struct MemoryShapeSource {
    table: String,
    state: Mutex<SourceState>,
    notify: Notify,
    pending_failures: AtomicUsize,
}

impl MemoryShapeSource {
    /// Create an empty source for `table`.
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            state: Mutex::new(SourceState {
                generation: 1,
                handle: format!("{}-1", table),
                lsn: 0,
                head: Offset::new(0, 0),
                next_txid: 1000,
                rows: BTreeMap::new(),
                log: Vec::new(),
                chunk_size: usize::MAX,
                redelivery: 0,
                invalidation: Invalidation::Error,
                filter: None,
                requests: Vec::new(),
            }),
            table,
            notify: Notify::new(),
            pending_failures: AtomicUsize::new(0),
        }
    }

    /// Only rows matching `filter` are part of the shape.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        state.filter = Some(Arc::new(filter));
        self
    }

    fn state(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a transaction.
    pub fn transaction(&self) -> SourceTxn<'_> {
        SourceTxn {
            source: self,
            ops: Vec::new(),
            txid: None,
        }
    }

    /// Commit a single insert.
    pub fn insert(&self, key: impl Into<Key>, row: Row) -> Txid {
        self.transaction().insert(key, row).commit()
    }

    /// Commit a single partial update.
    pub fn update(&self, key: impl Into<Key>, patch: Row) -> Txid {
        self.transaction().update(key, patch).commit()
    }

    /// Commit a single delete.
    pub fn delete(&self, key: impl Into<Key>) -> Txid {
        self.transaction().delete(key).commit()
    }

    /// Drop the log and rotate the handle. Every outstanding cursor becomes
    /// invalid and is answered with `CursorInvalid`.
    pub fn compact(&self) {
        self.rotate(Invalidation::Error);
    }

    /// Like [`compact`](Self::compact), but stale cursors get a
    /// `must-refetch` control message instead of an error.
    pub fn compact_with_must_refetch(&self) {
        self.rotate(Invalidation::Control);
    }

    fn rotate(&self, invalidation: Invalidation) {
        {
            let mut st = self.state();
            st.generation += 1;
            st.handle = format!("{}-{}", self.table, st.generation);
            st.log.clear();
            st.invalidation = invalidation;
            debug!(table = %self.table, handle = %st.handle, "Shape log compacted");
        }
        self.notify.notify_waiters();
    }

    /// Fail the next `n` fetches with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Limit how many log entries one response carries.
    pub fn set_chunk_size(&self, n: usize) {
        self.state().chunk_size = n.max(1);
    }

    /// Re-send up to `n` already delivered entries at the start of each
    /// catch-up response (at-least-once delivery).
    pub fn set_redelivery(&self, n: usize) {
        self.state().redelivery = n;
    }

    /// Current shape handle.
    pub fn handle(&self) -> String {
        self.state().handle.clone()
    }

    /// Offset of the newest log entry.
    pub fn head(&self) -> Offset {
        self.state().head
    }

    /// Current committed row for a key, ignoring the filter.
    pub fn row(&self, key: &str) -> Option<Row> {
        self.state().rows.get(key).cloned()
    }

    /// Cursors received so far, in request order.
    pub fn requests(&self) -> Vec<ShapeCursor> {
        self.state().requests.clone()
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Build a response if there is something to say. `None` means the
    /// cursor is at head.
    fn serve(&self, request: &FetchRequest) -> Result<Option<ShapeBatch>> {
        let st = self.state();
        let cursor = &request.cursor;

        if cursor.is_initial() {
            let mut batch = ShapeBatch::new(Some(st.handle.clone()), st.head);
            for (key, row) in &st.rows {
                if in_shape(&st.filter, row) {
                    batch.push_change(ChangeEvent::insert(st.head, key.clone(), row.clone()));
                }
            }
            batch.push_up_to_date();
            trace!(table = %self.table, rows = batch.messages.len() - 1, "Serving snapshot");
            return Ok(Some(batch));
        }

        if cursor.handle.as_deref() != Some(st.handle.as_str()) {
            return match st.invalidation {
                Invalidation::Error => Err(SyncError::CursorInvalid {
                    shape_id: request.shape.shape_id(),
                }),
                Invalidation::Control => {
                    let mut batch = ShapeBatch::new(None, Offset::Initial);
                    batch.messages.push(ShapeMessage::Control(Control::MustRefetch));
                    Ok(Some(batch))
                }
            };
        }

        let fresh = st.log.partition_point(|e| e.offset <= cursor.offset);
        if fresh >= st.log.len() {
            return Ok(None);
        }
        let start = fresh.saturating_sub(st.redelivery);
        let end = fresh.saturating_add(st.chunk_size).min(st.log.len());

        let last = st.log[end - 1].offset;
        let mut batch = ShapeBatch::new(Some(st.handle.clone()), last);
        for event in &st.log[start..end] {
            batch.push_change(event.clone());
        }
        if end == st.log.len() {
            batch.push_up_to_date();
        }
        Ok(Some(batch))
    }
}

fn in_shape(filter: &Option<RowFilter>, row: &Row) -> bool {
    filter.as_ref().map_or(true, |f| f(row))
}

impl ShapeTransport for MemoryShapeSource {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, ShapeBatch> {
        Box::pin(async move {
            if request.shape.table != self.table {
                return Err(SyncError::transport_msg(
                    "fetch",
                    format!("unknown table {}", request.shape.table),
                ));
            }
            if self.take_failure() {
                return Err(SyncError::transport_msg("fetch", "connection reset (injected)"));
            }
            self.state().requests.push(request.cursor.clone());

            let deadline = tokio::time::Instant::now() + request.timeout;
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(batch) = self.serve(&request)? {
                    return Ok(batch);
                }
                if !request.live || tokio::time::timeout_at(deadline, notified).await.is_err() {
                    let mut batch = ShapeBatch::new(request.cursor.handle.clone(), request.cursor.offset);
                    batch.push_up_to_date();
                    return Ok(batch);
                }
            }
        })
    }
}

/// A multi-change transaction against a [`MemoryShapeSource`].
pub struct SourceTxn<'a> {
    source: &'a MemoryShapeSource,
    ops: Vec<(ChangeOp, Key, Option<Row>)>,
    txid: Option<Txid>,
}

impl SourceTxn<'_> {
    pub fn insert(mut self, key: impl Into<Key>, row: Row) -> Self {
        self.ops.push((ChangeOp::Insert, key.into(), Some(row)));
        self
    }

    pub fn update(mut self, key: impl Into<Key>, patch: Row) -> Self {
        self.ops.push((ChangeOp::Update, key.into(), Some(patch)));
        self
    }

    pub fn delete(mut self, key: impl Into<Key>) -> Self {
        self.ops.push((ChangeOp::Delete, key.into(), None));
        self
    }

    /// Use a specific txid instead of the next one.
    pub fn txid(mut self, txid: impl Into<Txid>) -> Self {
        self.txid = Some(txid.into());
        self
    }

    /// Apply and log the transaction, waking long-polling readers.
    pub fn commit(self) -> Txid {
        let source = self.source;
        let txid = {
            let mut st = source.state();
            st.lsn += 1;
            let lsn = st.lsn;
            let txid = self.txid.unwrap_or(Txid(st.next_txid));
            st.next_txid = st.next_txid.max(txid.0.saturating_add(1));
            let filter = st.filter.clone();

            let mut op_index = 0;
            for (op, key, value) in self.ops {
                let was_in = st.rows.get(&key).map_or(false, |r| in_shape(&filter, r));
                apply_change(&mut st.rows, op, &key, value.as_ref());
                let now = st.rows.get(&key).filter(|r| in_shape(&filter, r)).cloned();

                let offset = Offset::new(lsn, op_index);
                let event = match (was_in, now) {
                    (false, None) => continue,
                    (true, None) => ChangeEvent::delete(offset, key),
                    (false, Some(row)) => ChangeEvent::insert(offset, key, row),
                    (true, Some(row)) => match (op, value) {
                        (ChangeOp::Update, Some(patch)) => ChangeEvent::update(offset, key, patch),
                        _ => ChangeEvent::insert(offset, key, row),
                    },
                };
                st.log.push(event.with_txid(txid));
                st.head = offset;
                op_index += 1;
            }
            trace!(table = %source.table, lsn, txid = %txid, changes = op_index, "Committed");
            txid
        };
        source.notify.notify_waiters();
        txid
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP shape log client
// ═══════════════════════════════════════════════════════════════════════════════

const HEADER_HANDLE: &str = "electric-handle";
const HEADER_OFFSET: &str = "electric-offset";
const HEADER_UP_TO_DATE: &str = "electric-up-to-date";

/// Extra time on top of the long-poll window before the client gives up.
const LONG_POLL_GRACE: Duration = Duration::from_secs(5);

/// Client for the shape log HTTP API.
///
/// ```text
/// GET {base}/v1/shape?table=todos&where=...&params[1]=...&offset=1200_3&handle=h&live=true
///
/// 200  JSON array of messages; electric-handle / electric-offset headers
/// 204  nothing new (live request timed out)
/// 409  handle/offset no longer valid: resnapshot
/// ```
#[derive(Debug, Clone)]
pub struct HttpShapeTransport {
    client: reqwest::Client,
    base_url: String,
    headers: Vec<(String, String)>,
}

impl HttpShapeTransport {
    /// Create a transport with a default HTTP client.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::transport("client_build", e))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a transport around an existing client.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: Vec::new(),
        }
    }

    /// Send an extra header (e.g. authorization) with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Full shape endpoint URL.
    pub fn endpoint(&self) -> String {
        format!("{}/v1/shape", self.base_url)
    }

    async fn fetch_inner(&self, request: FetchRequest) -> Result<ShapeBatch> {
        let mut builder = self
            .client
            .get(self.endpoint())
            .query(&shape_query(&request));
        if request.live {
            builder = builder.timeout(request.timeout + LONG_POLL_GRACE);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SyncError::transport("GET /v1/shape", e))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(SyncError::CursorInvalid {
                shape_id: request.shape.shape_id(),
            });
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let handle = header(HEADER_HANDLE).or_else(|| request.cursor.handle.clone());
        let offset = match header(HEADER_OFFSET) {
            Some(raw) => raw.parse().map_err(|e| {
                SyncError::transport_msg("GET /v1/shape", format!("bad {} header: {}", HEADER_OFFSET, e))
            })?,
            None => request.cursor.offset,
        };
        let up_to_date_header = header(HEADER_UP_TO_DATE).is_some();

        if status == reqwest::StatusCode::NO_CONTENT {
            let mut batch = ShapeBatch::new(handle, offset);
            batch.push_up_to_date();
            return Ok(batch);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::transport_msg(
                "GET /v1/shape",
                format!("HTTP {}: {}", status, body),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SyncError::transport("read body", e))?;
        let mut batch = ShapeBatch::new(handle, offset);
        batch.messages = parse_messages(&body, offset)?;
        if up_to_date_header && !batch.is_up_to_date() {
            batch.push_up_to_date();
        }
        Ok(batch)
    }
}

impl ShapeTransport for HttpShapeTransport {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, ShapeBatch> {
        Box::pin(self.fetch_inner(request))
    }
}

/// Query parameters for a shape request.
pub fn shape_query(request: &FetchRequest) -> Vec<(String, String)> {
    let shape = &request.shape;
    let mut query = vec![("table".to_string(), shape.table.clone())];
    if let Some(clause) = &shape.where_clause {
        query.push(("where".to_string(), clause.clone()));
    }
    for (i, param) in shape.params.iter().enumerate() {
        query.push((format!("params[{}]", i + 1), param.clone()));
    }
    if let Some(columns) = &shape.columns {
        query.push(("columns".to_string(), columns.join(",")));
    }
    query.push(("offset".to_string(), request.cursor.offset.to_string()));
    if let Some(handle) = &request.cursor.handle {
        if !request.cursor.is_initial() {
            query.push(("handle".to_string(), handle.clone()));
        }
    }
    if request.live {
        query.push(("live".to_string(), "true".to_string()));
    }
    query
}
