//! Live queries over a collection's effective rows.
//!
//! A [`QuerySpec`] is a predicate plus optional ordering, offset and limit.
//! Subscribing returns a [`LiveQuery`] stream (or registers a callback) that
//! yields a fresh [`QueryResult`] whenever the visible result changes.
//!
//! # Evaluation
//!
//! Each query keeps the set of matching rows and an ordered index of their
//! sort keys. A store change only touches the keys in its change set:
//!
//! ```text
//! ChangeSet {k1, k2}
//!   for k: drop old (row, sort key) if matched
//!          re-read effective row, insert if predicate holds
//!   rebuild window [offset .. offset+limit) from the ordered index
//!   emit only if the window differs from the last emission
//! ```
//!
//! # Delivery
//!
//! Results are computed while the store lock is held, so they always
//! describe a state some reader could have observed. They are queued and
//! delivered after the lock is released; callbacks may write back into the
//! collection without deadlocking.
//!
//! Nothing is emitted before the collection's first `up-to-date`.

use crate::metrics;
use crate::store::{ChangeSet, Key, LocalStore, Row};
use futures::Stream;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Row predicate.
pub type RowPredicate = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// What a live query selects.
///
/// ```rust
/// use sync_collection::query::{Direction, QuerySpec};
///
/// let open_todos = QuerySpec::all()
///     .where_eq("completed", false)
///     .order_by("created_at", Direction::Desc)
///     .limit(20);
/// # let _ = open_todos;
/// ```
#[derive(Clone, Default)]
pub struct QuerySpec {
    filters: Vec<RowPredicate>,
    order_by: Vec<(String, Direction)>,
    limit: Option<usize>,
    offset: usize,
}

impl QuerySpec {
    /// Every row, in key order.
    pub fn all() -> Self {
        Self::default()
    }

    /// Keep rows for which `predicate` holds. Multiple filters are ANDed.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(predicate));
        self
    }

    /// Keep rows whose `field` equals `value`.
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        let value = value.into();
        self.filter(move |row| row.get(&field).unwrap_or(&Value::Null) == &value)
    }

    /// Sort by a field. Later calls break ties of earlier ones; the row key
    /// breaks any remaining ties.
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push((field.into(), direction));
        self
    }

    /// At most `n` rows.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Skip the first `n` rows.
    pub fn offset(mut self, n: usize) -> Self {
        self.offset = n;
        self
    }

    /// Check if a row passes every filter.
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f(row))
    }

    fn sort_key(&self, key: &Key, row: &Row) -> SortKey {
        SortKey {
            values: self
                .order_by
                .iter()
                .map(|(field, direction)| SortValue {
                    value: row.get(field).cloned().unwrap_or(Value::Null),
                    direction: *direction,
                })
                .collect(),
            key: key.clone(),
        }
    }
}

impl fmt::Debug for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySpec")
            .field("filters", &self.filters.len())
            .field("order_by", &self.order_by)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Total order over JSON values.
///
/// `null < bool < number < string < array < object`; numbers compare
/// numerically, arrays and objects element-wise.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xa, ya) in x.iter().zip(y) {
                match compare_values(xa, ya) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y) {
                match xk.cmp(yk).then_with(|| compare_values(xv, yv)) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// JSON number without rounding integers through `f64`.
#[derive(Clone, Copy)]
enum Numeric {
    Int(i128),
    Float(f64),
}

impl Numeric {
    fn of(n: &serde_json::Number) -> Self {
        if let Some(i) = n.as_i64() {
            Numeric::Int(i128::from(i))
        } else if let Some(u) = n.as_u64() {
            Numeric::Int(i128::from(u))
        } else {
            Numeric::Float(n.as_f64().unwrap_or(f64::NAN))
        }
    }
}

fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    match (Numeric::of(a), Numeric::of(b)) {
        (Numeric::Int(x), Numeric::Int(y)) => x.cmp(&y),
        // -0.0 and 0.0 are the same value
        (Numeric::Float(x), Numeric::Float(y)) if x == y => Ordering::Equal,
        (Numeric::Float(x), Numeric::Float(y)) => x.total_cmp(&y),
        (Numeric::Int(i), Numeric::Float(f)) => compare_int_float(i, f),
        (Numeric::Float(f), Numeric::Int(i)) => compare_int_float(i, f).reverse(),
    }
}

/// Exact comparison of an integer with a float.
fn compare_int_float(i: i128, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Less;
    }
    let whole = f.trunc();
    // Saturates outside i128, where every JSON integer is already on one side
    match i.cmp(&(whole as i128)) {
        Ordering::Equal if f > whole => Ordering::Less,
        Ordering::Equal if f < whole => Ordering::Greater,
        other => other,
    }
}

#[derive(Debug, Clone)]
struct SortValue {
    value: Value,
    direction: Direction,
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let ord = compare_values(&self.value, &other.value);
        match self.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortValue {}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    values: Vec<SortValue>,
    key: Key,
}

/// One emission of a live query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    /// Matching rows in query order.
    pub rows: Vec<(Key, Row)>,
    /// The collection is serving its last known state while the shape
    /// source is unreachable.
    pub stale: bool,
    /// Emission counter for this query, starting at 1.
    pub version: u64,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keys in query order.
    pub fn keys(&self) -> Vec<&Key> {
        self.rows.iter().map(|(k, _)| k).collect()
    }

    /// First row, for single-row queries.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first().map(|(_, r)| r)
    }

    /// Row for a key, if it's in the result.
    pub fn get(&self, key: &str) -> Option<&Row> {
        self.rows.iter().find(|(k, _)| k.as_str() == key).map(|(_, r)| r)
    }
}

/// Incrementally maintained state of one query.
struct QueryState {
    spec: QuerySpec,
    matched: HashMap<Key, Row>,
    order: BTreeSet<SortKey>,
    window: Vec<(Key, Row)>,
}

impl QueryState {
    fn new(spec: QuerySpec) -> Self {
        Self {
            spec,
            matched: HashMap::new(),
            order: BTreeSet::new(),
            window: Vec::new(),
        }
    }

    /// Re-evaluate from scratch.
    fn rebuild(&mut self, store: &LocalStore) {
        self.matched.clear();
        self.order.clear();
        for (key, row) in store.scan() {
            if self.spec.matches(row) {
                self.order.insert(self.spec.sort_key(key, row));
                self.matched.insert(key.clone(), row.clone());
            }
        }
        self.window = self.compute_window();
    }

    /// Apply a change set. Returns `true` if the visible window changed.
    fn apply(&mut self, store: &LocalStore, changed: &ChangeSet) -> bool {
        let mut touched = false;
        for key in changed {
            if let Some(old) = self.matched.remove(key) {
                self.order.remove(&self.spec.sort_key(key, &old));
                touched = true;
            }
            if let Some(row) = store.get(key) {
                if self.spec.matches(row) {
                    self.order.insert(self.spec.sort_key(key, row));
                    self.matched.insert(key.clone(), row.clone());
                    touched = true;
                }
            }
        }
        if !touched {
            return false;
        }
        let window = self.compute_window();
        if window == self.window {
            return false;
        }
        self.window = window;
        true
    }

    fn compute_window(&self) -> Vec<(Key, Row)> {
        let take = self.spec.limit.unwrap_or(usize::MAX);
        self.order
            .iter()
            .skip(self.spec.offset)
            .take(take)
            .filter_map(|sk| self.matched.get(&sk.key).map(|row| (sk.key.clone(), row.clone())))
            .collect()
    }
}

/// Identifier of a registered query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

type Callback = Arc<dyn Fn(&QueryResult) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Channel(mpsc::UnboundedSender<QueryResult>),
    Callback(Callback),
}

struct Registered {
    state: QueryState,
    sink: Sink,
    active: Arc<AtomicBool>,
    version: u64,
}

struct Delivery {
    sink: Sink,
    active: Arc<AtomicBool>,
    result: QueryResult,
}

impl Delivery {
    fn deliver(self, collection: &str) {
        if !self.active.load(AtomicOrdering::Acquire) {
            return;
        }
        match self.sink {
            Sink::Channel(tx) => {
                let _ = tx.send(self.result);
            }
            Sink::Callback(cb) => {
                // Subscriber panics stop at this delivery
                let result = &self.result;
                if panic::catch_unwind(AssertUnwindSafe(|| cb(result))).is_err() {
                    warn!(collection = %collection, version = result.version, "Live query callback panicked, result dropped");
                }
            }
        }
    }
}

/// Clears the draining flag even if delivery unwinds.
struct Draining<'a>(&'a AtomicBool);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

#[derive(Default)]
struct RegistryState {
    ready: bool,
    stale: bool,
    closed: bool,
    next_id: u64,
    queries: HashMap<QueryId, Registered>,
}

impl RegistryState {
    fn emit(&mut self, id: QueryId, outbox: &mut VecDeque<Delivery>) {
        let stale = self.stale;
        if let Some(q) = self.queries.get_mut(&id) {
            q.version += 1;
            outbox.push_back(Delivery {
                sink: q.sink.clone(),
                active: Arc::clone(&q.active),
                result: QueryResult {
                    rows: q.state.window.clone(),
                    stale,
                    version: q.version,
                },
            });
        }
    }
}

/// Live queries registered on one collection.
///
/// Every method that takes a `&LocalStore` must be called with the store
/// lock held (read for `register`, write otherwise), which is what keeps
/// query state in step with the store.
pub struct QueryRegistry {
    collection: String,
    state: Mutex<RegistryState>,
    outbox: Mutex<VecDeque<Delivery>>,
    delivering: AtomicBool,
}

impl QueryRegistry {
    pub(crate) fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            state: Mutex::new(RegistryState::default()),
            outbox: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn outbox(&self) -> MutexGuard<'_, VecDeque<Delivery>> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of active queries.
    pub fn len(&self) -> usize {
        self.state().queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the collection has caught up at least once.
    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    fn register(&self, store: &LocalStore, spec: QuerySpec, sink: Sink) -> Option<(QueryId, Arc<AtomicBool>)> {
        let mut st = self.state();
        if st.closed {
            return None;
        }
        st.next_id += 1;
        let id = QueryId(st.next_id);
        let active = Arc::new(AtomicBool::new(true));
        let mut state = QueryState::new(spec);
        if st.ready {
            state.rebuild(store);
        }
        st.queries.insert(
            id,
            Registered {
                state,
                sink,
                active: Arc::clone(&active),
                version: 0,
            },
        );
        if st.ready {
            st.emit(id, &mut self.outbox());
        }
        metrics::set_active_queries(&self.collection, st.queries.len());
        debug!(collection = %self.collection, query_id = id.0, "Live query registered");
        Some((id, active))
    }

    /// Register a query whose results go to a channel.
    pub(crate) fn subscribe(self: &Arc<Self>, store: &LocalStore, spec: QuerySpec) -> LiveQuery {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.register(store, spec, Sink::Channel(tx)) {
            Some((id, active)) => LiveQuery {
                id,
                registry: Arc::clone(self),
                rx,
                active,
            },
            // Closed: the sender is already dropped, so the stream ends at once
            None => LiveQuery {
                id: QueryId(0),
                registry: Arc::clone(self),
                rx,
                active: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Register a query whose results go to a callback.
    pub(crate) fn subscribe_callback<F>(
        self: &Arc<Self>,
        store: &LocalStore,
        spec: QuerySpec,
        callback: F,
    ) -> QuerySubscription
    where
        F: Fn(&QueryResult) + Send + Sync + 'static,
    {
        let (id, active) = self
            .register(store, spec, Sink::Callback(Arc::new(callback)))
            .unwrap_or_else(|| (QueryId(0), Arc::new(AtomicBool::new(false))));
        QuerySubscription {
            id,
            registry: Arc::clone(self),
            active,
        }
    }

    /// Stop a query. Idempotent.
    pub fn unsubscribe(&self, id: QueryId) {
        let mut st = self.state();
        if let Some(q) = st.queries.remove(&id) {
            q.active.store(false, AtomicOrdering::Release);
            metrics::set_active_queries(&self.collection, st.queries.len());
            debug!(collection = %self.collection, query_id = id.0, "Live query released");
        }
    }

    /// Latest result of a query, if it has emitted.
    pub fn current(&self, id: QueryId) -> Option<QueryResult> {
        let st = self.state();
        let q = st.queries.get(&id)?;
        if !st.ready || q.version == 0 {
            return None;
        }
        Some(QueryResult {
            rows: q.state.window.clone(),
            stale: st.stale,
            version: q.version,
        })
    }

    /// Re-evaluate queries affected by `changed`.
    pub(crate) fn on_change(&self, store: &LocalStore, changed: &ChangeSet) {
        if changed.is_empty() {
            return;
        }
        let mut st = self.state();
        if !st.ready {
            return;
        }
        let mut outbox = self.outbox();
        let ids: Vec<QueryId> = st.queries.keys().copied().collect();
        for id in ids {
            let emit = match st.queries.get_mut(&id) {
                Some(q) => q.state.apply(store, changed),
                None => false,
            };
            if emit {
                trace!(collection = %self.collection, query_id = id.0, "Live query result changed");
                st.emit(id, &mut outbox);
            }
        }
    }

    /// First catch-up: evaluate every query and emit its initial result.
    pub(crate) fn mark_ready(&self, store: &LocalStore) {
        let mut st = self.state();
        if st.ready {
            return;
        }
        st.ready = true;
        let mut outbox = self.outbox();
        let ids: Vec<QueryId> = st.queries.keys().copied().collect();
        for id in ids {
            if let Some(q) = st.queries.get_mut(&id) {
                q.state.rebuild(store);
            }
            st.emit(id, &mut outbox);
        }
    }

    /// Flip the staleness flag, re-emitting results so subscribers see it.
    pub(crate) fn set_stale(&self, stale: bool) {
        let mut st = self.state();
        if st.stale == stale {
            return;
        }
        st.stale = stale;
        if !st.ready {
            return;
        }
        let mut outbox = self.outbox();
        let ids: Vec<QueryId> = st.queries.keys().copied().collect();
        for id in ids {
            st.emit(id, &mut outbox);
        }
    }

    /// Release every query. Their streams end.
    pub(crate) fn close(&self) {
        let mut st = self.state();
        st.closed = true;
        for (_, q) in st.queries.drain() {
            q.active.store(false, AtomicOrdering::Release);
        }
        metrics::set_active_queries(&self.collection, 0);
    }

    /// Deliver queued results. Call without holding the store lock.
    ///
    /// Only one thread drains at a time; a flush that finds another one
    /// draining returns and leaves its results to that thread.
    pub(crate) fn flush(&self) {
        loop {
            if self
                .delivering
                .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
                .is_err()
            {
                return;
            }
            let draining = Draining(&self.delivering);
            loop {
                let next = self.outbox().pop_front();
                match next {
                    Some(delivery) => {
                        metrics::record_query_emit(&self.collection);
                        delivery.deliver(&self.collection);
                    }
                    None => break,
                }
            }
            drop(draining);
            if self.outbox().is_empty() {
                return;
            }
        }
    }
}

/// Stream of results for one query.
///
/// Ends when unsubscribed, dropped, or when the collection closes.
pub struct LiveQuery {
    id: QueryId,
    registry: Arc<QueryRegistry>,
    rx: mpsc::UnboundedReceiver<QueryResult>,
    active: Arc<AtomicBool>,
}

impl LiveQuery {
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Wait for the next result.
    pub async fn recv(&mut self) -> Option<QueryResult> {
        if !self.is_active() {
            return None;
        }
        self.rx.recv().await
    }

    /// Next result if one is already queued.
    pub fn try_recv(&mut self) -> Option<QueryResult> {
        if !self.is_active() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Latest emitted result. `None` before the collection is ready.
    pub fn current(&self) -> Option<QueryResult> {
        self.registry.current(self.id)
    }

    /// Check if the query is still registered.
    pub fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::Acquire)
    }

    /// Stop receiving results. Idempotent.
    pub fn unsubscribe(&self) {
        self.active.store(false, AtomicOrdering::Release);
        self.registry.unsubscribe(self.id);
    }
}

impl Stream for LiveQuery {
    type Item = QueryResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.is_active() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Callback registration. Dropping it unsubscribes.
pub struct QuerySubscription {
    id: QueryId,
    registry: Arc<QueryRegistry>,
    active: Arc<AtomicBool>,
}

impl QuerySubscription {
    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::Acquire)
    }

    /// Latest emitted result.
    pub fn current(&self) -> Option<QueryResult> {
        self.registry.current(self.id)
    }

    /// Stop callbacks. Idempotent.
    pub fn unsubscribe(&self) {
        self.active.store(false, AtomicOrdering::Release);
        self.registry.unsubscribe(self.id);
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
