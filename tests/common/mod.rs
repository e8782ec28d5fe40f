//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Mock WriteHandler for recording and answering writes
//! - Seeded in-memory shape sources
//! - Row and polling helpers

#![allow(dead_code)]

pub mod mock_writer;

pub use mock_writer::*;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use sync_collection::store::Row;
use sync_collection::{Collection, CollectionConfig, LiveQuery, MemoryShapeSource, QueryResult};

/// Convert a JSON object literal into a row.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

pub fn todo(id: &str, title: &str, completed: bool) -> Row {
    row(json!({"id": id, "title": title, "completed": completed}))
}

/// A `todos` source with todo-1..todo-3, none completed.
pub fn seeded_source() -> Arc<MemoryShapeSource> {
    let source = Arc::new(MemoryShapeSource::new("todos"));
    source.insert("todo-1", todo("todo-1", "milk", false));
    source.insert("todo-2", todo("todo-2", "eggs", false));
    source.insert("todo-3", todo("todo-3", "bread", false));
    source
}

/// Open a `todos` collection over `source` with `writer` and test timeouts.
pub fn open_todos(source: &Arc<MemoryShapeSource>, writer: &Arc<MockWriter>) -> Collection {
    open_with(source, writer, CollectionConfig::for_testing("todos", "todos"))
}

pub fn open_with(source: &Arc<MemoryShapeSource>, writer: &Arc<MockWriter>, config: CollectionConfig) -> Collection {
    Collection::builder(config, source.clone())
        .write_handler(writer.clone())
        .open()
        .expect("failed to open collection")
}

/// Poll `check` until it holds, failing the test after 5 seconds.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next live query result, failing the test after 5 seconds.
pub async fn next_result(query: &mut LiveQuery) -> QueryResult {
    tokio::time::timeout(Duration::from_secs(5), query.recv())
        .await
        .expect("no query result in time")
        .expect("query stream ended")
}

/// Results already queued on a live query.
pub fn drain(query: &mut LiveQuery) -> Vec<QueryResult> {
    let mut results = Vec::new();
    while let Some(result) = query.try_recv() {
        results.push(result);
    }
    results
}

/// Keys of a result, as strings.
pub fn keys(result: &QueryResult) -> Vec<String> {
    result.keys().into_iter().map(|k| k.to_string()).collect()
}
