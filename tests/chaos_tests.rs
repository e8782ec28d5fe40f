// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or data corruption.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sync_collection::stream::parse_messages;
use sync_collection::{Collection, CollectionStatus, MemoryShapeSource, Offset, QuerySpec, SyncError};
use tokio::time::{sleep, timeout};

/// Every key in `keys` reads the same locally as in the source.
fn converged(collection: &Collection, source: &MemoryShapeSource, keys: &[String]) -> bool {
    keys.iter()
        .all(|k| collection.get(k.as_str()) == source.row(k))
}

fn key_list(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("todo-{}", i)).collect()
}

// =============================================================================
// Flaky Transport
// =============================================================================

/// Test: Injected fetch failures with small, overlapping chunks still converge
#[tokio::test]
async fn flaky_chunked_redelivery_converges() {
    let source = Arc::new(MemoryShapeSource::new("todos"));
    let keys = key_list(40);
    for key in &keys {
        source.insert(key.as_str(), todo(key, "initial", false));
    }
    source.set_chunk_size(3);
    source.set_redelivery(2);
    source.fail_next(4);

    let writer = MockWriter::new(Arc::clone(&source));
    let todos = open_todos(&source, &writer);
    timeout(Duration::from_secs(5), todos.wait_ready()).await.unwrap().unwrap();

    for (round, key) in keys.iter().enumerate() {
        if round % 7 == 0 {
            source.fail_next(2);
        }
        match round % 3 {
            0 => {
                source.update(key.as_str(), row(json!({"title": format!("round {}", round)})));
            }
            1 => {
                source.delete(key.as_str());
            }
            _ => {
                source.insert(key.as_str(), todo(key, "replaced", true));
            }
        }
    }

    eventually(|| converged(&todos, &source, &keys)).await;
    assert_eq!(todos.cursor().offset, source.head());
    eventually(|| todos.status() == CollectionStatus::Ready).await;
    todos.close().await;
}

/// Test: Delete then reinsert of the same key survives one-at-a-time redelivery
#[tokio::test]
async fn delete_reinsert_with_redelivery() {
    let source = seeded_source();
    let writer = MockWriter::new(Arc::clone(&source));
    let todos = open_todos(&source, &writer);
    todos.wait_ready().await.unwrap();

    source.set_chunk_size(1);
    source.set_redelivery(3);
    source.insert("a", todo("a", "first", false));
    source.delete("a");
    source.insert("a", todo("a", "second", true));
    source.update("a", row(json!({"title": "third"})));

    eventually(|| todos.get("a").map(|r| r["title"] == json!("third")).unwrap_or(false)).await;
    assert_eq!(todos.get("a"), source.row("a"));
    assert_eq!(todos.get("a").unwrap()["completed"], json!(true));
    todos.close().await;
}

/// Test: A long outage marks the collection stale and it recovers afterwards
#[tokio::test]
async fn long_outage_then_recovery() {
    let source = seeded_source();
    let writer = MockWriter::new(Arc::clone(&source));
    let todos = open_todos(&source, &writer);
    todos.wait_ready().await.unwrap();

    source.fail_next(20);
    source.update("todo-1", row(json!({"title": "oat milk"})));

    // Reads keep working throughout
    for _ in 0..10 {
        assert_eq!(todos.len(), 3);
        sleep(Duration::from_millis(10)).await;
    }

    eventually(|| todos.get("todo-1").map(|r| r["title"] == json!("oat milk")).unwrap_or(false)).await;
    eventually(|| todos.status() == CollectionStatus::Ready).await;
    todos.close().await;
}

// =============================================================================
// Compaction
// =============================================================================

/// Test: Compaction between and during writes ends with the source's rows
#[tokio::test]
async fn compaction_mid_stream_converges() {
    let source = seeded_source();
    let writer = MockWriter::new(Arc::clone(&source));
    let todos = open_todos(&source, &writer);
    todos.wait_ready().await.unwrap();
    let first_handle = source.handle();

    let keys = key_list(20);
    for (i, key) in keys.iter().enumerate() {
        source.insert(key.as_str(), todo(key, "x", false));
        if i == 5 {
            source.compact();
        }
        if i == 12 {
            source.compact_with_must_refetch();
        }
    }
    source.delete("todo-2");

    let mut all = keys.clone();
    all.push("todo-2".to_string());
    eventually(|| converged(&todos, &source, &all)).await;
    eventually(|| todos.cursor().handle.as_deref() == Some(source.handle().as_str())).await;
    assert_ne!(source.handle(), first_handle);
    todos.close().await;
}

/// Test: Pending optimistic writes survive a compaction and still resolve
#[tokio::test]
async fn compaction_with_pending_writes() {
    let source = seeded_source();
    let writer = MockWriter::new(Arc::clone(&source));
    let todos = Arc::new(open_todos(&source, &writer));
    todos.wait_ready().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let todos = Arc::clone(&todos);
        tasks.push(tokio::spawn(async move {
            let id = format!("new-{}", i);
            let handle = todos.insert(json!({"id": id, "title": "n", "completed": false})).await?;
            handle.confirmed().await
        }));
        if i == 4 {
            source.compact_with_must_refetch();
        }
    }

    for task in tasks {
        // Confirmed, or timed out when the confirming txid was compacted away
        match task.await.unwrap() {
            Ok(_) | Err(SyncError::ConfirmationTimeout { .. }) => {}
            Err(other) => panic!("unexpected outcome: {}", other),
        }
    }

    // Every write was committed, so every row ends up in the base either way
    let keys: Vec<String> = (0..10).map(|i| format!("new-{}", i)).collect();
    eventually(|| converged(&todos, &source, &keys)).await;
    assert_eq!(todos.pending_mutations(), 0);
    todos.close().await;
}

// =============================================================================
// Concurrency
// =============================================================================

/// Test: Many concurrent writers on few keys end consistent with the source
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_converge() {
    let source = seeded_source();
    let writer = MockWriter::new(Arc::clone(&source));
    let todos = Arc::new(open_todos(&source, &writer));
    todos.wait_ready().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..30 {
        let todos = Arc::clone(&todos);
        tasks.push(tokio::spawn(async move {
            let key = format!("todo-{}", 1 + i % 3);
            let handle = todos.update(key, json!({"title": format!("w{}", i)})).await?;
            handle.confirmed().await
        }));
    }

    let outcome = timeout(Duration::from_secs(10), futures::future::join_all(tasks))
        .await
        .expect("writers deadlocked");
    for result in outcome {
        result.unwrap().unwrap();
    }

    let keys = vec!["todo-1".to_string(), "todo-2".to_string(), "todo-3".to_string()];
    eventually(|| converged(&todos, &source, &keys)).await;
    assert_eq!(todos.pending_mutations(), 0);
    todos.close().await;
}

/// Test: Rejected writes under load all roll back
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_writes_roll_back_under_load() {
    let source = seeded_source();
    let writer = MockWriter::rejecting(Arc::clone(&source), "database unavailable");
    let todos = Arc::new(open_todos(&source, &writer));
    todos.wait_ready().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let todos = Arc::clone(&todos);
        tasks.push(tokio::spawn(async move {
            todos.update(format!("todo-{}", 1 + i % 3), json!({"title": "lost"})).await
        }));
    }
    for task in tasks {
        assert!(matches!(task.await.unwrap(), Err(SyncError::WriteRejected { .. })));
    }

    assert_eq!(todos.pending_mutations(), 0);
    let keys = vec!["todo-1".to_string(), "todo-2".to_string(), "todo-3".to_string()];
    assert!(converged(&todos, &source, &keys));
    todos.close().await;
}

/// Test: Close while writers and queries are busy finishes without deadlock
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_under_load() {
    let source = seeded_source();
    let writer = MockWriter::new(Arc::clone(&source));
    writer.set_ack_delay(Duration::from_millis(20));
    let todos = Arc::new(open_todos(&source, &writer));
    todos.wait_ready().await.unwrap();

    let mut queries: Vec<_> = (0..5).map(|_| todos.live_query(QuerySpec::all())).collect();

    let mut tasks = Vec::new();
    for i in 0..50 {
        let todos = Arc::clone(&todos);
        tasks.push(tokio::spawn(async move {
            let id = format!("load-{}", i);
            todos.insert(json!({"id": id, "title": "t", "completed": false})).await
        }));
    }
    sleep(Duration::from_millis(30)).await;

    timeout(Duration::from_secs(5), todos.close())
        .await
        .expect("close deadlocked");

    for task in tasks {
        match timeout(Duration::from_secs(5), task).await.expect("writer hung").unwrap() {
            Ok(_) | Err(SyncError::Closed(_)) | Err(SyncError::Cancelled { .. }) => {}
            Err(other) => panic!("unexpected outcome: {}", other),
        }
    }

    // Every query stream ends
    for query in &mut queries {
        let ended = timeout(Duration::from_secs(5), async {
            while query.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok(), "query stream did not end");
    }
    assert_eq!(todos.status(), CollectionStatus::Closed);
    assert_eq!(todos.pending_mutations(), 0);
}

/// Test: Dropping an open collection without closing it doesn't panic
#[tokio::test]
async fn drop_without_close() {
    let source = seeded_source();
    let writer = MockWriter::new(Arc::clone(&source));
    writer.close_gate();
    let todos = Arc::new(open_todos(&source, &writer));
    todos.wait_ready().await.unwrap();

    let pending = {
        let todos = Arc::clone(&todos);
        tokio::spawn(async move { todos.update("todo-1", json!({"title": "x"})).await })
    };
    eventually(|| writer.intents().len() == 1).await;
    drop(todos);
    writer.release(1);

    // The spawned write holds the last reference, so the drop happens when it resolves
    let _ = timeout(Duration::from_secs(5), pending).await.expect("write hung");
}

// =============================================================================
// Malformed Wire Data
// =============================================================================

/// Test: Malformed shape log bodies return errors, never panic
#[test]
fn malformed_bodies_no_panic() {
    let bodies = [
        "{",
        "[{\"headers\": {\"operation\": \"insert\"}}]",
        "[{\"key\": 1, \"headers\": {}}]",
        "[{\"key\": \"a\", \"value\": 5, \"headers\": {\"operation\": \"insert\"}}]",
        "[{\"key\": \"a\", \"headers\": {\"operation\": \"insert\", \"txids\": [\"x\"]}}]",
        "[{\"key\": \"a\", \"offset\": \"garbage\", \"headers\": {\"operation\": \"update\"}}]",
        "null",
        "\u{0}",
    ];

    for (i, body) in bodies.iter().enumerate() {
        let result = parse_messages(body, Offset::new(1, 0));
        println!("Body {}: {:?}", i, result.as_ref().map(|m| m.len()));
    }
}

/// Test: Empty and control-only bodies parse cleanly
#[test]
fn control_only_bodies() {
    assert!(parse_messages("", Offset::Initial).unwrap().is_empty());
    assert!(parse_messages("   ", Offset::Initial).unwrap().is_empty());
    let messages = parse_messages(
        "[{\"headers\": {\"control\": \"up-to-date\"}}, {\"headers\": {\"control\": \"snapshot-end\"}}]",
        Offset::Initial,
    )
    .unwrap();
    assert_eq!(messages.len(), 1);
}
